//! Core logic for ploinky agent-fleet supervision
//!
//! This crate provides:
//! - The workspace store (`agents.json`, `routing.json`, secrets)
//! - Deterministic container identity and env-hash recreation
//! - The lifecycle engine (create, hooks, start, stop, destroy)
//! - Liveness/readiness probing with crash-loop backoff
//! - The container monitor consuming the runtime event stream
//! - A generic process/container supervisor with a circuit breaker

mod envhash;
mod error;
mod events;
mod lifecycle;
mod monitor;
mod mounts;
mod naming;
mod ports;
mod prober;
mod record;
mod store;
mod supervisor;

pub use envhash::*;
pub use error::*;
pub use events::*;
pub use lifecycle::*;
pub use monitor::*;
pub use mounts::*;
pub use naming::*;
pub use ports::*;
pub use prober::*;
pub use record::*;
pub use store::*;
pub use supervisor::*;

#[cfg(test)]
pub mod test_support;
