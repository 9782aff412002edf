//! Configuration parsing for ploinky
//!
//! This crate handles parsing of:
//! - Global configuration (`~/.config/ploinky/config.toml` plus `PLOINKY_*` env)
//! - Agent manifests (`manifest.json` per agent)
//! - The workspace routing table (`.ploinky/routing.json`)
//! - The workspace secrets file (`.ploinky/secrets`)

mod error;
mod global;
mod manifest;
mod routing;
mod secrets;
mod substitute;

pub use error::*;
pub use global::*;
pub use manifest::*;
pub use routing::*;
pub use secrets::*;
pub use substitute::*;
