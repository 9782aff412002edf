//! Error types for ploinky-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ploinky_config::ConfigError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] ploinky_provider::RuntimeError),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Hook failed ({hook}): {message}")]
    HookFailed { hook: String, message: String },

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    #[error("Invalid port spec: {0}")]
    InvalidPort(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Store corrupted: {0}")]
    StoreCorrupted(String),

    #[error("Store locked: {0}")]
    StoreLocked(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
