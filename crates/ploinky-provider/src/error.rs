//! Error types for container runtimes

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Failed to connect to container runtime: {0}")]
    ConnectionError(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container runtime error: {0}")]
    CommandFailed(String),

    #[error("Exec failed: {0}")]
    ExecError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse runtime output: {0}")]
    ParseError(String),

    #[error("Timeout waiting for operation")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
