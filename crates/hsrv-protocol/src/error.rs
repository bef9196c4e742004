//! Protocol error types

use thiserror::Error;

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Missing argument: {0}")]
    MissingArgument(String),

    #[error("Line too long: {size} > {max}")]
    LineTooLong { size: usize, max: usize },

    #[error("Core error: {0}")]
    Core(#[from] hsrv_core::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
