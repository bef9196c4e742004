//! Transport error types

use std::time::Duration;

use hsrv_protocol::ProtocolError;
use thiserror::Error;

/// Errors that end a session without a response
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Idle timeout after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Pending data exceeds limit: {size} > {max}")]
    BufferOverflow { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::LineTooLong { size, max } => TransportError::BufferOverflow { size, max },
            other => TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                other.to_string(),
            )),
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
