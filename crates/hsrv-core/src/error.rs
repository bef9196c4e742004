//! Error types for hsrv Core

use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed digest: {0}")]
    MalformedDigest(String),

    #[error("Corrupt hash source at line {line}: {content}")]
    CorruptSource { line: usize, content: String },

    #[error("Duplicate entry in hash source: {0}")]
    DuplicateEntry(String),

    #[error("Allocation failure: {0}")]
    AllocationFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for hsrv Core operations
pub type Result<T> = std::result::Result<T, Error>;
