//! Error types for tagsync core

use thiserror::Error;

/// Core error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid bot ID: {0}")]
    InvalidBotId(String),

    #[error("Edit out of range: {op} of {count} at position {position} exceeds length {length}")]
    EditOutOfRange {
        op: &'static str,
        count: usize,
        position: usize,
        length: usize,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for tagsync core operations
pub type Result<T> = std::result::Result<T, Error>;
