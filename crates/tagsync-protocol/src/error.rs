//! Protocol error types

use thiserror::Error;

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Message has no type")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownMessage(String),

    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
