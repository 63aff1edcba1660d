//! Crate-wide error type.
//!
//! Only failures that cross a public API boundary are represented here. Faults that the runtime
//! can recover from locally (a malformed frame on an otherwise healthy connection, an unknown
//! stream selector, a second concurrent module transfer) are logged and the affected unit of work
//! is dropped instead of being threaded through a `Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EstuaryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode control message: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode control message: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("operator '{0}' not found in any loaded module")]
    OperatorNotFound(String),

    #[error("module archive error: {0}")]
    Module(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("deployment descriptor error: {0}")]
    Deployment(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, EstuaryError>;
