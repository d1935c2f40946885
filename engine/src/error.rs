//! Error taxonomy shared by the reconciliation and dispatch paths

use std::time::Duration;
use thiserror::Error;
use twinlink_shared::schema::SchemaError;

#[derive(Error, Debug)]
pub enum TwinError {
    /// Bounds refused at configuration time
    #[error("invalid bounds: min {min} must be below max {max}")]
    InvalidBounds { min: f64, max: f64 },

    /// Proposed value falls outside the configured bounds
    #[error("value {value} out of range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    /// Payload could not be decoded
    #[error("malformed payload: {0}")]
    Parse(#[from] SchemaError),

    /// No handler registered for (component, name)
    #[error("unknown command: {component}/{name}")]
    UnknownCommand { component: String, name: String },

    /// A command handler failed; the original cause is attached when the
    /// failure happened locally
    #[error("command failed: {message}")]
    CommandFailed {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The transport collaborator could not deliver
    #[error("transport error: {0}")]
    Transport(String),

    /// No reply arrived within the caller-supplied deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl TwinError {
    /// Wrap a local handler failure, keeping the cause in the chain
    pub fn command_failed(cause: anyhow::Error) -> Self {
        Self::CommandFailed {
            message: cause.to_string(),
            source: Some(cause.into()),
        }
    }

    /// A failure reported by the remote end; only its message survives
    /// the wire
    pub fn remote_failure(message: impl Into<String>) -> Self {
        Self::CommandFailed {
            message: message.into(),
            source: None,
        }
    }
}
