//! # Error Taxonomy
//!
//! Every failure the sync engine can report falls into one of four kinds.
//! Errors are values: each async operation returns them through `Result`,
//! and long-running loops hand them to observers instead of panicking.

use thiserror::Error;

/// Errors reported by the SensorThings sync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Caller-supplied input is malformed (extent, projection, URL, points).
    #[error("Validation error: {0}")]
    Validation(String),

    /// A server response violates the expected paging envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Network or socket failure on HTTP or MQTT.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The operation is not possible in the current client state or
    /// protocol revision.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Shorthand for results carrying a [`SyncError`].
pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Short machine-friendly name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "validation",
            SyncError::Protocol(_) => "protocol",
            SyncError::Transport(_) => "transport",
            SyncError::Configuration(_) => "configuration",
        }
    }
}
