//! Error types for dpgo-protocols.

use std::time::Duration;

use dpgo_core::ConfigError;
use dpgo_transfer::BusError;
use thiserror::Error;

/// Result type for dpgo-protocols operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating a run.
#[derive(Debug, Error)]
pub enum Error {
    /// The message bus failed underneath the coordinator.
    #[error("message bus error: {0}")]
    Bus(#[from] BusError),

    /// Parameters were rejected at startup.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The iteration log could not be written.
    #[error("iteration log error: {0}")]
    Io(#[from] std::io::Error),

    /// The coordinator is in an invalid state for the requested operation.
    #[error("invalid coordinator state: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    /// A peer sent something that breaks the protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Distributed initialization did not finish in the allotted steps.
    #[error("distributed initialization failed after {steps} steps")]
    InitializationExhausted { steps: u32 },

    /// The leader never showed up during startup.
    #[error("leader unreachable after {0:?}")]
    LeaderUnreachable(Duration),

    /// A spawned runtime task panicked or was cancelled.
    #[error("runtime task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
