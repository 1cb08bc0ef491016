//! Error types for dpgo-transfer.

use thiserror::Error;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur on the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Every other endpoint of the bus has been dropped.
    #[error("message bus closed")]
    Closed,
}
