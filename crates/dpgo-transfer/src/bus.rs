//! The contract between the coordination protocol and its transport.

use dpgo_core::RobotId;

use crate::error::Result;
use crate::types::{Channel, Frame};

/// A robot's attachment point to the team-wide message bus.
///
/// Implementations deliver frames published by other robots on the
/// subscribed channels. Delivery may drop, duplicate or reorder frames;
/// frames published by the endpoint itself are never handed back to it.
pub trait MessageBus: Send {
    /// The robot this endpoint belongs to.
    fn robot(&self) -> RobotId;

    /// Publish a frame. The endpoint stamps the sender and sequence number.
    fn publish(&mut self, frame: Frame) -> Result<()>;

    /// Take the next delivered frame without blocking.
    ///
    /// Returns `Ok(None)` when nothing is pending.
    fn try_recv(&mut self) -> Result<Option<Frame>>;

    /// Restrict delivery to the given channels.
    fn subscribe(&mut self, channels: &[Channel]);
}
