//! DPGO Transfer - broadcast message bus between robot coordinators
//!
//! This crate provides:
//! - Framing types: a [`Frame`] is a header naming the channel, sender and
//!   optional addressee, plus an opaque encoded body
//! - The [`MessageBus`] contract the coordination protocol is written against
//! - [`LocalBus`], an in-process hub over `tokio::sync::broadcast` used by the
//!   simulated fleet and the tests
//!
//! # Delivery Model
//!
//! The bus promises nothing about ordering or reliability across peers.
//! Frames can be dropped (configurable loss, lagging receivers, isolated
//! robots) and the protocol above is expected to cope through stamps and
//! timeouts. Receiving never blocks: callers drain with
//! [`MessageBus::try_recv`] from their own tick.
//!
//! # Example
//!
//! ```rust,ignore
//! use dpgo_transfer::{Channel, Frame, LocalBus, MessageBus};
//!
//! let bus = LocalBus::new(1024);
//! let mut leader = bus.endpoint(RobotId(0));
//! let mut follower = bus.endpoint(RobotId(1));
//!
//! leader.publish(Frame::broadcast(Channel::Command, RobotId(0), body))?;
//! while let Some(frame) = follower.try_recv()? {
//!     handle(frame);
//! }
//! ```

pub mod bus;
pub mod error;
pub mod local;
pub mod types;

pub use bus::MessageBus;
pub use error::{BusError, Result};
pub use local::{LocalBus, LocalEndpoint, LossModel};
pub use types::{Channel, Frame, FrameHeader, SeqNo};
