//! DPGO Protocols - leader-driven coordination of distributed pose-graph optimization
//!
//! A team of robots jointly optimizes a pose graph. Each robot owns its own
//! trajectory and talks to its peers only through public poses, shared loop
//! closures and a handful of commands. This crate implements the protocol
//! that keeps the team in step.
//!
//! # Overview
//!
//! ## Round coordination
//!
//! The [`Coordinator`] is a sans-IO state machine, one per robot. Robot 0 is
//! the leader:
//!
//! - **Startup**: the leader starts a run by asking everyone for their pose
//!   graph, distributes the lifting matrix and sends INITIALIZE once every
//!   active robot reports it is initialized
//! - **Rounds**: each round the leader picks one robot (uniformly or
//!   round-robin) and sends it an UPDATE; in synchronous mode it waits for
//!   the robot's status before the next round
//! - **Staleness**: no robot gets further than `max_delayed_iterations`
//!   ahead of the slowest active robot
//! - **Termination**: after `max_iterations` rounds, or when every active
//!   robot reports its relative change is under tolerance
//!
//! ## Public state
//!
//! Public poses are merged into a [`PublicStateCache`] with last-writer-wins
//! on iteration stamps. Poses outside the active cluster are kept but never
//! fed to the optimizer.
//!
//! ## Runtime
//!
//! [`CoordinatorRuntime`] binds a coordinator to a [`dpgo_transfer::MessageBus`]
//! and drives it from a tokio interval.
//!
//! # Example
//!
//! ```rust,ignore
//! use dpgo_protocols::{Coordinator, CoordinatorRuntime};
//!
//! let mut coordinator = Coordinator::new(RobotId(1), config, optimizer)?;
//! coordinator.submit_pose_graph(measurements);
//!
//! let mut runtime = CoordinatorRuntime::new(coordinator, bus.endpoint(RobotId(1)));
//! runtime.wait_for_leader(Duration::from_secs(30)).await?;
//! let handle = runtime.spawn();
//! // ...
//! let coordinator = handle.shutdown().await?;
//! let trajectory = coordinator.trajectory()?;
//! ```

pub mod barrier;
pub mod cache;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod init;
pub mod log;
pub mod message;
pub mod optimizer;
pub mod request;
pub mod runtime;
pub mod schedule;

#[cfg(test)]
mod testing;

pub use barrier::{Readiness, SyncBarrier};
pub use cache::PublicStateCache;
pub use connectivity::{ConnectivityMonitor, PeerRecord};
pub use coordinator::{Coordinator, Mode, RoundState};
pub use error::{Error, Result};
pub use log::{IterationLog, IterationRecord};
pub use message::{Command, Envelope, Message, Request, RequestId, Response, Status};
pub use optimizer::{LocalGraph, LocalOptimizer, UpdateResult};
pub use runtime::{CoordinatorRuntime, Progress, RuntimeHandle};
pub use schedule::UpdateScheduler;
