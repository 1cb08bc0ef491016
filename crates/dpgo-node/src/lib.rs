//! DPGO Node - a simulated robot team running the coordination protocol
//!
//! Provides:
//! - [`AveragingOptimizer`], a stand-in local solver with the data flow of
//!   a real one (neighbor poses in, public poses and robust weights out)
//! - [`synthetic_pose_graph`] for multi-robot test problems
//! - [`Fleet`], N coordinators on one in-process bus, each on its own task
//! - [`NodeConfig`], read from `DPGO_*` environment variables by the binary

pub mod config;
pub mod fleet;
pub mod sim;

pub use config::NodeConfig;
pub use fleet::{build_runtimes, Fleet, FleetConfig, DETACHED_CLUSTER};
pub use sim::{synthetic_pose_graph, AveragingOptimizer, GraphSpec};
