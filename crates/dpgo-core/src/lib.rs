//! DPGO Core - shared data model for distributed pose-graph coordination.
//!
//! Every robot in the fleet owns a shard of a global pose graph. This crate
//! holds the vocabulary the coordination protocol speaks in:
//!
//! - **Identifiers**: [`RobotId`], [`PoseId`], [`EdgeKey`]
//! - **Public state**: [`PublicPose`] values exchanged between robots, tagged
//!   with the cluster they belong to and the iteration that produced them
//! - **Constraints**: [`Measurement`] and [`MeasurementWeight`], with the
//!   odometry / private / shared classification derived on demand
//! - **Parameters**: [`OptimizerParams`] and [`ProtocolParams`], composed into
//!   a [`CoordinatorConfig`]
//!
//! # Clusters
//!
//! A pose is only usable as optimization input once it has merged into the
//! globally connected component, [`ACTIVE_CLUSTER`]. Poses from unmerged
//! islands are carried around but never consumed.

pub mod config;
pub mod types;

pub use config::{ConfigError, CoordinatorConfig, OptimizerParams, ProtocolParams, UpdateRule};
pub use types::{
    ClusterId, EdgeKey, Matrix, Measurement, MeasurementKind, MeasurementWeight, PoseId,
    PublicPose, RobotId, Vector, ACTIVE_CLUSTER,
};
