//! Identifiers, public poses and relative measurements.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Dense matrix used for poses, lifted poses and the lifting matrix.
pub type Matrix = DMatrix<f64>;

/// Dense column vector (measurement translations).
pub type Vector = DVector<f64>;

/// Connected-component identifier of a pose.
pub type ClusterId = u32;

/// The cluster every robot eventually merges into.
pub const ACTIVE_CLUSTER: ClusterId = 0;

/// Unique robot identifier, stable for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RobotId(pub u32);

impl RobotId {
    /// The statically designated leader.
    pub const LEADER: RobotId = RobotId(0);

    /// Whether this robot drives the global round progression.
    #[must_use]
    pub const fn is_leader(self) -> bool {
        self.0 == Self::LEADER.0
    }

    /// Position of this robot in per-team vectors.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for RobotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for RobotId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// A pose owned by one robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoseId {
    pub robot: RobotId,
    pub index: u32,
}

impl PoseId {
    pub const fn new(robot: RobotId, index: u32) -> Self {
        Self { robot, index }
    }
}

impl std::fmt::Display for PoseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.robot, self.index)
    }
}

/// A pose referenced by an inter-robot constraint, as published to the team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicPose {
    pub pose_id: PoseId,
    /// Component this pose currently belongs to.
    pub cluster: ClusterId,
    /// Pose (or lifted pose block) value.
    pub value: Matrix,
    /// Iteration of the owning robot that produced this value.
    pub stamp: u64,
}

impl PublicPose {
    pub fn new(pose_id: PoseId, cluster: ClusterId, value: Matrix, stamp: u64) -> Self {
        Self {
            pose_id,
            cluster,
            value,
            stamp,
        }
    }

    /// Whether this pose may be used as optimization input.
    #[must_use]
    pub fn is_active_cluster(&self) -> bool {
        self.cluster == ACTIVE_CLUSTER
    }

    /// Check if this value supersedes another value of the same pose.
    #[must_use]
    pub fn is_newer_than(&self, other: &PublicPose) -> bool {
        self.stamp > other.stamp
    }
}

/// Classification of a measurement, derived from its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementKind {
    /// Consecutive poses of the same robot.
    Odometry,
    /// Non-consecutive poses of the same robot.
    PrivateLoopClosure,
    /// Poses of two different robots.
    SharedLoopClosure,
}

/// Identifies a measurement by its two endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeKey {
    pub src: PoseId,
    pub dst: PoseId,
}

impl EdgeKey {
    pub const fn new(src: PoseId, dst: PoseId) -> Self {
        Self { src, dst }
    }

    /// The robot that owns the weight of this edge (lower index wins).
    #[must_use]
    pub fn responsible_robot(&self) -> RobotId {
        self.src.robot.min(self.dst.robot)
    }

    /// Check if the edge touches `robot`.
    #[must_use]
    pub fn involves(&self, robot: RobotId) -> bool {
        self.src.robot == robot || self.dst.robot == robot
    }
}

impl std::fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Relative pose constraint between two poses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub src: PoseId,
    pub dst: PoseId,
    /// Relative rotation from `src` to `dst`.
    pub rotation: Matrix,
    /// Relative translation from `src` to `dst`.
    pub translation: Vector,
    /// Rotational precision.
    pub kappa: f64,
    /// Translational precision.
    pub tau: f64,
    /// Current robust weight in `[0, 1]`.
    pub weight: f64,
    /// Weights of fixed measurements are never updated.
    pub fixed_weight: bool,
}

impl Measurement {
    /// Create a unit-precision measurement with full weight.
    pub fn new(src: PoseId, dst: PoseId, rotation: Matrix, translation: Vector) -> Self {
        Self {
            src,
            dst,
            rotation,
            translation,
            kappa: 1.0,
            tau: 1.0,
            weight: 1.0,
            fixed_weight: false,
        }
    }

    /// Set the rotational and translational precisions.
    #[must_use]
    pub fn with_precision(mut self, kappa: f64, tau: f64) -> Self {
        self.kappa = kappa;
        self.tau = tau;
        self
    }

    /// Mark this measurement's weight as fixed.
    #[must_use]
    pub fn with_fixed_weight(mut self) -> Self {
        self.fixed_weight = true;
        self
    }

    pub fn edge(&self) -> EdgeKey {
        EdgeKey::new(self.src, self.dst)
    }

    /// Derive the kind from endpoint robots and index adjacency.
    pub fn kind(&self) -> MeasurementKind {
        if self.src.robot != self.dst.robot {
            MeasurementKind::SharedLoopClosure
        } else if self.src.index + 1 == self.dst.index {
            MeasurementKind::Odometry
        } else {
            MeasurementKind::PrivateLoopClosure
        }
    }

    pub fn is_shared(&self) -> bool {
        self.kind() == MeasurementKind::SharedLoopClosure
    }

    /// Check if either endpoint belongs to `robot`.
    pub fn involves(&self, robot: RobotId) -> bool {
        self.edge().involves(robot)
    }

    /// For a shared loop closure seen from `robot`, the other robot's pose.
    pub fn remote_pose(&self, robot: RobotId) -> Option<PoseId> {
        if !self.is_shared() {
            return None;
        }
        if self.src.robot == robot {
            Some(self.dst)
        } else if self.dst.robot == robot {
            Some(self.src)
        } else {
            None
        }
    }
}

/// Robust weight of one measurement, published by its responsible robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementWeight {
    pub edge: EdgeKey,
    pub weight: f64,
    /// Whether the weight has stopped changing.
    pub converged: bool,
}

impl MeasurementWeight {
    pub fn new(edge: EdgeKey, weight: f64, converged: bool) -> Self {
        Self {
            edge,
            weight,
            converged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose(robot: u32, index: u32) -> PoseId {
        PoseId::new(RobotId(robot), index)
    }

    fn measurement(src: PoseId, dst: PoseId) -> Measurement {
        Measurement::new(src, dst, Matrix::identity(2, 2), Vector::zeros(2))
    }

    #[test]
    fn kind_is_derived_from_endpoints() {
        assert_eq!(measurement(pose(1, 3), pose(1, 4)).kind(), MeasurementKind::Odometry);
        assert_eq!(
            measurement(pose(1, 3), pose(1, 9)).kind(),
            MeasurementKind::PrivateLoopClosure
        );
        // Backwards adjacency is a loop closure, not odometry
        assert_eq!(
            measurement(pose(1, 4), pose(1, 3)).kind(),
            MeasurementKind::PrivateLoopClosure
        );
        assert_eq!(
            measurement(pose(1, 3), pose(2, 4)).kind(),
            MeasurementKind::SharedLoopClosure
        );
    }

    #[test]
    fn responsible_robot_is_lower_index() {
        let edge = EdgeKey::new(pose(3, 0), pose(1, 7));
        assert_eq!(edge.responsible_robot(), RobotId(1));
        assert!(edge.involves(RobotId(3)));
        assert!(!edge.involves(RobotId(2)));
    }

    #[test]
    fn remote_pose_of_shared_loop_closure() {
        let m = measurement(pose(0, 2), pose(2, 5));
        assert_eq!(m.remote_pose(RobotId(0)), Some(pose(2, 5)));
        assert_eq!(m.remote_pose(RobotId(2)), Some(pose(0, 2)));
        assert_eq!(m.remote_pose(RobotId(1)), None);

        let odom = measurement(pose(0, 2), pose(0, 3));
        assert_eq!(odom.remote_pose(RobotId(0)), None);
    }

    #[test]
    fn public_pose_ordering_by_stamp() {
        let old = PublicPose::new(pose(1, 5), ACTIVE_CLUSTER, Matrix::zeros(2, 3), 8);
        let new = PublicPose::new(pose(1, 5), ACTIVE_CLUSTER, Matrix::zeros(2, 3), 10);
        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
        assert!(!new.is_newer_than(&new.clone()));
    }

    #[test]
    fn leader_is_robot_zero() {
        assert!(RobotId(0).is_leader());
        assert!(!RobotId(1).is_leader());
        assert_eq!(RobotId::LEADER, RobotId::from(0));
    }

    #[test]
    fn public_pose_survives_json() {
        let p = PublicPose::new(pose(1, 5), 3, Matrix::from_element(2, 3, 0.5), 10);
        let json = serde_json::to_string(&p).unwrap();
        let back: PublicPose = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert!(!back.is_active_cluster());
    }
}
