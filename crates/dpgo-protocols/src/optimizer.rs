//! The numerical side of a robot, seen from the coordinator.
//!
//! The coordinator never does math itself. It feeds a [`LocalOptimizer`] its
//! local graph, neighbor poses, the lifting matrix and robust weights, and
//! asks it for one local step when the leader says so.

use std::collections::BTreeSet;

use dpgo_core::{
    ClusterId, Matrix, Measurement, MeasurementKind, MeasurementWeight, PoseId, RobotId,
};

/// A robot's measurements, split by kind.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalGraph {
    pub robot: RobotId,
    pub odometry: Vec<Measurement>,
    pub private_loop_closures: Vec<Measurement>,
    pub shared_loop_closures: Vec<Measurement>,
}

impl LocalGraph {
    pub fn empty(robot: RobotId) -> Self {
        Self {
            robot,
            odometry: Vec::new(),
            private_loop_closures: Vec::new(),
            shared_loop_closures: Vec::new(),
        }
    }

    /// Classify `measurements` for `robot`.
    ///
    /// Measurements that do not touch `robot` are returned separately.
    pub fn classify(robot: RobotId, measurements: Vec<Measurement>) -> (Self, Vec<Measurement>) {
        let mut graph = Self::empty(robot);
        let mut foreign = Vec::new();

        for m in measurements {
            if !m.involves(robot) {
                foreign.push(m);
                continue;
            }
            match m.kind() {
                MeasurementKind::Odometry => graph.odometry.push(m),
                MeasurementKind::PrivateLoopClosure => graph.private_loop_closures.push(m),
                MeasurementKind::SharedLoopClosure => graph.shared_loop_closures.push(m),
            }
        }
        (graph, foreign)
    }

    /// Robots sharing at least one loop closure with this one.
    pub fn neighbors(&self) -> BTreeSet<RobotId> {
        self.shared_loop_closures
            .iter()
            .filter_map(|m| m.remote_pose(self.robot))
            .map(|p| p.robot)
            .collect()
    }

    /// Own pose indices referenced by shared loop closures.
    pub fn public_pose_indices(&self) -> BTreeSet<u32> {
        self.shared_loop_closures
            .iter()
            .flat_map(|m| [m.src, m.dst])
            .filter(|p| p.robot == self.robot)
            .map(|p| p.index)
            .collect()
    }

    /// Remote poses of `neighbor` this robot's constraints refer to.
    pub fn remote_poses_of(&self, neighbor: RobotId) -> BTreeSet<PoseId> {
        self.shared_loop_closures
            .iter()
            .filter_map(|m| m.remote_pose(self.robot))
            .filter(|p| p.robot == neighbor)
            .collect()
    }

    /// Number of measurements of all kinds.
    pub fn len(&self) -> usize {
        self.odometry.len() + self.private_loop_closures.len() + self.shared_loop_closures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of one local step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateResult {
    pub success: bool,
    pub objective_before: f64,
    pub objective_after: f64,
}

impl UpdateResult {
    pub fn success(objective_before: f64, objective_after: f64) -> Self {
        Self {
            success: true,
            objective_before,
            objective_after,
        }
    }

    /// A failed step leaves the estimate untouched.
    pub fn failure(objective: f64) -> Self {
        Self {
            success: false,
            objective_before: objective,
            objective_after: objective,
        }
    }
}

/// Local solver driven by the coordinator.
pub trait LocalOptimizer: Send {
    /// Load (or replace) the local pose graph.
    fn set_local_graph(&mut self, graph: LocalGraph);

    /// Run one local optimization step using the current neighbor poses.
    fn local_update(&mut self) -> UpdateResult;

    /// Current estimate of an own pose.
    fn pose_estimate(&self, index: u32) -> Option<Matrix>;

    /// Remote poses of `robot` this optimizer needs as input.
    fn neighbor_pose_requirements(&self, robot: RobotId) -> Vec<PoseId>;

    /// Provide a remote pose value. Only active-cluster poses are ever passed.
    fn apply_neighbor_pose(&mut self, cluster: ClusterId, robot: RobotId, pose_id: PoseId, pose: &Matrix);

    fn set_lifting_matrix(&mut self, matrix: Matrix);

    /// The lifting matrix, once known.
    fn lifting_matrix(&self) -> Option<Matrix>;

    /// Produce the lifting matrix locally. Only the leader calls this.
    fn generate_lifting_matrix(&mut self) -> Option<Matrix> {
        None
    }

    /// Own trajectory expressed in the frame fixed by `anchor`.
    fn trajectory_in_global_frame(&self, anchor: &Matrix) -> Vec<Matrix>;

    /// Cluster the own poses currently belong to.
    fn active_cluster(&self) -> ClusterId;

    fn num_poses(&self) -> usize;

    fn dimension(&self) -> usize;

    fn relaxation_rank(&self) -> usize;

    /// Recompute the robust weights this robot is responsible for.
    fn update_measurement_weights(&mut self) -> Vec<MeasurementWeight> {
        Vec::new()
    }

    /// Apply a weight computed by the responsible robot.
    fn apply_measurement_weight(&mut self, _weight: &MeasurementWeight) {}

    /// Relative change of the estimate in the last step.
    fn relative_change(&self) -> f64 {
        f64::INFINITY
    }

    /// Drop all problem state.
    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpgo_core::Vector;

    fn edge(a: (u32, u32), b: (u32, u32)) -> Measurement {
        Measurement::new(
            PoseId::new(RobotId(a.0), a.1),
            PoseId::new(RobotId(b.0), b.1),
            Matrix::identity(2, 2),
            Vector::zeros(2),
        )
    }

    #[test]
    fn test_classify_splits_by_kind() {
        let measurements = vec![
            edge((1, 0), (1, 1)),
            edge((1, 1), (1, 2)),
            edge((1, 0), (1, 2)),
            edge((1, 2), (0, 5)),
            edge((2, 3), (1, 1)),
            edge((0, 0), (2, 0)),
        ];
        let (graph, foreign) = LocalGraph::classify(RobotId(1), measurements);

        assert_eq!(graph.odometry.len(), 2);
        assert_eq!(graph.private_loop_closures.len(), 1);
        assert_eq!(graph.shared_loop_closures.len(), 2);
        assert_eq!(foreign.len(), 1);
        assert_eq!(graph.len(), 5);
    }

    #[test]
    fn test_neighbors_and_public_poses() {
        let (graph, _) = LocalGraph::classify(
            RobotId(1),
            vec![
                edge((1, 2), (0, 5)),
                edge((2, 3), (1, 1)),
                edge((1, 2), (2, 4)),
            ],
        );
        let neighbors: Vec<_> = graph.neighbors().into_iter().collect();
        assert_eq!(neighbors, vec![RobotId(0), RobotId(2)]);

        let public: Vec<_> = graph.public_pose_indices().into_iter().collect();
        assert_eq!(public, vec![1, 2]);

        let remote: Vec<_> = graph.remote_poses_of(RobotId(2)).into_iter().collect();
        assert_eq!(
            remote,
            vec![PoseId::new(RobotId(2), 3), PoseId::new(RobotId(2), 4)]
        );
    }
}
