//! Scripted optimizer for coordinator tests.

use dpgo_core::{
    ClusterId, Matrix, Measurement, MeasurementWeight, PoseId, RobotId, Vector,
};

use crate::optimizer::{LocalGraph, LocalOptimizer, UpdateResult};

#[derive(Debug)]
pub(crate) struct MockOptimizer {
    pub robot: RobotId,
    pub poses: Vec<Matrix>,
    pub graph: Option<LocalGraph>,
    pub lifting: Option<Matrix>,
    pub cluster: ClusterId,
    pub fail: bool,
    pub updates: u32,
    pub applied: Vec<(PoseId, ClusterId)>,
    pub weights_applied: Vec<MeasurementWeight>,
    pub rel_change: f64,
}

impl MockOptimizer {
    pub const DIMENSION: usize = 2;
    pub const RANK: usize = 2;

    pub fn new(robot: RobotId, num_poses: usize) -> Self {
        Self {
            robot,
            poses: (0..num_poses)
                .map(|i| Matrix::from_element(Self::RANK, Self::DIMENSION + 1, robot.0 as f64 + i as f64))
                .collect(),
            graph: None,
            lifting: None,
            cluster: 0,
            fail: false,
            updates: 0,
            applied: Vec::new(),
            weights_applied: Vec::new(),
            rel_change: f64::INFINITY,
        }
    }
}

impl LocalOptimizer for MockOptimizer {
    fn set_local_graph(&mut self, graph: LocalGraph) {
        self.graph = Some(graph);
    }

    fn local_update(&mut self) -> UpdateResult {
        if self.fail || self.graph.is_none() {
            return UpdateResult::failure(1.0);
        }
        self.updates += 1;
        let n = f64::from(self.updates);
        UpdateResult::success(1.0 / n, 1.0 / (n + 1.0))
    }

    fn pose_estimate(&self, index: u32) -> Option<Matrix> {
        self.poses.get(index as usize).cloned()
    }

    fn neighbor_pose_requirements(&self, robot: RobotId) -> Vec<PoseId> {
        self.graph
            .as_ref()
            .map(|g| g.remote_poses_of(robot).into_iter().collect())
            .unwrap_or_default()
    }

    fn apply_neighbor_pose(&mut self, cluster: ClusterId, _robot: RobotId, pose_id: PoseId, _pose: &Matrix) {
        self.applied.push((pose_id, cluster));
    }

    fn set_lifting_matrix(&mut self, matrix: Matrix) {
        self.lifting = Some(matrix);
    }

    fn lifting_matrix(&self) -> Option<Matrix> {
        self.lifting.clone()
    }

    fn generate_lifting_matrix(&mut self) -> Option<Matrix> {
        if self.robot.is_leader() {
            self.lifting = Some(Matrix::identity(Self::RANK, Self::DIMENSION));
        }
        self.lifting.clone()
    }

    fn trajectory_in_global_frame(&self, anchor: &Matrix) -> Vec<Matrix> {
        self.poses.iter().map(|p| p - anchor).collect()
    }

    fn active_cluster(&self) -> ClusterId {
        self.cluster
    }

    fn num_poses(&self) -> usize {
        self.poses.len()
    }

    fn dimension(&self) -> usize {
        Self::DIMENSION
    }

    fn relaxation_rank(&self) -> usize {
        Self::RANK
    }

    fn update_measurement_weights(&mut self) -> Vec<MeasurementWeight> {
        let robot = self.robot;
        self.graph
            .as_ref()
            .map(|g| {
                g.shared_loop_closures
                    .iter()
                    .filter(|m| m.edge().responsible_robot() == robot)
                    .map(|m| MeasurementWeight::new(m.edge(), 0.5, true))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn apply_measurement_weight(&mut self, weight: &MeasurementWeight) {
        self.weights_applied.push(weight.clone());
    }

    fn relative_change(&self) -> f64 {
        self.rel_change
    }

    fn reset(&mut self) {
        self.graph = None;
        self.lifting = None;
        self.updates = 0;
        self.applied.clear();
    }
}

/// Odometry chain of `num_poses` for `robot` plus the given shared loop closures.
pub(crate) fn pose_graph(
    robot: u32,
    num_poses: u32,
    shared: &[((u32, u32), (u32, u32))],
) -> Vec<Measurement> {
    let edge = |a: (u32, u32), b: (u32, u32)| {
        Measurement::new(
            PoseId::new(RobotId(a.0), a.1),
            PoseId::new(RobotId(b.0), b.1),
            Matrix::identity(MockOptimizer::DIMENSION, MockOptimizer::DIMENSION),
            Vector::zeros(MockOptimizer::DIMENSION),
        )
    };
    (0..num_poses.saturating_sub(1))
        .map(|i| edge((robot, i), (robot, i + 1)))
        .chain(shared.iter().map(|(a, b)| edge(*a, *b)))
        .collect()
}
