//! Synthetic problems for exercising the protocol without a real solver.
//!
//! [`AveragingOptimizer`] pulls every pose toward the poses it is constrained
//! to (Jacobi averaging over odometry and loop closures). It has the same
//! data flow as a Riemannian solver: it needs neighbor poses, publishes its
//! own, produces robust weights and converges. The numbers are meaningless.

use std::collections::HashMap;

use dpgo_core::{
    ClusterId, EdgeKey, Matrix, Measurement, MeasurementWeight, PoseId, RobotId, Vector,
    ACTIVE_CLUSTER,
};
use dpgo_protocols::{LocalGraph, LocalOptimizer, UpdateResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Weight change under which a robust weight counts as converged.
const WEIGHT_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Clone)]
pub struct AveragingOptimizer {
    robot: RobotId,
    dimension: usize,
    rank: usize,
    /// Fraction of the way each pose moves toward its neighbors' mean.
    step_size: f64,
    cluster: ClusterId,
    initial: Vec<Matrix>,
    poses: Vec<Matrix>,
    graph: Option<LocalGraph>,
    neighbor_poses: HashMap<PoseId, Matrix>,
    weights: HashMap<EdgeKey, f64>,
    lifting: Option<Matrix>,
    last_change: f64,
}

impl AveragingOptimizer {
    /// Random lifted poses of size `rank x (dimension + 1)`, reproducible per robot.
    pub fn new(robot: RobotId, dimension: usize, rank: usize, num_poses: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed ^ (u64::from(robot.0) << 32));
        let initial: Vec<Matrix> = (0..num_poses)
            .map(|_| Matrix::from_fn(rank, dimension + 1, |_, _| rng.gen_range(-1.0..1.0)))
            .collect();
        Self {
            robot,
            dimension,
            rank,
            step_size: 0.5,
            cluster: ACTIVE_CLUSTER,
            poses: initial.clone(),
            initial,
            graph: None,
            neighbor_poses: HashMap::new(),
            weights: HashMap::new(),
            lifting: None,
            last_change: f64::INFINITY,
        }
    }

    /// Report the own poses as belonging to `cluster`.
    #[must_use]
    pub fn with_cluster(mut self, cluster: ClusterId) -> Self {
        self.cluster = cluster;
        self
    }

    #[must_use]
    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size.clamp(0.0, 1.0);
        self
    }

    pub fn neighbor_pose(&self, pose_id: &PoseId) -> Option<&Matrix> {
        self.neighbor_poses.get(pose_id)
    }

    pub fn weight(&self, edge: &EdgeKey) -> Option<f64> {
        self.weights.get(edge).copied()
    }

    /// Robust weights known so far, computed or received.
    pub fn weights(&self) -> impl Iterator<Item = (&EdgeKey, &f64)> {
        self.weights.iter()
    }

    fn value(&self, pose_id: PoseId) -> Option<&Matrix> {
        if pose_id.robot == self.robot {
            self.poses.get(pose_id.index as usize)
        } else {
            self.neighbor_poses.get(&pose_id)
        }
    }

    fn edge_weight(&self, m: &Measurement) -> f64 {
        self.weights.get(&m.edge()).copied().unwrap_or(m.weight)
    }

    fn measurements(&self) -> impl Iterator<Item = &Measurement> {
        self.graph.iter().flat_map(|g| {
            g.odometry
                .iter()
                .chain(&g.private_loop_closures)
                .chain(&g.shared_loop_closures)
        })
    }

    /// Weighted squared disagreement over all constraints with known endpoints.
    pub fn objective(&self) -> f64 {
        self.measurements()
            .filter_map(|m| {
                let a = self.value(m.src)?;
                let b = self.value(m.dst)?;
                Some(self.edge_weight(m) * (a - b).norm_squared())
            })
            .sum()
    }
}

impl LocalOptimizer for AveragingOptimizer {
    fn set_local_graph(&mut self, graph: LocalGraph) {
        self.graph = Some(graph);
    }

    fn local_update(&mut self) -> UpdateResult {
        let before = self.objective();
        if self.graph.is_none() {
            return UpdateResult::failure(before);
        }

        let mut sums: Vec<Option<(Matrix, f64)>> = vec![None; self.poses.len()];
        for m in self.measurements() {
            let (Some(a), Some(b)) = (self.value(m.src), self.value(m.dst)) else {
                continue;
            };
            let w = self.edge_weight(m);
            for (own, other) in [(m.src, b), (m.dst, a)] {
                if own.robot != self.robot {
                    continue;
                }
                if let Some(slot) = sums.get_mut(own.index as usize) {
                    let (sum, total) = slot
                        .get_or_insert_with(|| (Matrix::zeros(other.nrows(), other.ncols()), 0.0));
                    *sum += other * w;
                    *total += w;
                }
            }
        }

        let mut change = 0.0;
        let mut norm = 0.0;
        for (pose, sum) in self.poses.iter_mut().zip(sums) {
            norm += pose.norm_squared();
            let Some((sum, total)) = sum else { continue };
            if total <= 0.0 {
                continue;
            }
            let target = sum / total;
            let delta = (target - &*pose) * self.step_size;
            change += delta.norm_squared();
            *pose += delta;
        }
        self.last_change = change.sqrt() / norm.sqrt().max(f64::EPSILON);

        UpdateResult::success(before, self.objective())
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

    fn apply_neighbor_pose(&mut self, _cluster: ClusterId, _robot: RobotId, pose_id: PoseId, pose: &Matrix) {
        self.neighbor_poses.insert(pose_id, pose.clone());
    }

    fn set_lifting_matrix(&mut self, matrix: Matrix) {
        self.lifting = Some(matrix);
    }

    fn lifting_matrix(&self) -> Option<Matrix> {
        self.lifting.clone()
    }

    fn generate_lifting_matrix(&mut self) -> Option<Matrix> {
        if self.lifting.is_none() && self.robot.is_leader() {
            self.lifting = Some(Matrix::identity(self.rank, self.dimension));
        }
        self.lifting.clone()
    }

    fn trajectory_in_global_frame(&self, anchor: &Matrix) -> Vec<Matrix> {
        self.poses
            .iter()
            .map(|x| {
                let relative = x - anchor;
                match &self.lifting {
                    Some(y) => y.transpose() * relative,
                    None => relative,
                }
            })
            .collect()
    }

    fn active_cluster(&self) -> ClusterId {
        self.cluster
    }

    fn num_poses(&self) -> usize {
        self.poses.len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn relaxation_rank(&self) -> usize {
        self.rank
    }

    fn update_measurement_weights(&mut self) -> Vec<MeasurementWeight> {
        let Some(graph) = &self.graph else {
            return Vec::new();
        };
        let mut updated = Vec::new();
        for m in &graph.shared_loop_closures {
            let edge = m.edge();
            if m.fixed_weight || edge.responsible_robot() != self.robot {
                continue;
            }
            let (Some(a), Some(b)) = (self.value(m.src), self.value(m.dst)) else {
                continue;
            };
            let weight = 1.0 / (1.0 + (a - b).norm_squared());
            let previous = self.weights.get(&edge).copied().unwrap_or(m.weight);
            updated.push(MeasurementWeight::new(
                edge,
                weight,
                (weight - previous).abs() < WEIGHT_TOLERANCE,
            ));
        }
        for w in &updated {
            self.weights.insert(w.edge, w.weight);
        }
        updated
    }

    fn apply_measurement_weight(&mut self, weight: &MeasurementWeight) {
        self.weights.insert(weight.edge, weight.weight);
    }

    fn relative_change(&self) -> f64 {
        self.last_change
    }

    fn reset(&mut self) {
        self.poses = self.initial.clone();
        self.graph = None;
        self.neighbor_poses.clear();
        self.weights.clear();
        self.lifting = None;
        self.last_change = f64::INFINITY;
    }
}

/// Shape of a synthetic multi-robot pose graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphSpec {
    pub num_robots: usize,
    pub poses_per_robot: u32,
    /// Random inter-robot loop closures on top of the chain linking robot
    /// `r - 1` to robot `r`.
    pub extra_loop_closures: usize,
    pub dimension: usize,
    pub seed: u64,
}

impl Default for GraphSpec {
    fn default() -> Self {
        Self {
            num_robots: 3,
            poses_per_robot: 10,
            extra_loop_closures: 2,
            dimension: 3,
            seed: 42,
        }
    }
}

fn unit_measurement(src: PoseId, dst: PoseId, dimension: usize) -> Measurement {
    Measurement::new(
        src,
        dst,
        Matrix::identity(dimension, dimension),
        Vector::from_fn(dimension, |i, _| if i == 0 { 1.0 } else { 0.0 }),
    )
}

/// Build every robot's measurement list.
///
/// Each robot gets an odometry chain and one private loop closure. Shared
/// loop closures appear in the lists of both robots they connect.
pub fn synthetic_pose_graph(spec: &GraphSpec) -> Vec<Vec<Measurement>> {
    let n = spec.poses_per_robot;
    let d = spec.dimension;
    let mut graphs: Vec<Vec<Measurement>> = (0..spec.num_robots).map(|_| Vec::new()).collect();

    for (r, graph) in graphs.iter_mut().enumerate() {
        let robot = RobotId(r as u32);
        for i in 0..n.saturating_sub(1) {
            graph.push(unit_measurement(PoseId::new(robot, i), PoseId::new(robot, i + 1), d));
        }
        if n >= 3 {
            graph.push(unit_measurement(PoseId::new(robot, 0), PoseId::new(robot, n - 1), d));
        }
    }

    if n == 0 || spec.num_robots < 2 {
        return graphs;
    }

    let mut shared = Vec::new();
    for r in 1..spec.num_robots as u32 {
        shared.push(unit_measurement(
            PoseId::new(RobotId(r - 1), n - 1),
            PoseId::new(RobotId(r), 0),
            d,
        ));
    }
    let mut rng = StdRng::seed_from_u64(spec.seed);
    for _ in 0..spec.extra_loop_closures {
        let a = rng.gen_range(0..spec.num_robots as u32);
        let b = (a + rng.gen_range(1..spec.num_robots as u32)) % spec.num_robots as u32;
        shared.push(unit_measurement(
            PoseId::new(RobotId(a), rng.gen_range(0..n)),
            PoseId::new(RobotId(b), rng.gen_range(0..n)),
            d,
        ));
    }

    for m in shared {
        graphs[m.src.robot.index()].push(m.clone());
        graphs[m.dst.robot.index()].push(m);
    }
    graphs
}
