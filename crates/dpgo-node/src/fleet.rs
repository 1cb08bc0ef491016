//! An in-process team of robots sharing one [`LocalBus`].

use std::time::Duration;

use dpgo_core::{CoordinatorConfig, RobotId};
use dpgo_protocols::{Coordinator, CoordinatorRuntime, Mode, Progress, Result, RuntimeHandle};
use dpgo_transfer::{LocalBus, LocalEndpoint, LossModel};
use tokio::sync::watch;
use tracing::info;

use crate::sim::{synthetic_pose_graph, AveragingOptimizer, GraphSpec};

/// Cluster reported by robots that have not merged into the global map.
pub const DETACHED_CLUSTER: u32 = 1;

/// Everything needed to stand up a simulated team.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub coordinator: CoordinatorConfig,
    pub poses_per_robot: u32,
    pub extra_loop_closures: usize,
    pub seed: u64,
    /// Receive-side loss applied to every robot.
    pub loss: LossModel,
    pub bus_capacity: usize,
    /// Robots whose poses stay outside the active cluster.
    pub detached: Vec<RobotId>,
}

impl FleetConfig {
    pub fn new(coordinator: CoordinatorConfig) -> Self {
        Self {
            coordinator,
            poses_per_robot: 10,
            extra_loop_closures: 2,
            seed: 42,
            loss: LossModel::none(),
            bus_capacity: 4096,
            detached: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_poses_per_robot(mut self, poses: u32) -> Self {
        self.poses_per_robot = poses;
        self
    }

    #[must_use]
    pub fn with_extra_loop_closures(mut self, count: usize) -> Self {
        self.extra_loop_closures = count;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_loss(mut self, loss: LossModel) -> Self {
        self.loss = loss;
        self
    }

    #[must_use]
    pub fn with_detached(mut self, robot: RobotId) -> Self {
        self.detached.push(robot);
        self
    }

    pub fn num_robots(&self) -> usize {
        self.coordinator.optimizer.num_robots
    }

    pub fn graph_spec(&self) -> GraphSpec {
        GraphSpec {
            num_robots: self.num_robots(),
            poses_per_robot: self.poses_per_robot,
            extra_loop_closures: self.extra_loop_closures,
            dimension: self.coordinator.optimizer.dimension,
            seed: self.seed,
        }
    }
}

/// One runtime per robot, each with its pose graph submitted.
pub fn build_runtimes(
    bus: &LocalBus,
    config: &FleetConfig,
) -> Result<Vec<CoordinatorRuntime<AveragingOptimizer, LocalEndpoint>>> {
    let o = &config.coordinator.optimizer;
    synthetic_pose_graph(&config.graph_spec())
        .into_iter()
        .enumerate()
        .map(|(r, measurements)| {
            let id = RobotId(r as u32);
            let mut optimizer = AveragingOptimizer::new(
                id,
                o.dimension,
                o.relaxation_rank,
                config.poses_per_robot as usize,
                config.seed,
            );
            if config.detached.contains(&id) {
                optimizer = optimizer.with_cluster(DETACHED_CLUSTER);
            }
            let mut coordinator = Coordinator::new(id, config.coordinator.clone(), optimizer)?;
            coordinator.submit_pose_graph(measurements);
            Ok(CoordinatorRuntime::new(
                coordinator,
                bus.endpoint_with_loss(id, config.loss),
            ))
        })
        .collect()
}

/// A running team.
pub struct Fleet {
    bus: LocalBus,
    handles: Vec<RuntimeHandle<AveragingOptimizer>>,
}

impl Fleet {
    /// Start every robot on a fresh bus.
    pub fn launch(config: &FleetConfig) -> Result<Self> {
        Self::launch_on(LocalBus::new(config.bus_capacity), config)
    }

    /// Start every robot on `bus`, e.g. one with robots already isolated.
    pub fn launch_on(bus: LocalBus, config: &FleetConfig) -> Result<Self> {
        let runtimes = build_runtimes(&bus, config)?;
        info!(
            robots = runtimes.len(),
            poses_per_robot = config.poses_per_robot,
            loss = config.loss.drop_probability,
            "Launching fleet"
        );
        let handles = runtimes.into_iter().map(CoordinatorRuntime::spawn).collect();
        Ok(Self { bus, handles })
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn progress(&self) -> Vec<watch::Receiver<Progress>> {
        self.handles.iter().map(RuntimeHandle::progress).collect()
    }

    /// Wait until every robot satisfies `done`, giving up after `timeout`.
    pub async fn wait_for(&self, timeout: Duration, done: impl Fn(&Progress) -> bool) -> bool {
        let mut receivers = self.progress();
        tokio::time::timeout(timeout, async move {
            for rx in &mut receivers {
                while !done(&rx.borrow()) {
                    if rx.changed().await.is_err() {
                        return false;
                    }
                }
            }
            true
        })
        .await
        .unwrap_or(false)
    }

    /// Wait for the run to end on every robot.
    pub async fn wait_until_terminated(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, |p| p.mode == Mode::Terminated).await
    }

    /// Stop every robot and hand back their coordinators, in robot order.
    pub async fn shutdown(self) -> Result<Vec<Coordinator<AveragingOptimizer>>> {
        let mut coordinators = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            coordinators.push(handle.shutdown().await?);
        }
        Ok(coordinators)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpgo_core::UpdateRule;

    fn config(num_robots: usize) -> FleetConfig {
        let coordinator = CoordinatorConfig::new(num_robots)
            .with_dimensions(2, 3)
            .with_update_rule(UpdateRule::RoundRobin)
            .with_max_iterations(12)
            .with_rel_change_tol(0.0)
            .with_tick_interval(Duration::from_millis(5))
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_init_step_interval(Duration::from_millis(50))
            .with_timeout_threshold(Duration::from_secs(2));
        FleetConfig::new(coordinator).with_poses_per_robot(6)
    }

    #[test]
    fn test_builds_one_runtime_per_robot() {
        let bus = LocalBus::new(64);
        let config = config(3).with_detached(RobotId(2));
        let runtimes = build_runtimes(&bus, &config).unwrap();

        assert_eq!(runtimes.len(), 3);
        for (r, runtime) in runtimes.iter().enumerate() {
            let c = runtime.coordinator();
            assert_eq!(c.id(), RobotId(r as u32));
            assert!(c.has_pose_graph());
            assert_eq!(c.mode(), Mode::Idle);
        }
        assert_eq!(
            dpgo_protocols::LocalOptimizer::active_cluster(runtimes[2].coordinator().optimizer()),
            DETACHED_CLUSTER
        );
    }

    #[tokio::test]
    async fn test_fleet_runs_to_completion() {
        let fleet = Fleet::launch(&config(3)).unwrap();
        assert!(fleet.wait_until_terminated(Duration::from_secs(30)).await);

        let coordinators = fleet.shutdown().await.unwrap();
        assert_eq!(coordinators[0].iteration(), 12);
        let total: u64 = coordinators.iter().map(|c| c.local_iteration()).sum();
        assert_eq!(total, 12);
        for c in &coordinators {
            assert_eq!(c.trajectory().unwrap().len(), 6);
        }
    }
}
