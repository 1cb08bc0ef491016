//! Harness for scenario tests: a whole team on one [`LocalBus`], ticked in
//! lockstep on a virtual clock.

use std::time::{Duration, Instant};

use dpgo_core::{CoordinatorConfig, RobotId, UpdateRule};
use dpgo_node::{build_runtimes, AveragingOptimizer, FleetConfig};
use dpgo_protocols::{Coordinator, CoordinatorRuntime, Error, Mode, Result};
use dpgo_transfer::{LocalBus, LocalEndpoint};

pub type Runtime = CoordinatorRuntime<AveragingOptimizer, LocalEndpoint>;

/// Protocol timings scaled for a 100ms virtual tick.
///
/// Runs end at `max_iterations` only; convergence is disabled with a zero
/// tolerance unless a test sets its own.
pub fn scenario_config(num_robots: usize) -> CoordinatorConfig {
    CoordinatorConfig::new(num_robots)
        .with_dimensions(2, 3)
        .with_update_rule(UpdateRule::RoundRobin)
        .with_max_iterations(20)
        .with_rel_change_tol(0.0)
        .with_tick_interval(Duration::from_millis(100))
        .with_heartbeat_interval(Duration::from_millis(500))
        .with_init_step_interval(Duration::from_millis(200))
        .with_request_timeout(Duration::from_secs(1))
        .with_timeout_threshold(Duration::from_secs(3))
}

/// Log to the test output when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Lockstep {
    bus: LocalBus,
    runtimes: Vec<Runtime>,
    now: Instant,
    tick: Duration,
    failures: Vec<(RobotId, Error)>,
}

impl Lockstep {
    pub fn new(config: &FleetConfig) -> Result<Self> {
        Self::on(LocalBus::new(config.bus_capacity), config)
    }

    /// Build the team on `bus`, which may already have robots isolated.
    pub fn on(bus: LocalBus, config: &FleetConfig) -> Result<Self> {
        let runtimes = build_runtimes(&bus, config)?;
        Ok(Self::from_runtimes(
            bus,
            runtimes,
            config.coordinator.protocol.tick_interval,
        ))
    }

    pub fn from_runtimes(bus: LocalBus, runtimes: Vec<Runtime>, tick: Duration) -> Self {
        Self {
            bus,
            runtimes,
            now: Instant::now(),
            tick,
            failures: Vec::new(),
        }
    }

    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }

    pub fn coordinator(&self, robot: u32) -> &Coordinator<AveragingOptimizer> {
        self.runtimes[robot as usize].coordinator()
    }

    pub fn coordinators(&self) -> impl Iterator<Item = &Coordinator<AveragingOptimizer>> {
        self.runtimes.iter().map(Runtime::coordinator)
    }

    /// Errors returned by ticks so far, with the robot that raised them.
    pub fn failures(&self) -> &[(RobotId, Error)] {
        &self.failures
    }

    /// Advance the clock by one tick and pump every robot in index order.
    pub fn step(&mut self) {
        self.now += self.tick;
        for runtime in &mut self.runtimes {
            if let Err(e) = runtime.pump(self.now) {
                self.failures.push((runtime.coordinator().id(), e));
            }
        }
    }

    /// Step until `done` holds, at most `max_ticks` times.
    pub fn run_until(&mut self, max_ticks: usize, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..max_ticks {
            self.step();
            if done(self) {
                return true;
            }
        }
        false
    }

    pub fn all_in(&self, mode: Mode) -> bool {
        self.coordinators().all(|c| c.mode() == mode)
    }

    pub fn local_iterations(&self) -> Vec<u64> {
        self.coordinators().map(Coordinator::local_iteration).collect()
    }
}
