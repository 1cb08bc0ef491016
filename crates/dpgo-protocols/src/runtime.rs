//! Tick loop connecting a [`Coordinator`] to a [`MessageBus`].

use std::time::{Duration, Instant};

use dpgo_core::RobotId;
use dpgo_transfer::MessageBus;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::coordinator::{Coordinator, Mode};
use crate::error::{Error, Result};
use crate::optimizer::LocalOptimizer;

/// Snapshot of a coordinator, published after every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub mode: Mode,
    pub instance: u64,
    pub iteration: u64,
    pub local_iteration: u64,
    pub objective: Option<f64>,
}

impl<O: LocalOptimizer> From<&Coordinator<O>> for Progress {
    fn from(c: &Coordinator<O>) -> Self {
        Self {
            mode: c.mode(),
            instance: c.instance(),
            iteration: c.iteration(),
            local_iteration: c.local_iteration(),
            objective: c.objective(),
        }
    }
}

/// Owns a coordinator and its bus endpoint.
pub struct CoordinatorRuntime<O, B> {
    coordinator: Coordinator<O>,
    bus: B,
    tick: Duration,
    progress: watch::Sender<Progress>,
}

impl<O, B> CoordinatorRuntime<O, B>
where
    O: LocalOptimizer + 'static,
    B: MessageBus + 'static,
{
    pub fn new(coordinator: Coordinator<O>, bus: B) -> Self {
        let tick = coordinator.config().protocol.tick_interval;
        let (progress, _) = watch::channel(Progress::from(&coordinator));
        Self {
            coordinator,
            bus,
            tick,
            progress,
        }
    }

    pub fn coordinator(&self) -> &Coordinator<O> {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut Coordinator<O> {
        &mut self.coordinator
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Watch the coordinator's progress.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Deliver pending frames, run one tick and publish what it produced.
    ///
    /// Undecodable frames are logged and skipped. The tick's own result is
    /// returned after the outbox has been flushed.
    pub fn pump(&mut self, now: Instant) -> Result<()> {
        while let Some(frame) = self.bus.try_recv()? {
            if let Err(e) = self.coordinator.receive_frame(&frame, now) {
                warn!(
                    robot = %self.coordinator.id(),
                    from = %frame.from(),
                    channel = %frame.channel(),
                    error = %e,
                    "Discarding frame"
                );
            }
        }
        let result = self.coordinator.run_once(now);
        self.flush()?;
        self.progress.send_replace(Progress::from(&self.coordinator));
        result
    }

    fn flush(&mut self) -> Result<()> {
        for envelope in self.coordinator.poll() {
            let frame = envelope.to_frame()?;
            self.bus.publish(frame)?;
        }
        Ok(())
    }

    /// Like [`pump`](Self::pump), but a failed initialization is not fatal.
    fn step(&mut self, now: Instant) -> Result<()> {
        match self.pump(now) {
            Err(Error::InitializationExhausted { steps }) => {
                debug!(robot = %self.coordinator.id(), steps, "Waiting for the next run");
                Ok(())
            }
            other => other,
        }
    }

    /// Block until the leader has been heard from.
    ///
    /// Returns [`Error::LeaderUnreachable`] if it stays silent for `timeout`.
    pub async fn wait_for_leader(&mut self, timeout: Duration) -> Result<()> {
        if self.coordinator.is_leader() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            self.step(now)?;
            if self.coordinator.monitor().is_connected(RobotId::LEADER) {
                info!(robot = %self.coordinator.id(), "Leader reachable");
                return Ok(());
            }
            if now >= deadline {
                return Err(Error::LeaderUnreachable(timeout));
            }
            tokio::time::sleep(self.tick).await;
        }
    }

    /// Tick until `shutdown` flips to true or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<Coordinator<O>> {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(robot = %self.coordinator.id(), tick = ?self.tick, "Coordinator running");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.step(Instant::now())?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(robot = %self.coordinator.id(), mode = %self.coordinator.mode(), "Shutting down");
                        break;
                    }
                }
            }
        }
        Ok(self.coordinator)
    }

    /// Run on a background task.
    pub fn spawn(self) -> RuntimeHandle<O> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let progress = self.subscribe();
        let robot = self.coordinator.id();
        let task = tokio::spawn(self.run(shutdown_rx));
        RuntimeHandle {
            robot,
            shutdown,
            progress,
            task,
        }
    }
}

/// Handle to a spawned runtime.
pub struct RuntimeHandle<O> {
    robot: RobotId,
    shutdown: watch::Sender<bool>,
    progress: watch::Receiver<Progress>,
    task: JoinHandle<Result<Coordinator<O>>>,
}

impl<O> RuntimeHandle<O> {
    pub fn robot(&self) -> RobotId {
        self.robot
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Stop the runtime and get the coordinator back.
    pub async fn shutdown(self) -> Result<Coordinator<O>> {
        let _ = self.shutdown.send(true);
        self.task.await?
    }
}
