//! In-process bus for a simulated fleet
//!
//! Provides a thin wrapper around a tokio broadcast channel with:
//! - Per-robot endpoints that filter by addressee and subscription
//! - Optional random frame loss per receiving endpoint
//! - Isolation of individual robots to simulate a peer going silent

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dpgo_core::RobotId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{trace, warn};

use crate::bus::MessageBus;
use crate::error::{BusError, Result};
use crate::types::{Channel, Frame, SeqNo};

/// Random frame loss applied on the receiving side
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossModel {
    /// Probability in `[0, 1]` that a delivered frame is dropped
    pub drop_probability: f64,
    /// Seed for reproducible loss patterns
    pub seed: u64,
}

impl LossModel {
    /// Lossless delivery
    pub const fn none() -> Self {
        Self {
            drop_probability: 0.0,
            seed: 0,
        }
    }

    /// Drop frames with probability `drop_probability`
    pub fn lossy(drop_probability: f64, seed: u64) -> Self {
        Self {
            drop_probability: drop_probability.clamp(0.0, 1.0),
            seed,
        }
    }
}

impl Default for LossModel {
    fn default() -> Self {
        Self::none()
    }
}

/// Robots currently cut off from the bus
#[derive(Debug, Default)]
struct Isolation {
    robots: Mutex<HashSet<RobotId>>,
}

impl Isolation {
    fn contains(&self, robot: RobotId) -> bool {
        self.robots
            .lock()
            .map(|robots| robots.contains(&robot))
            .unwrap_or(false)
    }

    fn set(&self, robot: RobotId, isolated: bool) {
        if let Ok(mut robots) = self.robots.lock() {
            if isolated {
                robots.insert(robot);
            } else {
                robots.remove(&robot);
            }
        }
    }
}

/// Shared hub; hand out one endpoint per robot
#[derive(Debug, Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<Frame>,
    isolation: Arc<Isolation>,
}

impl LocalBus {
    /// Create a hub buffering up to `capacity` frames per receiver
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            isolation: Arc::new(Isolation::default()),
        }
    }

    /// Attach a lossless endpoint for `robot`
    pub fn endpoint(&self, robot: RobotId) -> LocalEndpoint {
        self.endpoint_with_loss(robot, LossModel::none())
    }

    /// Attach an endpoint for `robot` that drops incoming frames at random
    pub fn endpoint_with_loss(&self, robot: RobotId, loss: LossModel) -> LocalEndpoint {
        LocalEndpoint {
            robot,
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
            isolation: Arc::clone(&self.isolation),
            subscriptions: Channel::ALL.iter().copied().collect(),
            loss,
            rng: StdRng::seed_from_u64(loss.seed ^ u64::from(robot.0)),
            next_seq: 0,
            frames_dropped: 0,
        }
    }

    /// Cut `robot` off: nothing it publishes or is sent gets through
    pub fn isolate(&self, robot: RobotId) {
        self.isolation.set(robot, true);
    }

    /// Undo [`isolate`](Self::isolate)
    pub fn reconnect(&self, robot: RobotId) {
        self.isolation.set(robot, false);
    }
}

/// One robot's view of a [`LocalBus`]
#[derive(Debug)]
pub struct LocalEndpoint {
    robot: RobotId,
    tx: broadcast::Sender<Frame>,
    rx: broadcast::Receiver<Frame>,
    isolation: Arc<Isolation>,
    subscriptions: HashSet<Channel>,
    loss: LossModel,
    rng: StdRng,
    next_seq: SeqNo,
    frames_dropped: u64,
}

impl LocalEndpoint {
    /// Frames lost to loss injection, isolation or receiver lag
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    fn should_drop(&mut self, frame: &Frame) -> bool {
        if self.isolation.contains(self.robot) || self.isolation.contains(frame.from()) {
            return true;
        }
        self.loss.drop_probability > 0.0 && self.rng.gen_bool(self.loss.drop_probability)
    }
}

impl MessageBus for LocalEndpoint {
    fn robot(&self) -> RobotId {
        self.robot
    }

    fn publish(&mut self, mut frame: Frame) -> Result<()> {
        frame.hdr.from = self.robot;
        frame.hdr.seq = self.next_seq;
        self.next_seq += 1;

        if self.isolation.contains(self.robot) {
            trace!(robot = %self.robot, channel = %frame.channel(), "Isolated, frame not sent");
            return Ok(());
        }

        self.tx.send(frame).map(|_| ()).map_err(|_| BusError::Closed)
    }

    fn try_recv(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.rx.try_recv() {
                Ok(frame) => {
                    if !frame.is_for(self.robot) || !self.subscriptions.contains(&frame.channel()) {
                        continue;
                    }
                    if self.should_drop(&frame) {
                        self.frames_dropped += 1;
                        trace!(
                            robot = %self.robot,
                            from = %frame.from(),
                            channel = %frame.channel(),
                            "Dropped frame"
                        );
                        continue;
                    }
                    return Ok(Some(frame));
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(robot = %self.robot, missed, "Receiver lagged, frames lost");
                    self.frames_dropped += missed;
                }
                Err(TryRecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }

    fn subscribe(&mut self, channels: &[Channel]) {
        self.subscriptions = channels.iter().copied().collect();
    }
}
