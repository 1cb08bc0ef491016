//! Peer liveness tracking.
//!
//! Any message from a peer refreshes its `last_seen` time. A peer that stays
//! silent for longer than the timeout threshold is considered disconnected
//! until it is heard from again.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use dpgo_core::RobotId;
use tracing::{debug, info};

use crate::coordinator::Mode;
use crate::message::Status;

/// What a robot knows about one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub robot: RobotId,
    pub last_seen: Instant,
    pub connected: bool,
    /// Highest local iteration the peer has reported.
    pub iteration: u64,
    /// Last global round whose UPDATE the peer has handled.
    pub round: u64,
    pub mode: Option<Mode>,
    pub initialized: bool,
    pub ready_to_terminate: bool,
    pub objective: Option<f64>,
    /// Robots the peer last said it can hear.
    pub reachable: Option<BTreeSet<RobotId>>,
}

impl PeerRecord {
    fn new(robot: RobotId, now: Instant) -> Self {
        Self {
            robot,
            last_seen: now,
            connected: true,
            iteration: 0,
            round: 0,
            mode: None,
            initialized: false,
            ready_to_terminate: false,
            objective: None,
            reachable: None,
        }
    }

    /// Whether the peer is able to execute updates.
    pub fn is_optimizing(&self) -> bool {
        self.mode == Some(Mode::Optimizing)
    }

    /// Forget everything learned during a run, keep liveness.
    fn reset_progress(&mut self) {
        self.iteration = 0;
        self.round = 0;
        self.mode = None;
        self.initialized = false;
        self.ready_to_terminate = false;
        self.objective = None;
    }
}

/// Liveness of every peer this robot has heard from.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    local: RobotId,
    timeout: Duration,
    peers: BTreeMap<RobotId, PeerRecord>,
}

impl ConnectivityMonitor {
    pub fn new(local: RobotId, timeout: Duration) -> Self {
        Self {
            local,
            timeout,
            peers: BTreeMap::new(),
        }
    }

    /// Refresh `robot`'s liveness.
    /// Returns true if the robot was unknown or previously disconnected.
    pub fn observe(&mut self, robot: RobotId, now: Instant) -> bool {
        if robot == self.local {
            return false;
        }
        match self.peers.get_mut(&robot) {
            Some(peer) => {
                peer.last_seen = now;
                if peer.connected {
                    false
                } else {
                    info!(robot = %robot, "Peer reconnected");
                    peer.connected = true;
                    true
                }
            }
            None => {
                debug!(robot = %robot, "Discovered peer");
                self.peers.insert(robot, PeerRecord::new(robot, now));
                true
            }
        }
    }

    /// Mark peers silent for longer than the timeout as disconnected.
    /// Returns the robots that just became disconnected.
    pub fn check(&mut self, now: Instant) -> Vec<RobotId> {
        let timeout = self.timeout;
        let mut dropped = Vec::new();
        for peer in self.peers.values_mut() {
            if peer.connected && now.saturating_duration_since(peer.last_seen) > timeout {
                peer.connected = false;
                dropped.push(peer.robot);
            }
        }
        for robot in &dropped {
            info!(robot = %robot, timeout = ?timeout, "Peer timed out");
        }
        dropped
    }

    /// Force a peer into the disconnected state.
    /// Returns true if it was connected.
    pub fn mark_disconnected(&mut self, robot: RobotId) -> bool {
        match self.peers.get_mut(&robot) {
            Some(peer) if peer.connected => {
                peer.connected = false;
                true
            }
            _ => false,
        }
    }

    /// Apply the progress fields of a status heartbeat.
    pub fn record_status(&mut self, status: &Status) {
        if let Some(peer) = self.peers.get_mut(&status.robot) {
            peer.iteration = peer.iteration.max(status.iteration);
            peer.round = peer.round.max(status.round);
            peer.mode = Some(status.mode);
            peer.initialized = status.initialized;
            peer.ready_to_terminate = status.ready_to_terminate;
            peer.objective = status.objective;
        }
    }

    pub fn record_report(&mut self, robot: RobotId, reachable: BTreeSet<RobotId>) {
        if let Some(peer) = self.peers.get_mut(&robot) {
            peer.reachable = Some(reachable);
        }
    }

    pub fn is_connected(&self, robot: RobotId) -> bool {
        robot == self.local || self.peers.get(&robot).is_some_and(|p| p.connected)
    }

    /// Connected peers plus this robot.
    pub fn connected_robots(&self) -> BTreeSet<RobotId> {
        self.peers
            .values()
            .filter(|p| p.connected)
            .map(|p| p.robot)
            .chain(std::iter::once(self.local))
            .collect()
    }

    pub fn peer(&self, robot: RobotId) -> Option<&PeerRecord> {
        self.peers.get(&robot)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Drop run progress of every peer, keeping liveness.
    pub fn reset_progress(&mut self) {
        for peer in self.peers.values_mut() {
            peer.reset_progress();
        }
    }
}
