//! Bounded-staleness barrier.
//!
//! A robot may run ahead of the slowest active peer by fewer than
//! `max_delayed` iterations. Before its first update it also needs the
//! shared loop closures of every active neighbor.

use std::collections::{BTreeMap, BTreeSet};

use dpgo_core::RobotId;

/// Per-peer synchronization bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BarrierEntry {
    /// Highest iteration heard from the peer.
    iter_received: u64,
    /// Lowest iteration of the peer this robot needs before its next update.
    iter_required: u64,
    received_shared_loop_closures: bool,
}

/// Result of asking whether a local update may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The slowest active peer is too far behind.
    Lagging { slowest: RobotId, lag: u64 },
    /// Shared loop closures of this neighbor have not arrived.
    AwaitingSharedLoopClosures { robot: RobotId },
}

#[derive(Debug)]
pub struct SyncBarrier {
    max_delayed: u64,
    entries: BTreeMap<RobotId, BarrierEntry>,
}

impl SyncBarrier {
    pub fn new(max_delayed: u64) -> Self {
        Self {
            max_delayed,
            entries: BTreeMap::new(),
        }
    }

    /// Record an iteration reported by `robot`.
    /// Returns true if it advanced what we know; stale reports are ignored.
    pub fn observe_iteration(&mut self, robot: RobotId, iteration: u64) -> bool {
        let entry = self.entries.entry(robot).or_default();
        if iteration > entry.iter_received {
            entry.iter_received = iteration;
            true
        } else {
            false
        }
    }

    pub fn mark_shared_loop_closures(&mut self, robot: RobotId) {
        self.entries.entry(robot).or_default().received_shared_loop_closures = true;
    }

    pub fn has_shared_loop_closures(&self, robot: RobotId) -> bool {
        self.entries
            .get(&robot)
            .is_some_and(|e| e.received_shared_loop_closures)
    }

    pub fn iter_received(&self, robot: RobotId) -> u64 {
        self.entries.get(&robot).map_or(0, |e| e.iter_received)
    }

    /// Iteration `robot` had to reach at the last check.
    pub fn iter_required(&self, robot: RobotId) -> u64 {
        self.entries.get(&robot).map_or(0, |e| e.iter_required)
    }

    /// The slowest of `robots` and how far `own` is ahead of it.
    pub fn lag(&self, own: u64, robots: &BTreeSet<RobotId>) -> Option<(RobotId, u64)> {
        robots
            .iter()
            .map(|r| (*r, self.iter_received(*r)))
            .min_by_key(|(_, iter)| *iter)
            .map(|(r, iter)| (r, own.saturating_sub(iter)))
    }

    /// Refresh what each of `peers` must have reached before the next update.
    pub fn require(&mut self, own: u64, peers: &BTreeSet<RobotId>) {
        let required = (own + 1).saturating_sub(self.max_delayed);
        for peer in peers {
            self.entries.entry(*peer).or_default().iter_required = required;
        }
    }

    /// Decide whether a robot at iteration `own` may update now.
    ///
    /// `active_peers` excludes the robot itself; `neighbors` are the active
    /// peers it shares loop closures with.
    pub fn check(
        &mut self,
        own: u64,
        active_peers: &BTreeSet<RobotId>,
        neighbors: &BTreeSet<RobotId>,
    ) -> Readiness {
        if own == 0 {
            if let Some(robot) = neighbors
                .iter()
                .find(|r| !self.has_shared_loop_closures(**r))
            {
                return Readiness::AwaitingSharedLoopClosures { robot: *robot };
            }
        }

        self.require(own, active_peers);
        match self.lag(own, active_peers) {
            Some((slowest, lag)) if lag >= self.max_delayed => Readiness::Lagging { slowest, lag },
            _ => Readiness::Ready,
        }
    }

    /// Whether `candidate` may be scheduled without outrunning the slowest of `active`.
    pub fn within_bound(&self, candidate: RobotId, active: &BTreeSet<RobotId>) -> bool {
        let own = self.iter_received(candidate);
        match self.lag(own, active) {
            Some((_, lag)) => lag < self.max_delayed,
            None => true,
        }
    }

    /// Forget all progress and received loop closures.
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(ids: &[u32]) -> BTreeSet<RobotId> {
        ids.iter().map(|i| RobotId(*i)).collect()
    }

    #[test]
    fn test_stale_iteration_ignored() {
        let mut barrier = SyncBarrier::new(3);
        assert!(barrier.observe_iteration(RobotId(1), 5));
        assert!(!barrier.observe_iteration(RobotId(1), 4));
        assert!(!barrier.observe_iteration(RobotId(1), 5));
        assert_eq!(barrier.iter_received(RobotId(1)), 5);
    }

    #[test]
    fn test_defers_when_too_far_ahead() {
        let mut barrier = SyncBarrier::new(3);
        barrier.observe_iteration(RobotId(1), 7);
        barrier.observe_iteration(RobotId(2), 4);
        let peers = set(&[1, 2]);

        assert_eq!(barrier.check(6, &peers, &BTreeSet::new()), Readiness::Ready);
        assert_eq!(
            barrier.check(7, &peers, &BTreeSet::new()),
            Readiness::Lagging {
                slowest: RobotId(2),
                lag: 3
            }
        );
        assert_eq!(barrier.iter_required(RobotId(2)), 5);

        barrier.observe_iteration(RobotId(2), 5);
        assert_eq!(barrier.check(7, &peers, &BTreeSet::new()), Readiness::Ready);
    }

    #[test]
    fn test_inactive_peers_do_not_block() {
        let mut barrier = SyncBarrier::new(3);
        barrier.observe_iteration(RobotId(1), 10);
        // Robot 2 is stuck at 0 but no longer active
        assert_eq!(barrier.check(10, &set(&[1]), &BTreeSet::new()), Readiness::Ready);
    }

    #[test]
    fn test_first_update_waits_for_loop_closures() {
        let mut barrier = SyncBarrier::new(3);
        let peers = set(&[1, 2]);
        let neighbors = set(&[2]);

        assert_eq!(
            barrier.check(0, &peers, &neighbors),
            Readiness::AwaitingSharedLoopClosures { robot: RobotId(2) }
        );
        barrier.mark_shared_loop_closures(RobotId(2));
        assert_eq!(barrier.check(0, &peers, &neighbors), Readiness::Ready);
    }

    #[test]
    fn test_within_bound() {
        let mut barrier = SyncBarrier::new(2);
        barrier.observe_iteration(RobotId(0), 4);
        barrier.observe_iteration(RobotId(1), 3);
        barrier.observe_iteration(RobotId(2), 2);
        let active = set(&[0, 1, 2]);

        assert!(!barrier.within_bound(RobotId(0), &active));
        assert!(barrier.within_bound(RobotId(1), &active));
        assert!(barrier.within_bound(RobotId(2), &active));
    }

    proptest! {
        #[test]
        fn ready_implies_lag_within_bound(
            own in 0u64..50,
            iters in proptest::collection::vec(0u64..50, 1..6),
            max_delayed in 1u64..6,
        ) {
            let mut barrier = SyncBarrier::new(max_delayed);
            let mut peers = BTreeSet::new();
            for (i, it) in iters.iter().enumerate() {
                let robot = RobotId(i as u32 + 1);
                barrier.observe_iteration(robot, *it);
                peers.insert(robot);
            }
            if barrier.check(own, &peers, &BTreeSet::new()) == Readiness::Ready {
                let slowest = *iters.iter().min().unwrap();
                prop_assert!(own.saturating_sub(slowest) < max_delayed);
            }
        }
    }
}
