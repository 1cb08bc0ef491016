//! Outstanding requests and their deadlines.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dpgo_core::RobotId;

use crate::message::RequestId;

/// What was asked, so the response can be checked against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingKind {
    LiftingMatrix,
    Poses { indices: Vec<u32> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub to: RobotId,
    pub kind: PendingKind,
    pub deadline: Instant,
}

/// Requests awaiting a response.
#[derive(Debug)]
pub struct RequestTracker {
    timeout: Duration,
    next_id: RequestId,
    pending: HashMap<RequestId, PendingRequest>,
}

impl RequestTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a new request and return its id.
    pub fn issue(&mut self, to: RobotId, kind: PendingKind, now: Instant) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(
            id,
            PendingRequest {
                to,
                kind,
                deadline: now + self.timeout,
            },
        );
        id
    }

    /// Match a response. Unknown or already expired ids yield `None`.
    pub fn resolve(&mut self, id: RequestId, from: RobotId) -> Option<PendingRequest> {
        match self.pending.get(&id) {
            Some(p) if p.to == from => self.pending.remove(&id),
            _ => None,
        }
    }

    /// Remove and return requests whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<(RequestId, PendingRequest)> {
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p)))
            .collect()
    }

    /// Whether a request of this kind is already waiting on `to`.
    pub fn is_pending(&self, to: RobotId, matches: impl Fn(&PendingKind) -> bool) -> bool {
        self.pending.values().any(|p| p.to == to && matches(&p.kind))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every outstanding request; late responses are then ignored.
    pub fn cancel_all(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_resolve() {
        let t0 = Instant::now();
        let mut tracker = RequestTracker::new(Duration::from_secs(5));
        let id = tracker.issue(RobotId(0), PendingKind::LiftingMatrix, t0);

        assert!(tracker.is_pending(RobotId(0), |k| *k == PendingKind::LiftingMatrix));
        // Wrong responder
        assert!(tracker.resolve(id, RobotId(2)).is_none());
        let pending = tracker.resolve(id, RobotId(0)).unwrap();
        assert_eq!(pending.kind, PendingKind::LiftingMatrix);
        assert!(tracker.resolve(id, RobotId(0)).is_none());
    }

    #[test]
    fn test_expire_after_deadline() {
        let t0 = Instant::now();
        let mut tracker = RequestTracker::new(Duration::from_secs(5));
        let a = tracker.issue(RobotId(0), PendingKind::LiftingMatrix, t0);
        let b = tracker.issue(
            RobotId(2),
            PendingKind::Poses { indices: vec![1] },
            t0 + Duration::from_secs(3),
        );

        assert!(tracker.expire(t0 + Duration::from_secs(4)).is_empty());
        let expired = tracker.expire(t0 + Duration::from_secs(5));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, a);

        // A late response is ignored
        assert!(tracker.resolve(a, RobotId(0)).is_none());
        assert!(tracker.resolve(b, RobotId(2)).is_some());
    }

    #[test]
    fn test_cancel_all() {
        let t0 = Instant::now();
        let mut tracker = RequestTracker::new(Duration::from_secs(5));
        tracker.issue(RobotId(0), PendingKind::LiftingMatrix, t0);
        tracker.issue(RobotId(1), PendingKind::LiftingMatrix, t0);
        assert_eq!(tracker.cancel_all(), 2);
        assert!(tracker.is_empty());
    }
}
