//! Distributed initialization progress.
//!
//! Initialization is a sequence of steps taken at a fixed cadence. Each step
//! the coordinator tries to complete what is missing (local graph, lifting
//! matrix, neighbors' shared loop closures). When the step budget runs out
//! before everything is in place, the run is abandoned.

use std::time::{Duration, Instant};

use dpgo_core::PublicPose;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct InitProtocol {
    max_steps: u32,
    step_interval: Duration,
    steps_done: u32,
    last_step_at: Option<Instant>,
    graph_loaded: bool,
    ready: bool,
    initialize_received: bool,
    anchor: Option<PublicPose>,
}

impl InitProtocol {
    pub fn new(max_steps: u32, step_interval: Duration) -> Self {
        Self {
            max_steps,
            step_interval,
            steps_done: 0,
            last_step_at: None,
            graph_loaded: false,
            ready: false,
            initialize_received: false,
            anchor: None,
        }
    }

    /// Start counting steps from `now`.
    pub fn begin(&mut self, now: Instant) {
        self.reset();
        self.last_step_at = Some(now);
    }

    /// Count a step if one is due.
    /// Returns true when a new step was counted.
    pub fn tick(&mut self, now: Instant) -> bool {
        let due = self
            .last_step_at
            .map_or(true, |t| now.saturating_duration_since(t) >= self.step_interval);
        if due {
            self.steps_done += 1;
            self.last_step_at = Some(now);
        }
        due
    }

    /// Fail once the budget is spent without reaching readiness.
    pub fn check_budget(&self) -> Result<()> {
        if !self.ready && self.steps_done >= self.max_steps {
            return Err(Error::InitializationExhausted {
                steps: self.steps_done,
            });
        }
        Ok(())
    }

    pub fn steps_done(&self) -> u32 {
        self.steps_done
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    pub fn set_graph_loaded(&mut self) {
        self.graph_loaded = true;
    }

    pub fn graph_loaded(&self) -> bool {
        self.graph_loaded
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn set_initialize_received(&mut self) {
        self.initialize_received = true;
    }

    pub fn initialize_received(&self) -> bool {
        self.initialize_received
    }

    /// Store the global anchor if it is newer than the one held.
    pub fn set_anchor(&mut self, pose: PublicPose) -> bool {
        match &self.anchor {
            Some(current) if !pose.is_newer_than(current) => false,
            _ => {
                self.anchor = Some(pose);
                true
            }
        }
    }

    pub fn anchor(&self) -> Option<&PublicPose> {
        self.anchor.as_ref()
    }

    pub fn reset(&mut self) {
        self.steps_done = 0;
        self.last_step_at = None;
        self.graph_loaded = false;
        self.ready = false;
        self.initialize_received = false;
        self.anchor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpgo_core::{Matrix, PoseId, RobotId};

    #[test]
    fn test_steps_follow_cadence() {
        let t0 = Instant::now();
        let mut init = InitProtocol::new(3, Duration::from_secs(1));
        init.begin(t0);

        assert!(!init.tick(t0 + Duration::from_millis(500)));
        assert!(init.tick(t0 + Duration::from_secs(1)));
        assert!(!init.tick(t0 + Duration::from_millis(1500)));
        assert!(init.tick(t0 + Duration::from_secs(2)));
        assert_eq!(init.steps_done(), 2);
    }

    #[test]
    fn test_budget_exhaustion() {
        let t0 = Instant::now();
        let mut init = InitProtocol::new(2, Duration::from_secs(1));
        init.begin(t0);
        init.tick(t0 + Duration::from_secs(1));
        assert!(init.check_budget().is_ok());
        init.tick(t0 + Duration::from_secs(2));
        assert!(matches!(
            init.check_budget(),
            Err(Error::InitializationExhausted { steps: 2 })
        ));

        // Ready robots never exhaust
        init.set_ready(true);
        assert!(init.check_budget().is_ok());
    }

    #[test]
    fn test_anchor_keeps_newest() {
        let mut init = InitProtocol::new(30, Duration::from_secs(1));
        let id = PoseId::new(RobotId(0), 0);
        assert!(init.set_anchor(PublicPose::new(id, 0, Matrix::zeros(2, 3), 4)));
        assert!(!init.set_anchor(PublicPose::new(id, 0, Matrix::zeros(2, 3), 2)));
        assert_eq!(init.anchor().unwrap().stamp, 4);

        init.reset();
        assert!(init.anchor().is_none());
    }
}
