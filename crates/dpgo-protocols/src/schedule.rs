//! Selection of the next robot to update.

use std::collections::BTreeSet;

use dpgo_core::{RobotId, UpdateRule};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Picks robots according to an [`UpdateRule`].
#[derive(Debug)]
pub struct UpdateScheduler {
    rule: UpdateRule,
    /// Last robot selected, for round robin.
    cursor: Option<RobotId>,
    rng: StdRng,
}

impl UpdateScheduler {
    pub fn new(rule: UpdateRule, seed: u64) -> Self {
        Self {
            rule,
            cursor: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn cursor(&self) -> Option<RobotId> {
        self.cursor
    }

    /// Choose the next robot among `active`, skipping those `eligible` rejects.
    pub fn select(
        &mut self,
        active: &BTreeSet<RobotId>,
        eligible: impl Fn(RobotId) -> bool,
    ) -> Option<RobotId> {
        let selected = match self.rule {
            UpdateRule::Uniform => {
                let candidates: Vec<RobotId> =
                    active.iter().copied().filter(|r| eligible(*r)).collect();
                candidates.choose(&mut self.rng).copied()
            }
            UpdateRule::RoundRobin => {
                let cursor = self.cursor;
                let (after, upto): (Vec<RobotId>, Vec<RobotId>) = active
                    .iter()
                    .copied()
                    .partition(|r| cursor.is_some_and(|c| *r > c));
                after.into_iter().chain(upto).find(|r| eligible(*r))
            }
        };
        if selected.is_some() {
            self.cursor = selected;
        }
        selected
    }

    pub fn reset(&mut self) {
        self.cursor = None;
    }
}
