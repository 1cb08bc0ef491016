//! Cache of public state received from other robots.

use std::collections::HashMap;

use dpgo_core::{EdgeKey, MeasurementWeight, PoseId, PublicPose, RobotId};

use crate::error::{Error, Result};

/// Latest public poses and robust weights heard from the team.
///
/// Poses follow last-writer-wins on their stamp: a value only replaces
/// the cached one when its stamp is strictly newer. Poses outside the
/// active cluster are stored but never handed out as optimization input.
#[derive(Debug, Default)]
pub struct PublicStateCache {
    poses: HashMap<PoseId, PublicPose>,
    weights: HashMap<EdgeKey, MeasurementWeight>,
    bytes_received: u64,
}

impl PublicStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pose value.
    /// Returns true if the value was newer and stored.
    pub fn put_pose(&mut self, pose: PublicPose) -> bool {
        match self.poses.get_mut(&pose.pose_id) {
            Some(existing) => {
                if pose.is_newer_than(existing) {
                    *existing = pose;
                    true
                } else {
                    false
                }
            }
            None => {
                self.poses.insert(pose.pose_id, pose);
                true
            }
        }
    }

    /// Cached value of a pose, whatever its cluster.
    pub fn get(&self, pose_id: &PoseId) -> Option<&PublicPose> {
        self.poses.get(pose_id)
    }

    /// Cached value of a pose, only if it may be used as optimization input.
    pub fn active_pose(&self, pose_id: &PoseId) -> Option<&PublicPose> {
        self.poses.get(pose_id).filter(|p| p.is_active_cluster())
    }

    /// Store a weight published by `from`.
    ///
    /// Only the responsible robot of an edge may publish its weight.
    /// Returns true if the stored weight changed.
    pub fn put_weight(&mut self, from: RobotId, weight: MeasurementWeight) -> Result<bool> {
        let responsible = weight.edge.responsible_robot();
        if from != responsible {
            return Err(Error::ProtocolViolation(format!(
                "robot {from} published weight of {} owned by robot {responsible}",
                weight.edge
            )));
        }
        if self.weights.get(&weight.edge) == Some(&weight) {
            return Ok(false);
        }
        self.weights.insert(weight.edge, weight);
        Ok(true)
    }

    pub fn weight(&self, edge: &EdgeKey) -> Option<&MeasurementWeight> {
        self.weights.get(edge)
    }

    /// Account for bytes of public state received.
    pub fn record_bytes(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Number of cached poses.
    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    /// Clear all entries and counters.
    pub fn clear(&mut self) {
        self.poses.clear();
        self.weights.clear();
        self.bytes_received = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpgo_core::Matrix;
    use proptest::prelude::*;

    fn pose(robot: u32, index: u32, cluster: u32, value: f64, stamp: u64) -> PublicPose {
        PublicPose::new(
            PoseId::new(RobotId(robot), index),
            cluster,
            Matrix::from_element(2, 3, value),
            stamp,
        )
    }

    #[test]
    fn put_keeps_newer() {
        let mut cache = PublicStateCache::new();
        assert!(cache.put_pose(pose(1, 4, 0, 10.0, 10)));
        assert!(!cache.put_pose(pose(1, 4, 0, 8.0, 8)));

        let cached = cache.get(&PoseId::new(RobotId(1), 4)).unwrap();
        assert_eq!(cached.stamp, 10);
        assert_eq!(cached.value[(0, 0)], 10.0);
    }

    #[test]
    fn put_equal_stamp_is_ignored() {
        let mut cache = PublicStateCache::new();
        cache.put_pose(pose(1, 4, 0, 1.0, 5));
        assert!(!cache.put_pose(pose(1, 4, 0, 2.0, 5)));
        assert_eq!(cache.get(&PoseId::new(RobotId(1), 4)).unwrap().value[(0, 0)], 1.0);
    }

    #[test]
    fn inactive_cluster_is_never_input() {
        let mut cache = PublicStateCache::new();
        cache.put_pose(pose(2, 0, 3, 1.0, 1));
        let id = PoseId::new(RobotId(2), 0);

        assert!(cache.get(&id).is_some());
        assert!(cache.active_pose(&id).is_none());

        cache.put_pose(pose(2, 0, 0, 1.0, 2));
        assert!(cache.active_pose(&id).is_some());
    }

    #[test]
    fn weight_only_from_responsible_robot() {
        let mut cache = PublicStateCache::new();
        let edge = EdgeKey::new(PoseId::new(RobotId(2), 1), PoseId::new(RobotId(1), 7));
        let w = MeasurementWeight::new(edge, 0.4, false);

        assert!(matches!(
            cache.put_weight(RobotId(2), w.clone()),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(cache.put_weight(RobotId(1), w.clone()).unwrap());
        assert!(!cache.put_weight(RobotId(1), w).unwrap());
        assert_eq!(cache.weight(&edge).unwrap().weight, 0.4);
    }

    #[test]
    fn clear_resets_counters() {
        let mut cache = PublicStateCache::new();
        cache.put_pose(pose(1, 0, 0, 0.0, 1));
        cache.record_bytes(128);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.bytes_received(), 0);
    }

    proptest! {
        #[test]
        fn cached_stamp_is_max_of_delivered(stamps in proptest::collection::vec(0u64..1000, 1..50)) {
            let mut cache = PublicStateCache::new();
            for s in &stamps {
                cache.put_pose(pose(1, 0, 0, *s as f64, *s));
            }
            let max = *stamps.iter().max().unwrap();
            let cached = cache.get(&PoseId::new(RobotId(1), 0)).unwrap();
            prop_assert_eq!(cached.stamp, max);
            prop_assert_eq!(cached.value[(0, 0)], max as f64);
        }
    }
}
