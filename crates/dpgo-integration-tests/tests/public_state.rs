//! Public pose merging as seen through the coordinator's receive path.

use std::time::Instant;

use dpgo_core::{CoordinatorConfig, Matrix, PoseId, PublicPose, RobotId};
use dpgo_node::AveragingOptimizer;
use dpgo_protocols::message::PublicPoses;
use dpgo_protocols::{Coordinator, Envelope, Message};

fn poses(from: u32, stamp: u64, cluster: u32) -> Envelope {
    let robot = RobotId(from);
    Envelope::new(
        robot,
        0,
        Message::PublicPoses(PublicPoses {
            robot,
            iteration: stamp,
            poses: vec![PublicPose::new(
                PoseId::new(robot, 0),
                cluster,
                Matrix::from_element(3, 3, stamp as f64),
                stamp,
            )],
        }),
    )
}

fn follower() -> Coordinator<AveragingOptimizer> {
    let config = CoordinatorConfig::new(3).with_dimensions(2, 3);
    Coordinator::new(RobotId(1), config, AveragingOptimizer::new(RobotId(1), 2, 3, 4, 1)).unwrap()
}

#[test]
fn test_out_of_order_poses_keep_newest() {
    let mut c = follower();
    let now = Instant::now();

    c.receive(poses(2, 10, 0), now);
    c.receive(poses(2, 8, 0), now);

    let cached = c.cache().get(&PoseId::new(RobotId(2), 0)).unwrap();
    assert_eq!(cached.stamp, 10);
    assert_eq!(cached.value[(0, 0)], 10.0);
    assert_eq!(c.barrier().iter_received(RobotId(2)), 10);
}

#[test]
fn test_poses_from_other_instance_ignored() {
    let mut c = follower();
    let mut envelope = poses(2, 5, 0);
    envelope.instance = 4;
    c.receive(envelope, Instant::now());

    assert!(c.cache().is_empty());
    // Liveness still counts
    assert!(c.monitor().is_connected(RobotId(2)));
}

#[test]
fn test_frames_round_trip_through_bus_codec() {
    let mut c = follower();
    let frame = poses(2, 3, 1).to_frame().unwrap();
    c.receive_frame(&frame, Instant::now()).unwrap();

    let cached = c.cache().get(&PoseId::new(RobotId(2), 0)).unwrap();
    assert_eq!(cached.cluster, 1);
    assert!(!cached.is_active_cluster());
    assert_eq!(c.cache().bytes_received(), frame.len() as u64);
}
