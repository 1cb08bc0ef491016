//! The spawned fleet, driven by real tokio timers.

use std::time::Duration;

use dpgo_core::{CoordinatorConfig, UpdateRule};
use dpgo_node::{Fleet, FleetConfig};
use dpgo_protocols::Mode;

fn config() -> FleetConfig {
    let coordinator = CoordinatorConfig::new(3)
        .with_dimensions(2, 3)
        .with_update_rule(UpdateRule::Uniform)
        .with_max_iterations(15)
        .with_tick_interval(Duration::from_millis(5))
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_init_step_interval(Duration::from_millis(50))
        .with_request_timeout(Duration::from_millis(500))
        .with_timeout_threshold(Duration::from_secs(2));
    FleetConfig::new(coordinator).with_poses_per_robot(5)
}

#[tokio::test]
async fn test_fleet_finishes_and_reports_trajectories() {
    let fleet = Fleet::launch(&config()).unwrap();
    assert!(fleet.wait_until_terminated(Duration::from_secs(30)).await);

    let coordinators = fleet.shutdown().await.unwrap();
    assert_eq!(coordinators.len(), 3);
    for c in &coordinators {
        assert_eq!(c.mode(), Mode::Terminated);
        assert_eq!(c.trajectory().unwrap().len(), 5);
    }
}

#[tokio::test]
async fn test_shutdown_mid_run() {
    let config = FleetConfig {
        coordinator: config().coordinator.with_max_iterations(1_000_000),
        ..config()
    };
    let fleet = Fleet::launch(&config).unwrap();
    assert!(
        fleet
            .wait_for(Duration::from_secs(30), |p| p.mode == Mode::Optimizing)
            .await
    );

    let coordinators = fleet.shutdown().await.unwrap();
    assert!(coordinators.iter().all(|c| c.mode() == Mode::Optimizing));
}
