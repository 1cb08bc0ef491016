//! How runs end: iteration budget, convergence, resets.

use dpgo_integration_tests::{scenario_config, Lockstep};
use dpgo_node::FleetConfig;
use dpgo_protocols::Mode;

#[test]
fn test_run_ends_at_iteration_budget() {
    let config = FleetConfig::new(scenario_config(3).with_max_iterations(12));
    let mut team = Lockstep::new(&config).unwrap();

    assert!(team.run_until(2000, |t| t.all_in(Mode::Terminated)));
    for c in team.coordinators() {
        assert_eq!(c.iteration(), 12);
        assert!(c.objective().is_some());
        assert_eq!(c.trajectory().unwrap().len(), config.poses_per_robot as usize);
        assert!(!c.has_pose_graph());
    }
}

#[test]
fn test_run_ends_when_everyone_converges() {
    // A loose tolerance lets the averaging converge long before the budget
    let config = FleetConfig::new(
        scenario_config(2)
            .with_max_iterations(10_000)
            .with_rel_change_tol(0.5),
    );
    let mut team = Lockstep::new(&config).unwrap();

    assert!(team.run_until(20_000, |t| t.all_in(Mode::Terminated)));
    assert!(team.coordinator(0).iteration() < 10_000);
}

#[test]
fn test_complete_reset_returns_team_to_idle() {
    let config = FleetConfig::new(
        scenario_config(3)
            .with_max_iterations(9)
            .with_complete_reset(true),
    );
    let mut team = Lockstep::new(&config).unwrap();

    assert!(team.run_until(2000, |t| t
        .coordinators()
        .all(|c| c.instance() == 1 && c.mode() == Mode::Idle && !c.has_pose_graph())));
    for c in team.coordinators() {
        assert_eq!(c.iteration(), 0);
    }

    // Nothing left to optimize, so no new run starts
    team.run_until(100, |_| false);
    assert_eq!(team.coordinator(0).instance(), 1);
}

#[test]
fn test_robust_weights_reach_both_ends() {
    let config = FleetConfig::new(
        scenario_config(2)
            .with_max_iterations(12)
            .with_robust_weight_interval(4),
    )
    .with_extra_loop_closures(0);
    let mut team = Lockstep::new(&config).unwrap();

    assert!(team.run_until(2000, |t| t.all_in(Mode::Terminated)));

    // Robot 0 owns the weight of the loop closure between the two robots
    let leader = team.coordinator(0);
    let follower = team.coordinator(1);
    let (edge, weight) = leader
        .optimizer()
        .weights()
        .next()
        .map(|(e, w)| (*e, *w))
        .unwrap();
    assert!(weight > 0.0 && weight <= 1.0);
    assert_eq!(follower.optimizer().weight(&edge), Some(weight));
    assert_eq!(follower.cache().weight(&edge).map(|w| w.weight), Some(weight));
}
