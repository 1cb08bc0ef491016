//! Update rules, synchronous acknowledgements and the staleness bound.

use dpgo_core::UpdateRule;
use dpgo_integration_tests::{init_tracing, scenario_config, Lockstep};
use dpgo_node::FleetConfig;
use dpgo_protocols::Mode;

#[test]
fn test_round_robin_is_fair() {
    init_tracing();
    let config = FleetConfig::new(scenario_config(4).with_max_iterations(20));
    let mut team = Lockstep::new(&config).unwrap();

    assert!(team.run_until(2000, |t| t.all_in(Mode::Terminated)));
    assert_eq!(team.coordinator(0).iteration(), 20);
    assert_eq!(team.local_iterations(), vec![5, 5, 5, 5]);
}

#[test]
fn test_uniform_rule_reaches_every_robot() {
    let config = FleetConfig::new(
        scenario_config(3)
            .with_update_rule(UpdateRule::Uniform)
            .with_max_iterations(30),
    );
    let mut team = Lockstep::new(&config).unwrap();

    assert!(team.run_until(3000, |t| t.all_in(Mode::Terminated)));
    let iterations = team.local_iterations();
    assert_eq!(iterations.iter().sum::<u64>(), 30);
    assert!(iterations.iter().all(|i| *i > 0));
}

#[test]
fn test_synchronous_rounds_never_overlap() {
    let config = FleetConfig::new(scenario_config(3).with_max_iterations(15));
    let mut team = Lockstep::new(&config).unwrap();

    let mut last_total = 0;
    let finished = team.run_until(2000, |t| {
        // Without asynchronous mode at most one robot advances per round
        let total: u64 = t.local_iterations().iter().sum();
        assert!(total <= t.coordinator(0).iteration());
        assert!(total >= last_total);
        last_total = total;
        t.all_in(Mode::Terminated)
    });
    assert!(finished);
}

#[test]
fn test_asynchronous_mode_respects_staleness_bound() {
    let max_delayed = 2;
    let config = FleetConfig::new(
        scenario_config(3)
            .with_asynchronous(true)
            .with_max_delayed_iterations(max_delayed)
            .with_max_iterations(30),
    );
    let mut team = Lockstep::new(&config).unwrap();

    let finished = team.run_until(3000, |t| {
        let iterations = t.local_iterations();
        let max = iterations.iter().max().copied().unwrap_or(0);
        let min = iterations.iter().min().copied().unwrap_or(0);
        assert!(
            max - min <= max_delayed,
            "robots drifted apart: {iterations:?}"
        );
        t.coordinator(0).mode() == Mode::Terminated
    });
    assert!(finished);
    assert_eq!(team.coordinator(0).iteration(), 30);
}
