//! Per-robot iteration logs written during a run.

use dpgo_integration_tests::{scenario_config, Lockstep};
use dpgo_node::FleetConfig;
use dpgo_protocols::{IterationRecord, Mode};

#[test]
fn test_each_robot_logs_its_updates() {
    let dir = tempfile::tempdir().unwrap();
    let config = FleetConfig::new(
        scenario_config(2)
            .with_max_iterations(8)
            .with_iteration_log(dir.path()),
    );
    let mut team = Lockstep::new(&config).unwrap();
    assert!(team.run_until(2000, |t| t.all_in(Mode::Terminated)));

    for r in 0..2u32 {
        let content = std::fs::read_to_string(dir.path().join(format!("robot_{r}.jsonl"))).unwrap();
        let records: Vec<IterationRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|rec| rec.robot.0 == r));
        let iterations: Vec<u64> = records.iter().map(|rec| rec.iteration).collect();
        assert_eq!(iterations, vec![1, 2, 3, 4]);
        assert!(records.windows(2).all(|w| w[0].elapsed_ms <= w[1].elapsed_ms));
    }
}
