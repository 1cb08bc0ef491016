//! Node configuration from `DPGO_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use dpgo_core::{ConfigError, CoordinatorConfig, UpdateRule};
use dpgo_transfer::LossModel;

use crate::fleet::FleetConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub num_robots: usize,
    pub poses_per_robot: u32,
    pub extra_loop_closures: usize,
    pub dimension: usize,
    pub relaxation_rank: usize,
    pub update_rule: UpdateRule,
    pub asynchronous: bool,
    pub max_iterations: u64,
    /// Probability that a robot misses a frame.
    pub loss: f64,
    pub seed: u64,
    pub tick_interval: Duration,
    /// Directory for per-robot iteration logs
    pub iteration_log: Option<PathBuf>,
    /// Give up on the run after this long.
    pub run_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            num_robots: 3,
            poses_per_robot: 20,
            extra_loop_closures: 2,
            dimension: 3,
            relaxation_rank: 5,
            update_rule: UpdateRule::Uniform,
            asynchronous: false,
            max_iterations: 200,
            loss: 0.0,
            seed: 42,
            tick_interval: Duration::from_millis(10),
            iteration_log: None,
            run_timeout: Duration::from_secs(120),
        }
    }
}

impl NodeConfig {
    /// Read the environment, falling back to defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let var = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());

        Ok(Self {
            num_robots: parse("DPGO_NUM_ROBOTS", var("DPGO_NUM_ROBOTS"), d.num_robots)?,
            poses_per_robot: parse(
                "DPGO_POSES_PER_ROBOT",
                var("DPGO_POSES_PER_ROBOT"),
                d.poses_per_robot,
            )?,
            extra_loop_closures: parse(
                "DPGO_EXTRA_LOOP_CLOSURES",
                var("DPGO_EXTRA_LOOP_CLOSURES"),
                d.extra_loop_closures,
            )?,
            dimension: parse("DPGO_DIMENSION", var("DPGO_DIMENSION"), d.dimension)?,
            relaxation_rank: parse("DPGO_RANK", var("DPGO_RANK"), d.relaxation_rank)?,
            update_rule: parse("DPGO_UPDATE_RULE", var("DPGO_UPDATE_RULE"), d.update_rule)?,
            asynchronous: parse("DPGO_ASYNCHRONOUS", var("DPGO_ASYNCHRONOUS"), d.asynchronous)?,
            max_iterations: parse(
                "DPGO_MAX_ITERATIONS",
                var("DPGO_MAX_ITERATIONS"),
                d.max_iterations,
            )?,
            loss: parse("DPGO_LOSS", var("DPGO_LOSS"), d.loss)?,
            seed: parse("DPGO_SEED", var("DPGO_SEED"), d.seed)?,
            tick_interval: Duration::from_millis(parse(
                "DPGO_TICK_MS",
                var("DPGO_TICK_MS"),
                d.tick_interval.as_millis() as u64,
            )?),
            iteration_log: var("DPGO_ITERATION_LOG").map(PathBuf::from),
            run_timeout: Duration::from_secs(parse(
                "DPGO_RUN_TIMEOUT_SECS",
                var("DPGO_RUN_TIMEOUT_SECS"),
                d.run_timeout.as_secs(),
            )?),
        })
    }

    /// Coordinator parameters shared by every robot, validated.
    pub fn coordinator(&self) -> Result<CoordinatorConfig, ConfigError> {
        let mut config = CoordinatorConfig::new(self.num_robots)
            .with_dimensions(self.dimension, self.relaxation_rank)
            .with_update_rule(self.update_rule)
            .with_asynchronous(self.asynchronous)
            .with_max_iterations(self.max_iterations)
            .with_tick_interval(self.tick_interval);
        if let Some(dir) = &self.iteration_log {
            config = config.with_iteration_log(dir.clone());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn fleet(&self) -> Result<FleetConfig, ConfigError> {
        Ok(FleetConfig::new(self.coordinator()?)
            .with_poses_per_robot(self.poses_per_robot)
            .with_extra_loop_closures(self.extra_loop_closures)
            .with_seed(self.seed)
            .with_loss(LossModel::lossy(self.loss, self.seed)))
    }
}

fn parse<T: FromStr>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Parse { name, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = NodeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, NodeConfig::default());
        assert!(config.coordinator().is_ok());
    }

    #[test]
    fn test_reads_variables() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("DPGO_NUM_ROBOTS", "5"),
            ("DPGO_UPDATE_RULE", "round-robin"),
            ("DPGO_ASYNCHRONOUS", "true"),
            ("DPGO_TICK_MS", "20"),
            ("DPGO_ITERATION_LOG", "/tmp/dpgo-logs"),
            ("DPGO_LOSS", " 0.1 "),
        ]))
        .unwrap();

        assert_eq!(config.num_robots, 5);
        assert_eq!(config.update_rule, UpdateRule::RoundRobin);
        assert!(config.asynchronous);
        assert_eq!(config.tick_interval, Duration::from_millis(20));
        assert_eq!(config.iteration_log, Some(PathBuf::from("/tmp/dpgo-logs")));

        let fleet = config.fleet().unwrap();
        assert_eq!(fleet.num_robots(), 5);
        assert_eq!(fleet.loss.drop_probability, 0.1);
    }

    #[test]
    fn test_rejects_malformed_values() {
        let err = NodeConfig::from_lookup(lookup(&[("DPGO_NUM_ROBOTS", "three")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Parse {
                name: "DPGO_NUM_ROBOTS",
                value: "three".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_team_rejected() {
        let config = NodeConfig::from_lookup(lookup(&[("DPGO_DIMENSION", "4")])).unwrap();
        assert!(config.coordinator().is_err());
    }
}
