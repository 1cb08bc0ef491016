//! Optimizer and protocol parameters.
//!
//! The coordinator is configured by composition: [`OptimizerParams`] carries
//! what the numerical side needs to know about the problem, [`ProtocolParams`]
//! carries the coordination knobs, and [`CoordinatorConfig`] holds both.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A parameter is outside its allowed range.
    #[error("invalid parameter {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    /// A textual value could not be parsed.
    #[error("cannot parse {name} from {value:?}")]
    Parse { name: &'static str, value: String },
}

/// Policy used by the leader to choose the next robot to update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpdateRule {
    /// Pick uniformly at random among eligible active robots.
    #[default]
    Uniform,
    /// Cycle through active robots in index order.
    RoundRobin,
}

impl FromStr for UpdateRule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "uniform" => Ok(Self::Uniform),
            "roundrobin" | "round_robin" | "round-robin" => Ok(Self::RoundRobin),
            _ => Err(ConfigError::Parse {
                name: "update_rule",
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for UpdateRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uniform => write!(f, "Uniform"),
            Self::RoundRobin => write!(f, "RoundRobin"),
        }
    }
}

/// Parameters of the distributed optimization problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerParams {
    /// Dimension of the poses (2 or 3).
    pub dimension: usize,
    /// Rank of the relaxation the lifted poses live in.
    pub relaxation_rank: usize,
    /// Number of robots in the team.
    pub num_robots: usize,
    /// Let the leader issue updates without waiting for acknowledgements.
    pub asynchronous: bool,
    /// Stop after this many global iterations.
    pub max_iterations: u64,
    /// Relative change below which a robot reports it is ready to terminate.
    pub rel_change_tol: f64,
    /// Recompute robust loop-closure weights every this many iterations.
    pub robust_weight_interval: Option<u64>,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            dimension: 3,
            relaxation_rank: 5,
            num_robots: 1,
            asynchronous: false,
            max_iterations: 1000,
            rel_change_tol: 0.2,
            robust_weight_interval: None,
        }
    }
}

/// Coordination protocol parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolParams {
    /// Maximum allowed delay from other robots, in iterations.
    pub max_delayed_iterations: u64,
    /// Silence after which a peer (or an outstanding update) is given up on.
    pub timeout_threshold: Duration,
    /// Initialization steps before giving up and returning to idle.
    pub max_distributed_init_steps: u32,
    /// Time between two counted initialization steps.
    pub init_step_interval: Duration,
    /// Throttle the leader applies before issuing each update.
    pub inter_update_sleep: Duration,
    /// How the leader picks the next robot.
    pub update_rule: UpdateRule,
    /// Return to idle (instead of staying terminated) after a run ends.
    pub complete_reset: bool,
    /// Re-publish the latest public poses with every heartbeat.
    pub publish_iterate: bool,
    /// Period of status heartbeats.
    pub heartbeat_interval: Duration,
    /// Deadline of request/response exchanges with peers.
    pub request_timeout: Duration,
    /// Cadence of the coordinator tick.
    pub tick_interval: Duration,
    /// Backoff before the leader retries a failed initialization.
    pub init_retry_interval: Duration,
    /// Directory receiving one iteration log per robot, if any.
    pub iteration_log: Option<PathBuf>,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            max_delayed_iterations: 3,
            timeout_threshold: Duration::from_secs(15),
            max_distributed_init_steps: 30,
            init_step_interval: Duration::from_secs(1),
            inter_update_sleep: Duration::ZERO,
            update_rule: UpdateRule::default(),
            complete_reset: false,
            publish_iterate: false,
            heartbeat_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(100),
            init_retry_interval: Duration::from_secs(15),
            iteration_log: None,
        }
    }
}

/// Full configuration of one coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub optimizer: OptimizerParams,
    pub protocol: ProtocolParams,
}

impl CoordinatorConfig {
    /// Create a default config for a team of `num_robots`.
    #[must_use]
    pub fn new(num_robots: usize) -> Self {
        Self {
            optimizer: OptimizerParams {
                num_robots,
                ..Default::default()
            },
            protocol: ProtocolParams::default(),
        }
    }

    /// Combine explicit parameter blocks.
    #[must_use]
    pub fn from_parts(optimizer: OptimizerParams, protocol: ProtocolParams) -> Self {
        Self {
            optimizer,
            protocol,
        }
    }

    /// Set pose dimension and relaxation rank.
    #[must_use]
    pub fn with_dimensions(mut self, dimension: usize, relaxation_rank: usize) -> Self {
        self.optimizer.dimension = dimension;
        self.optimizer.relaxation_rank = relaxation_rank;
        self
    }

    /// Switch between synchronous and asynchronous scheduling.
    #[must_use]
    pub fn with_asynchronous(mut self, asynchronous: bool) -> Self {
        self.optimizer.asynchronous = asynchronous;
        self
    }

    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.optimizer.max_iterations = max_iterations;
        self
    }

    #[must_use]
    pub fn with_rel_change_tol(mut self, tol: f64) -> Self {
        self.optimizer.rel_change_tol = tol;
        self
    }

    /// Enable robust weight updates every `interval` iterations.
    #[must_use]
    pub fn with_robust_weight_interval(mut self, interval: u64) -> Self {
        self.optimizer.robust_weight_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_update_rule(mut self, rule: UpdateRule) -> Self {
        self.protocol.update_rule = rule;
        self
    }

    #[must_use]
    pub fn with_max_delayed_iterations(mut self, iterations: u64) -> Self {
        self.protocol.max_delayed_iterations = iterations;
        self
    }

    /// Set the peer timeout. The init retry backoff follows it.
    #[must_use]
    pub fn with_timeout_threshold(mut self, timeout: Duration) -> Self {
        self.protocol.timeout_threshold = timeout;
        self.protocol.init_retry_interval = timeout;
        self
    }

    #[must_use]
    pub fn with_max_init_steps(mut self, steps: u32) -> Self {
        self.protocol.max_distributed_init_steps = steps;
        self
    }

    #[must_use]
    pub fn with_init_step_interval(mut self, interval: Duration) -> Self {
        self.protocol.init_step_interval = interval;
        self
    }

    #[must_use]
    pub fn with_inter_update_sleep(mut self, sleep: Duration) -> Self {
        self.protocol.inter_update_sleep = sleep;
        self
    }

    #[must_use]
    pub fn with_complete_reset(mut self, complete_reset: bool) -> Self {
        self.protocol.complete_reset = complete_reset;
        self
    }

    #[must_use]
    pub fn with_publish_iterate(mut self, publish_iterate: bool) -> Self {
        self.protocol.publish_iterate = publish_iterate;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.protocol.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.protocol.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.protocol.tick_interval = interval;
        self
    }

    #[must_use]
    pub fn with_init_retry_interval(mut self, interval: Duration) -> Self {
        self.protocol.init_retry_interval = interval;
        self
    }

    /// Write per-robot iteration logs into `dir`.
    #[must_use]
    pub fn with_iteration_log(mut self, dir: impl Into<PathBuf>) -> Self {
        self.protocol.iteration_log = Some(dir.into());
        self
    }

    /// Check the parameters for values the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.optimizer;
        let p = &self.protocol;

        if o.num_robots == 0 {
            return Err(invalid("num_robots", "team must contain at least one robot"));
        }
        if !(2..=3).contains(&o.dimension) {
            return Err(invalid("dimension", format!("expected 2 or 3, got {}", o.dimension)));
        }
        if o.relaxation_rank < o.dimension {
            return Err(invalid(
                "relaxation_rank",
                format!("rank {} below dimension {}", o.relaxation_rank, o.dimension),
            ));
        }
        if o.robust_weight_interval == Some(0) {
            return Err(invalid("robust_weight_interval", "must be positive"));
        }
        if p.max_delayed_iterations == 0 {
            return Err(invalid("max_delayed_iterations", "must be positive"));
        }
        if p.max_distributed_init_steps == 0 {
            return Err(invalid("max_distributed_init_steps", "must be positive"));
        }
        if p.init_step_interval.is_zero() {
            return Err(invalid("init_step_interval", "must be positive"));
        }
        if p.tick_interval.is_zero() {
            return Err(invalid("tick_interval", "must be positive"));
        }
        if p.heartbeat_interval >= p.timeout_threshold {
            return Err(invalid(
                "heartbeat_interval",
                format!(
                    "{:?} must be shorter than timeout_threshold {:?}",
                    p.heartbeat_interval, p.timeout_threshold
                ),
            ));
        }
        Ok(())
    }
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoordinatorConfig::new(3);
        assert_eq!(config.optimizer.num_robots, 3);
        assert_eq!(config.protocol.max_delayed_iterations, 3);
        assert_eq!(config.protocol.max_distributed_init_steps, 30);
        assert_eq!(config.protocol.request_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_sets_fields() {
        let config = CoordinatorConfig::new(4)
            .with_update_rule(UpdateRule::RoundRobin)
            .with_asynchronous(true)
            .with_timeout_threshold(Duration::from_secs(2))
            .with_heartbeat_interval(Duration::from_millis(200))
            .with_complete_reset(true);

        assert_eq!(config.protocol.update_rule, UpdateRule::RoundRobin);
        assert!(config.optimizer.asynchronous);
        assert_eq!(config.protocol.init_retry_interval, Duration::from_secs(2));
        assert!(config.protocol.complete_reset);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_heartbeat_slower_than_timeout() {
        let config = CoordinatorConfig::new(2)
            .with_timeout_threshold(Duration::from_secs(1))
            .with_heartbeat_interval(Duration::from_secs(1));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { name: "heartbeat_interval", .. })
        ));
    }

    #[test]
    fn rejects_empty_team_and_bad_rank() {
        assert!(CoordinatorConfig::new(0).validate().is_err());
        assert!(CoordinatorConfig::new(2).with_dimensions(3, 2).validate().is_err());
        assert!(CoordinatorConfig::new(2).with_dimensions(4, 5).validate().is_err());
        assert!(CoordinatorConfig::new(2)
            .with_max_delayed_iterations(0)
            .validate()
            .is_err());
    }

    #[test]
    fn update_rule_parses() {
        assert_eq!("uniform".parse::<UpdateRule>(), Ok(UpdateRule::Uniform));
        assert_eq!("RoundRobin".parse::<UpdateRule>(), Ok(UpdateRule::RoundRobin));
        assert_eq!("round-robin".parse::<UpdateRule>(), Ok(UpdateRule::RoundRobin));
        assert!("random".parse::<UpdateRule>().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = CoordinatorConfig::new(3).with_iteration_log("/tmp/dpgo");
        let json = serde_json::to_string(&config).unwrap();
        let back: CoordinatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
