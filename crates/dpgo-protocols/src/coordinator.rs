//! Round coordinator - leader-driven distributed optimization.
//!
//! Every robot runs one [`Coordinator`]. Robot 0 is the leader: it starts
//! runs, decides which robot updates next and when the run ends. Followers
//! execute the leader's commands and keep the team informed about their
//! progress through status heartbeats.
//!
//! # Driving a coordinator
//!
//! The coordinator does no IO of its own:
//!
//! 1. Call [`receive()`](Coordinator::receive) for every message from a peer
//! 2. Call [`run_once()`](Coordinator::run_once) on every tick
//! 3. Call [`poll()`](Coordinator::poll) to collect messages to publish
//!
//! `receive` only records what arrived (liveness, cached poses, queued
//! commands). All round state changes happen inside `run_once`, which is
//! the only place commands are executed.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Initializing -> Optimizing -> Terminated
//!   ^          |               |
//!   +----------+---------------+  (init failure, leader loss, complete reset)
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::time::Instant;

use dpgo_core::{ConfigError, CoordinatorConfig, Matrix, Measurement, PoseId, PublicPose, RobotId};
use dpgo_transfer::Frame;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::barrier::{Readiness, SyncBarrier};
use crate::cache::PublicStateCache;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Error, Result};
use crate::init::InitProtocol;
use crate::log::{IterationLog, IterationRecord};
use crate::message::{
    Anchor, Command, ConnectivityReport, Envelope, Message, MeasurementWeights, PublicMeasurements,
    PublicPoses, Request, RequestId, Response, Status,
};
use crate::optimizer::{LocalGraph, LocalOptimizer};
use crate::request::{PendingKind, RequestTracker};
use crate::schedule::UpdateScheduler;

/// Lifecycle mode of a robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Waiting for a run to start.
    Idle,
    /// Loading the local graph and exchanging initialization data.
    Initializing,
    /// Executing updates.
    Optimizing,
    /// The run has ended.
    Terminated,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Optimizing => write!(f, "Optimizing"),
            Self::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Global round bookkeeping, mutated only by the tick.
#[derive(Debug)]
pub struct RoundState {
    /// Last global round issued (leader) or seen (follower).
    pub iteration: u64,
    pub mode: Mode,
    /// Robots taking part in the run.
    pub active_robots: BTreeSet<RobotId>,
    /// Run instance; bumped by the leader for every new run.
    pub instance: u64,
    scheduler: UpdateScheduler,
}

impl RoundState {
    /// Last robot picked by the update rule.
    pub fn cursor(&self) -> Option<RobotId> {
        self.scheduler.cursor()
    }
}

/// An UPDATE the leader is waiting on.
#[derive(Debug, Clone, Copy)]
struct Outstanding {
    round: u64,
    issued_at: Instant,
}

/// Leader-only scheduling state.
#[derive(Debug, Default)]
struct LeaderState {
    outstanding: BTreeMap<RobotId, Outstanding>,
    /// Not before this instant may the next UPDATE go out.
    next_update_at: Option<Instant>,
    last_weight_round: u64,
    initialize_sent: bool,
    init_failed_at: Option<Instant>,
}

/// Per-robot coordination state machine.
#[derive(Debug)]
pub struct Coordinator<O> {
    id: RobotId,
    config: CoordinatorConfig,
    optimizer: O,
    round: RoundState,
    monitor: ConnectivityMonitor,
    barrier: SyncBarrier,
    cache: PublicStateCache,
    init: InitProtocol,
    requests: RequestTracker,
    leader: LeaderState,

    /// Commands waiting for the next tick, with their run instance.
    inbox: VecDeque<(u64, Command)>,
    outbox: Vec<Envelope>,

    /// Measurements supplied by the host, loaded when a run starts.
    pose_graph: Option<Vec<Measurement>>,
    neighbors: BTreeSet<RobotId>,
    public_indices: BTreeSet<u32>,
    shared_loop_closures: Vec<Measurement>,

    /// Successful local updates in this run.
    local_iteration: u64,
    /// Last global round whose UPDATE was handled.
    handled_round: u64,
    pending_updates: VecDeque<u64>,
    last_objective: Option<f64>,

    first_tick: Option<Instant>,
    last_heartbeat: Option<Instant>,
    last_command_at: Option<Instant>,
    optimizing_since: Option<Instant>,
    reported_reachable: BTreeSet<RobotId>,
    log: Option<IterationLog>,
}

impl<O: LocalOptimizer> Coordinator<O> {
    /// Create a coordinator for robot `id`.
    ///
    /// Fails if the configuration is invalid, `id` is outside the team, or
    /// the iteration log cannot be opened.
    pub fn new(id: RobotId, config: CoordinatorConfig, optimizer: O) -> Result<Self> {
        config.validate()?;
        if id.index() >= config.optimizer.num_robots {
            return Err(Error::Config(ConfigError::Invalid {
                name: "robot_id",
                reason: format!(
                    "robot {id} outside a team of {}",
                    config.optimizer.num_robots
                ),
            }));
        }

        let log = match &config.protocol.iteration_log {
            Some(dir) => Some(IterationLog::open(log_path(dir, id))?),
            None => None,
        };

        let p = &config.protocol;
        let round = RoundState {
            iteration: 0,
            mode: Mode::Idle,
            active_robots: initial_active_set(id, config.optimizer.num_robots),
            instance: 0,
            scheduler: UpdateScheduler::new(p.update_rule, u64::from(id.0)),
        };

        debug!(
            robot = %id,
            leader = id.is_leader(),
            num_robots = config.optimizer.num_robots,
            update_rule = %p.update_rule,
            asynchronous = config.optimizer.asynchronous,
            "Created coordinator"
        );

        Ok(Self {
            id,
            monitor: ConnectivityMonitor::new(id, p.timeout_threshold),
            barrier: SyncBarrier::new(p.max_delayed_iterations),
            cache: PublicStateCache::new(),
            init: InitProtocol::new(p.max_distributed_init_steps, p.init_step_interval),
            requests: RequestTracker::new(p.request_timeout),
            leader: LeaderState::default(),
            round,
            config,
            optimizer,
            inbox: VecDeque::new(),
            outbox: Vec::new(),
            pose_graph: None,
            neighbors: BTreeSet::new(),
            public_indices: BTreeSet::new(),
            shared_loop_closures: Vec::new(),
            local_iteration: 0,
            handled_round: 0,
            pending_updates: VecDeque::new(),
            last_objective: None,
            first_tick: None,
            last_heartbeat: None,
            last_command_at: None,
            optimizing_since: None,
            reported_reachable: BTreeSet::new(),
            log,
        })
    }

    #[must_use]
    pub const fn id(&self) -> RobotId {
        self.id
    }

    #[must_use]
    pub const fn is_leader(&self) -> bool {
        self.id.is_leader()
    }

    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.round.mode
    }

    /// Global round counter.
    #[must_use]
    pub const fn iteration(&self) -> u64 {
        self.round.iteration
    }

    /// Successful local updates in the current run.
    #[must_use]
    pub const fn local_iteration(&self) -> u64 {
        self.local_iteration
    }

    #[must_use]
    pub const fn instance(&self) -> u64 {
        self.round.instance
    }

    pub fn round(&self) -> &RoundState {
        &self.round
    }

    pub fn active_robots(&self) -> &BTreeSet<RobotId> {
        &self.round.active_robots
    }

    pub fn objective(&self) -> Option<f64> {
        self.last_objective
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn cache(&self) -> &PublicStateCache {
        &self.cache
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn barrier(&self) -> &SyncBarrier {
        &self.barrier
    }

    /// Hand over this robot's measurements for the next run.
    pub fn submit_pose_graph(&mut self, measurements: Vec<Measurement>) {
        debug!(robot = %self.id, count = measurements.len(), "Pose graph submitted");
        self.pose_graph = Some(measurements);
    }

    pub fn has_pose_graph(&self) -> bool {
        self.pose_graph.is_some()
    }

    /// Own trajectory in the global frame fixed by the leader's first pose.
    pub fn trajectory(&self) -> Result<Vec<Matrix>> {
        if !matches!(self.round.mode, Mode::Optimizing | Mode::Terminated) {
            return Err(Error::InvalidState {
                expected: "Optimizing or Terminated",
                actual: self.round.mode.to_string(),
            });
        }
        let anchor = if self.is_leader() {
            self.optimizer.pose_estimate(0)
        } else {
            self.init
                .anchor()
                .filter(|p| p.is_active_cluster())
                .map(|p| p.value.clone())
        };
        let anchor = anchor.ok_or_else(|| Error::InvalidState {
            expected: "anchor received",
            actual: "no anchor".to_string(),
        })?;
        Ok(self.optimizer.trajectory_in_global_frame(&anchor))
    }

    /// Current status heartbeat.
    pub fn status(&self) -> Status {
        Status {
            robot: self.id,
            mode: self.round.mode,
            iteration: self.local_iteration,
            round: self.handled_round,
            connected: self.round.active_robots.contains(&self.id),
            objective: self.last_objective,
            initialized: self.init.is_ready(),
            ready_to_terminate: self.ready_to_terminate(),
            received_shared_loop_closures: self.missing_shared_loop_closures().is_none(),
        }
    }

    /// Take the messages produced since the last poll.
    pub fn poll(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    /// Decode and receive a frame from the bus.
    pub fn receive_frame(&mut self, frame: &Frame, now: Instant) -> Result<()> {
        let envelope = Envelope::from_frame(frame)?;
        if envelope.from != frame.from() {
            return Err(Error::ProtocolViolation(format!(
                "envelope from {} carried by a frame from {}",
                envelope.from,
                frame.from()
            )));
        }
        if matches!(
            envelope.message,
            Message::PublicPoses(_) | Message::Response { .. }
        ) {
            self.cache.record_bytes(frame.len());
        }
        self.receive(envelope, now);
        Ok(())
    }

    /// Record a message from a peer.
    pub fn receive(&mut self, envelope: Envelope, now: Instant) {
        let Envelope {
            from,
            instance,
            message,
        } = envelope;
        if from == self.id {
            return;
        }
        self.monitor.observe(from, now);

        match message {
            Message::Command(cmd) => {
                if !from.is_leader() {
                    self.violation(from, format!("{cmd} issued by a follower"));
                    return;
                }
                self.last_command_at = Some(now);
                self.inbox.push_back((instance, cmd));
            }
            Message::Request { id, to, request } => {
                if to == self.id {
                    self.serve(from, id, request);
                }
            }
            Message::Response { id, to, response } => {
                if to == self.id {
                    self.handle_response(from, id, response);
                }
            }
            other => {
                if instance != self.round.instance {
                    trace!(
                        robot = %self.id,
                        from = %from,
                        instance,
                        current = self.round.instance,
                        channel = %other.channel(),
                        "Dropping message from another run instance"
                    );
                    return;
                }
                self.receive_public_state(from, other);
            }
        }
    }

    /// Execute one tick.
    ///
    /// Returns [`Error::InitializationExhausted`] when a run had to be
    /// abandoned during initialization; the coordinator is back in
    /// [`Mode::Idle`] and keeps working.
    pub fn run_once(&mut self, now: Instant) -> Result<()> {
        self.first_tick.get_or_insert(now);

        for (id, pending) in self.requests.expire(now) {
            warn!(
                robot = %self.id,
                to = %pending.to,
                request_id = id,
                kind = ?pending.kind,
                timeout = ?self.requests.timeout(),
                "Request timed out"
            );
        }

        while let Some((instance, cmd)) = self.inbox.pop_front() {
            self.handle_command(instance, cmd, now);
        }

        self.check_connectivity(now);

        let result = match self.round.mode {
            Mode::Idle => {
                if self.is_leader() {
                    self.try_start_run(now);
                }
                Ok(())
            }
            Mode::Initializing => self.initialization_step(now),
            Mode::Optimizing => {
                self.optimization_step(now);
                Ok(())
            }
            Mode::Terminated => Ok(()),
        };

        self.heartbeat(now);
        result
    }

    // Inbound

    fn receive_public_state(&mut self, from: RobotId, message: Message) {
        match message {
            Message::Status(status) => {
                if status.robot != from {
                    self.violation(from, format!("status on behalf of robot {}", status.robot));
                    return;
                }
                self.barrier.observe_iteration(from, status.iteration);
                self.monitor.record_status(&status);
            }
            Message::PublicPoses(PublicPoses {
                robot,
                iteration,
                poses,
            }) => {
                if robot != from {
                    self.violation(from, format!("public poses on behalf of robot {robot}"));
                    return;
                }
                let mut updated = 0;
                for pose in poses {
                    if pose.pose_id.robot != from {
                        self.violation(from, format!("published foreign pose {}", pose.pose_id));
                        continue;
                    }
                    if self.cache.put_pose(pose) {
                        updated += 1;
                    }
                }
                self.barrier.observe_iteration(from, iteration);
                trace!(robot = %self.id, from = %from, iteration, updated, "Public poses");
            }
            Message::PublicMeasurements(PublicMeasurements {
                robot,
                measurements,
            }) => {
                if robot != from {
                    self.violation(from, format!("measurements on behalf of robot {robot}"));
                    return;
                }
                let shared_with_us = measurements.iter().filter(|m| m.involves(self.id)).count();
                if !self.barrier.has_shared_loop_closures(from) {
                    debug!(
                        robot = %self.id,
                        from = %from,
                        shared_with_us,
                        "Received shared loop closures"
                    );
                }
                self.barrier.mark_shared_loop_closures(from);
            }
            Message::MeasurementWeights(MeasurementWeights { weights, .. }) => {
                for weight in weights {
                    match self.cache.put_weight(from, weight.clone()) {
                        Ok(true) if weight.edge.involves(self.id) => {
                            self.optimizer.apply_measurement_weight(&weight);
                        }
                        Ok(_) => {}
                        Err(e) => warn!(robot = %self.id, from = %from, error = %e, "Rejected weight"),
                    }
                }
            }
            Message::Anchor(Anchor { pose }) => {
                if !from.is_leader() || pose.pose_id != PoseId::new(RobotId::LEADER, 0) {
                    self.violation(from, format!("anchor {} not published by the leader", pose.pose_id));
                    return;
                }
                if pose.is_active_cluster() {
                    self.init.set_anchor(pose);
                }
            }
            Message::Connectivity(ConnectivityReport { robot, reachable }) => {
                if robot != from {
                    self.violation(from, format!("report on behalf of robot {robot}"));
                    return;
                }
                if self.is_leader() {
                    let unreachable: Vec<_> = self
                        .round
                        .active_robots
                        .difference(&reachable)
                        .copied()
                        .collect();
                    if !unreachable.is_empty() {
                        debug!(robot = %from, unreachable = ?unreachable, "Follower cannot hear active robots");
                    }
                }
                self.monitor.record_report(from, reachable);
            }
            Message::Command(_) | Message::Request { .. } | Message::Response { .. } => {}
        }
    }

    fn serve(&mut self, from: RobotId, id: RequestId, request: Request) {
        let response = match request {
            Request::LiftingMatrix => {
                if !self.is_leader() {
                    Response::Refused {
                        reason: "only the leader serves the lifting matrix".to_string(),
                    }
                } else {
                    match self.optimizer.lifting_matrix() {
                        Some(matrix) => Response::LiftingMatrix(matrix),
                        None => Response::Refused {
                            reason: "lifting matrix not computed yet".to_string(),
                        },
                    }
                }
            }
            Request::Poses { indices } => self.pose_response(&indices),
        };
        trace!(robot = %self.id, to = %from, request_id = id, "Serving request");
        self.send(Message::Response {
            id,
            to: from,
            response,
        });
    }

    fn pose_response(&self, indices: &[u32]) -> Response {
        if indices.len() > self.optimizer.num_poses() {
            return Response::Refused {
                reason: format!(
                    "requested {} poses but robot has {}",
                    indices.len(),
                    self.optimizer.num_poses()
                ),
            };
        }
        let cluster = self.optimizer.active_cluster();
        let mut poses = Vec::with_capacity(indices.len());
        for &index in indices {
            match self.optimizer.pose_estimate(index) {
                Some(value) => poses.push(PublicPose::new(
                    PoseId::new(self.id, index),
                    cluster,
                    value,
                    self.local_iteration,
                )),
                None => {
                    return Response::Refused {
                        reason: format!("no pose with index {index}"),
                    }
                }
            }
        }
        Response::Poses(poses)
    }

    fn handle_response(&mut self, from: RobotId, id: RequestId, response: Response) {
        let Some(pending) = self.requests.resolve(id, from) else {
            debug!(robot = %self.id, from = %from, request_id = id, "Ignoring late or unknown response");
            return;
        };
        match (pending.kind, response) {
            (PendingKind::LiftingMatrix, Response::LiftingMatrix(matrix)) => {
                let expected = (self.optimizer.relaxation_rank(), self.optimizer.dimension());
                if matrix.shape() != expected {
                    self.violation(
                        from,
                        format!("lifting matrix of shape {:?}, expected {expected:?}", matrix.shape()),
                    );
                    return;
                }
                info!(robot = %self.id, "Received lifting matrix");
                self.optimizer.set_lifting_matrix(matrix);
            }
            (PendingKind::Poses { indices }, Response::Poses(poses)) => {
                if poses.len() != indices.len() {
                    self.violation(
                        from,
                        format!("answered {} poses for {} requested", poses.len(), indices.len()),
                    );
                    return;
                }
                for pose in poses {
                    if pose.pose_id.robot != from {
                        self.violation(from, format!("answered with foreign pose {}", pose.pose_id));
                        continue;
                    }
                    self.cache.put_pose(pose);
                }
            }
            (kind, Response::Refused { reason }) => {
                warn!(robot = %self.id, from = %from, kind = ?kind, reason, "Request refused");
            }
            (kind, _) => self.violation(from, format!("response does not answer {kind:?}")),
        }
    }

    fn violation(&self, from: RobotId, what: String) {
        warn!(
            robot = %self.id,
            from = %from,
            error = %Error::ProtocolViolation(what),
            "Discarding message"
        );
    }

    // Commands

    fn handle_command(&mut self, instance: u64, cmd: Command, now: Instant) {
        if instance < self.round.instance {
            trace!(robot = %self.id, command = %cmd, instance, "Dropping stale command");
            return;
        }
        if instance > self.round.instance {
            if self.is_leader() {
                warn!(robot = %self.id, instance, "Ignoring command from a newer instance");
                return;
            }
            self.adopt_instance(instance);
        }

        if !self.is_leader()
            && self.round.mode == Mode::Idle
            && matches!(
                cmd,
                Command::RequestPoseGraph
                    | Command::Initialize
                    | Command::Update { .. }
                    | Command::UpdateWeight { .. }
            )
        {
            self.enter_initializing(now);
        }

        debug!(robot = %self.id, command = %cmd, instance, mode = %self.round.mode, "Handling command");

        match cmd {
            Command::RequestPoseGraph | Command::Noop => {}
            Command::Initialize => {
                if self.round.mode == Mode::Initializing {
                    self.init.set_initialize_received();
                    if self.init.is_ready() {
                        self.enter_optimizing(now);
                    }
                }
            }
            Command::Update { robot, round } => {
                self.round.iteration = self.round.iteration.max(round);
                if robot == self.id {
                    if self.round.mode == Mode::Optimizing {
                        self.pending_updates.push_back(round);
                    } else {
                        debug!(robot = %self.id, round, mode = %self.round.mode, "Cannot update yet");
                    }
                }
            }
            Command::UpdateWeight { robot } => {
                if robot == self.id && self.round.mode == Mode::Optimizing {
                    self.update_weights();
                }
            }
            Command::Terminate => self.terminate(false, now),
            Command::HardTerminate => self.terminate(true, now),
            Command::ActiveRobots { robots } => {
                if !self.is_leader() && robots != self.round.active_robots {
                    info!(robot = %self.id, active = ?robots, "Active robots changed");
                    self.round.active_robots = robots;
                }
            }
        }
    }

    fn adopt_instance(&mut self, instance: u64) {
        info!(robot = %self.id, instance, previous = self.round.instance, "Joining run");
        self.reset_run();
        self.round.instance = instance;
        self.round.mode = Mode::Idle;
        self.round.active_robots = initial_active_set(self.id, self.config.optimizer.num_robots);
        self.monitor.reset_progress();
    }

    fn terminate(&mut self, hard: bool, now: Instant) {
        let cancelled = self.requests.cancel_all();
        self.pending_updates.clear();
        self.leader = LeaderState::default();

        if hard {
            warn!(robot = %self.id, cancelled, "Hard termination, dropping run state");
            self.reset_run();
            self.pose_graph = None;
        } else {
            info!(
                robot = %self.id,
                iteration = self.round.iteration,
                local_iteration = self.local_iteration,
                objective = ?self.last_objective,
                "Run terminated"
            );
            if let Ok(trajectory) = self.trajectory() {
                info!(robot = %self.id, poses = trajectory.len(), "Trajectory available in global frame");
            }
            self.pose_graph = None;
        }

        if self.config.protocol.complete_reset {
            self.reset_round();
            self.round.mode = Mode::Idle;
        } else {
            self.round.mode = Mode::Terminated;
        }
        self.publish_status(now);
    }

    // Idle

    fn try_start_run(&mut self, now: Instant) {
        if self.pose_graph.is_none() {
            return;
        }
        if let Some(failed_at) = self.leader.init_failed_at {
            if now.saturating_duration_since(failed_at) < self.config.protocol.init_retry_interval {
                return;
            }
        }
        let team = self.monitor.connected_robots();
        let waited = self
            .first_tick
            .is_some_and(|t| now.saturating_duration_since(t) >= self.config.protocol.timeout_threshold);
        if team.len() < self.config.optimizer.num_robots && !waited {
            return;
        }

        self.reset_run();
        self.monitor.reset_progress();
        self.round.instance += 1;
        self.round.active_robots = team.clone();
        info!(robot = %self.id, instance = self.round.instance, active = ?team, "Starting run");

        self.issue(Command::ActiveRobots { robots: team });
        self.issue(Command::RequestPoseGraph);
        self.enter_initializing(now);
    }

    // Initialization

    fn enter_initializing(&mut self, now: Instant) {
        info!(robot = %self.id, instance = self.round.instance, "Initializing");
        self.round.mode = Mode::Initializing;
        self.init.begin(now);
        if self.load_pose_graph() {
            self.publish_shared_loop_closures();
        }
    }

    /// Classify the submitted measurements and hand them to the optimizer.
    fn load_pose_graph(&mut self) -> bool {
        if self.init.graph_loaded() {
            return true;
        }
        let Some(measurements) = &self.pose_graph else {
            return false;
        };
        let (graph, foreign) = LocalGraph::classify(self.id, measurements.clone());
        if !foreign.is_empty() {
            warn!(robot = %self.id, count = foreign.len(), "Ignoring measurements of other robots");
        }
        self.neighbors = graph.neighbors();
        self.public_indices = graph.public_pose_indices();
        self.shared_loop_closures = graph.shared_loop_closures.clone();
        info!(
            robot = %self.id,
            odometry = graph.odometry.len(),
            private_loop_closures = graph.private_loop_closures.len(),
            shared_loop_closures = graph.shared_loop_closures.len(),
            neighbors = ?self.neighbors,
            "Loaded local pose graph"
        );
        self.optimizer.set_local_graph(graph);
        self.init.set_graph_loaded();
        true
    }

    fn initialization_step(&mut self, now: Instant) -> Result<()> {
        let counted = self.init.tick(now);
        let loaded = self.load_pose_graph();
        if counted && loaded {
            self.publish_shared_loop_closures();
        }

        if self.optimizer.lifting_matrix().is_none() {
            if self.is_leader() {
                if loaded && self.optimizer.generate_lifting_matrix().is_none() && counted {
                    warn!(robot = %self.id, "Lifting matrix not available");
                }
            } else if !self
                .requests
                .is_pending(RobotId::LEADER, |k| *k == PendingKind::LiftingMatrix)
            {
                let id = self
                    .requests
                    .issue(RobotId::LEADER, PendingKind::LiftingMatrix, now);
                debug!(robot = %self.id, request_id = id, "Requesting lifting matrix");
                self.send(Message::Request {
                    id,
                    to: RobotId::LEADER,
                    request: Request::LiftingMatrix,
                });
            }
        }

        if self.is_leader() && counted {
            self.reissue_pose_graph_request();
        }

        let was_ready = self.init.is_ready();
        let ready = loaded
            && self.optimizer.lifting_matrix().is_some()
            && self.missing_shared_loop_closures().is_none();
        self.init.set_ready(ready);

        if ready {
            if !was_ready {
                info!(robot = %self.id, steps = self.init.steps_done(), "Local initialization complete");
                self.publish_status(now);
            }
            if self.is_leader() {
                self.leader_initialize();
                if !self.leader.initialize_sent && self.init.steps_done() >= self.init.max_steps() {
                    let e = Error::InitializationExhausted {
                        steps: self.init.steps_done(),
                    };
                    error!(
                        robot = %self.id,
                        error = %e,
                        waiting_for = ?self.uninitialized_peers(),
                        "Team initialization failed"
                    );
                    self.abandon_run(now);
                    return Err(e);
                }
            } else if self.init.initialize_received() {
                self.enter_optimizing(now);
            }
            return Ok(());
        }

        if counted {
            debug!(
                robot = %self.id,
                step = self.init.steps_done(),
                max_steps = self.init.max_steps(),
                graph_loaded = loaded,
                lifting_matrix = self.optimizer.lifting_matrix().is_some(),
                waiting_for = ?self.missing_shared_loop_closures(),
                "Initialization step"
            );
        }

        if let Err(e) = self.init.check_budget() {
            error!(robot = %self.id, error = %e, "Distributed initialization failed");
            self.abandon_run(now);
            return Err(e);
        }
        Ok(())
    }

    /// Peers that missed REQUEST_POSE_GRAPH get it again.
    fn reissue_pose_graph_request(&mut self) {
        let missing = self.round.active_robots.iter().any(|r| {
            *r != self.id
                && !matches!(
                    self.monitor.peer(*r).and_then(|p| p.mode),
                    Some(Mode::Initializing | Mode::Optimizing)
                )
        });
        if missing {
            self.issue(Command::RequestPoseGraph);
        }
    }

    fn leader_initialize(&mut self) {
        if self.leader.initialize_sent {
            return;
        }
        if self.uninitialized_peers().is_empty() {
            info!(robot = %self.id, active = ?self.round.active_robots, "Team initialized");
            self.leader.initialize_sent = true;
            self.issue(Command::Initialize);
        }
    }

    /// Active peers that have not reported a finished initialization.
    fn uninitialized_peers(&self) -> Vec<RobotId> {
        self.round
            .active_robots
            .iter()
            .copied()
            .filter(|r| *r != self.id)
            .filter(|r| !self.monitor.peer(*r).is_some_and(|p| p.initialized))
            .collect()
    }

    fn abandon_run(&mut self, now: Instant) {
        self.requests.cancel_all();
        self.pending_updates.clear();
        self.init.reset();
        self.barrier.reset();
        self.reset_round();
        self.round.mode = Mode::Idle;
        if self.is_leader() {
            self.leader.init_failed_at = Some(now);
        }
    }

    fn enter_optimizing(&mut self, now: Instant) {
        info!(robot = %self.id, instance = self.round.instance, "Optimizing");
        self.round.mode = Mode::Optimizing;
        self.optimizing_since = Some(now);
        self.last_command_at = Some(now);
        self.barrier.observe_iteration(self.id, self.local_iteration);
        self.publish_public_poses();
        if self.is_leader() {
            self.publish_anchor();
        }
        self.publish_status(now);
    }

    // Optimization

    fn optimization_step(&mut self, now: Instant) {
        self.process_pending_update(now);
        if self.is_leader() {
            self.schedule_updates(now);
        } else {
            self.check_command_watchdog(now);
        }
    }

    fn process_pending_update(&mut self, now: Instant) {
        let Some(&round) = self.pending_updates.front() else {
            return;
        };
        let active_peers = self.active_peers();
        let neighbors: BTreeSet<RobotId> =
            self.neighbors.intersection(&active_peers).copied().collect();

        match self
            .barrier
            .check(self.local_iteration, &active_peers, &neighbors)
        {
            Readiness::Ready => {}
            Readiness::Lagging { slowest, lag } => {
                debug!(
                    robot = %self.id,
                    round,
                    slowest = %slowest,
                    lag,
                    required = self.barrier.iter_required(slowest),
                    received = self.barrier.iter_received(slowest),
                    "Deferring update"
                );
                return;
            }
            Readiness::AwaitingSharedLoopClosures { robot } => {
                debug!(robot = %self.id, round, waiting_for = %robot, "Deferring update");
                return;
            }
        }
        if !self.feed_neighbor_poses(&neighbors, now) {
            return;
        }

        self.pending_updates.pop_front();
        self.handled_round = self.handled_round.max(round);

        let result = self.optimizer.local_update();
        if result.success {
            self.local_iteration += 1;
            self.barrier.observe_iteration(self.id, self.local_iteration);
            self.last_objective = Some(result.objective_after);
            debug!(
                robot = %self.id,
                round,
                iteration = self.local_iteration,
                objective_before = result.objective_before,
                objective_after = result.objective_after,
                "Local update"
            );
            self.log_iteration(now, result.objective_after);
        } else {
            warn!(robot = %self.id, round, "Local update failed, no progress this round");
        }

        self.publish_public_poses();
        if self.is_leader() {
            self.publish_anchor();
        }
        self.publish_status(now);
    }

    /// Give the optimizer the cached poses it needs.
    ///
    /// Returns false if poses of an active neighbor are missing; they are
    /// queried and the update is deferred.
    fn feed_neighbor_poses(&mut self, active_neighbors: &BTreeSet<RobotId>, now: Instant) -> bool {
        let mut complete = true;
        let neighbors: Vec<RobotId> = self.neighbors.iter().copied().collect();
        for neighbor in neighbors {
            let mut missing = Vec::new();
            for pose_id in self.optimizer.neighbor_pose_requirements(neighbor) {
                if let Some(pose) = self.cache.active_pose(&pose_id) {
                    self.optimizer
                        .apply_neighbor_pose(pose.cluster, neighbor, pose_id, &pose.value);
                } else if let Some(pose) = self.cache.get(&pose_id) {
                    trace!(robot = %self.id, pose = %pose_id, cluster = pose.cluster, "Skipping pose outside active cluster");
                } else {
                    missing.push(pose_id.index);
                }
            }
            if missing.is_empty() || !active_neighbors.contains(&neighbor) {
                continue;
            }
            complete = false;
            let already_asked = self
                .requests
                .is_pending(neighbor, |k| matches!(k, PendingKind::Poses { .. }));
            if !already_asked {
                let id = self.requests.issue(
                    neighbor,
                    PendingKind::Poses {
                        indices: missing.clone(),
                    },
                    now,
                );
                debug!(robot = %self.id, neighbor = %neighbor, missing = ?missing, "Querying missing poses");
                self.send(Message::Request {
                    id,
                    to: neighbor,
                    request: Request::Poses { indices: missing },
                });
            }
        }
        complete
    }

    fn update_weights(&mut self) {
        let weights = self.optimizer.update_measurement_weights();
        if weights.is_empty() {
            return;
        }
        for weight in &weights {
            if let Err(e) = self.cache.put_weight(self.id, weight.clone()) {
                warn!(robot = %self.id, error = %e, "Optimizer produced a weight it does not own");
            }
        }
        let converged = weights.iter().filter(|w| w.converged).count();
        debug!(robot = %self.id, count = weights.len(), converged, "Updated robust weights");
        self.send(Message::MeasurementWeights(MeasurementWeights {
            robot: self.id,
            weights,
        }));
    }

    fn check_command_watchdog(&mut self, now: Instant) {
        let timeout = self.config.protocol.timeout_threshold;
        let silent = self
            .last_command_at
            .is_some_and(|t| now.saturating_duration_since(t) > timeout);
        if silent {
            warn!(robot = %self.id, timeout = ?timeout, "No command from the leader, resetting");
            self.requests.cancel_all();
            self.reset_run();
            self.reset_round();
            self.round.mode = Mode::Idle;
            self.last_command_at = None;
        }
    }

    // Leader scheduling

    fn schedule_updates(&mut self, now: Instant) {
        self.collect_acknowledgements(now);

        if self.should_terminate() {
            info!(
                robot = %self.id,
                iteration = self.round.iteration,
                "Terminating run"
            );
            self.issue(Command::Terminate);
            return;
        }
        if self.round.iteration >= self.config.optimizer.max_iterations {
            return;
        }
        if !self.config.optimizer.asynchronous && !self.leader.outstanding.is_empty() {
            return;
        }
        if self.leader.next_update_at.is_some_and(|t| now < t) {
            return;
        }

        self.request_weight_updates();

        let active = self.round.active_robots.clone();
        let eligible: BTreeSet<RobotId> = active
            .iter()
            .copied()
            .filter(|r| self.is_eligible(*r, &active))
            .collect();
        let Some(robot) = self.round.scheduler.select(&active, |r| eligible.contains(&r)) else {
            trace!(robot = %self.id, active = ?active, "No robot eligible for update");
            return;
        };

        let round = self.round.iteration + 1;
        self.round.iteration = round;
        self.leader.outstanding.insert(
            robot,
            Outstanding {
                round,
                issued_at: now,
            },
        );
        self.leader.next_update_at = Some(now + self.config.protocol.inter_update_sleep);
        trace!(robot = %self.id, selected = %robot, round, "Issuing update");
        self.issue(Command::Update { robot, round });
    }

    fn is_eligible(&self, robot: RobotId, active: &BTreeSet<RobotId>) -> bool {
        if self.leader.outstanding.contains_key(&robot) {
            return false;
        }
        let optimizing = if robot == self.id {
            self.round.mode == Mode::Optimizing
        } else {
            self.monitor.peer(robot).is_some_and(|p| p.is_optimizing())
        };
        optimizing && self.barrier.within_bound(robot, active)
    }

    /// Drop acknowledged updates; give up on robots that never answer.
    fn collect_acknowledgements(&mut self, now: Instant) {
        let timeout = self.config.protocol.timeout_threshold;
        let id = self.id;
        let handled_round = self.handled_round;
        let monitor = &self.monitor;
        let mut timed_out = Vec::new();

        self.leader.outstanding.retain(|robot, o| {
            let handled = if *robot == id {
                handled_round
            } else {
                monitor.peer(*robot).map_or(0, |p| p.round)
            };
            if handled >= o.round {
                false
            } else if now.saturating_duration_since(o.issued_at) > timeout {
                timed_out.push(*robot);
                false
            } else {
                true
            }
        });

        if timed_out.is_empty() {
            return;
        }
        for robot in &timed_out {
            warn!(robot = %self.id, unresponsive = %robot, "Update not acknowledged in time");
            if *robot != self.id {
                self.monitor.mark_disconnected(*robot);
            }
        }
        self.refresh_active_set();
    }

    fn should_terminate(&self) -> bool {
        if self.round.iteration >= self.config.optimizer.max_iterations
            && self.leader.outstanding.is_empty()
        {
            return true;
        }
        self.round.iteration > 0
            && self.ready_to_terminate()
            && self
                .round
                .active_robots
                .iter()
                .filter(|r| **r != self.id)
                .all(|r| self.monitor.peer(*r).is_some_and(|p| p.ready_to_terminate))
    }

    fn request_weight_updates(&mut self) {
        let Some(interval) = self.config.optimizer.robust_weight_interval else {
            return;
        };
        let iteration = self.round.iteration;
        if iteration == 0 || iteration % interval != 0 || self.leader.last_weight_round == iteration {
            return;
        }
        self.leader.last_weight_round = iteration;
        debug!(robot = %self.id, iteration, "Requesting robust weight updates");
        let active: Vec<RobotId> = self.round.active_robots.iter().copied().collect();
        for robot in active {
            self.issue(Command::UpdateWeight { robot });
        }
    }

    /// Robots that are connected and take part in the current phase.
    fn participants(&self) -> BTreeSet<RobotId> {
        let optimizing = self.round.mode == Mode::Optimizing;
        self.monitor
            .connected_robots()
            .into_iter()
            .filter(|r| {
                *r == self.id
                    || !optimizing
                    || self
                        .monitor
                        .peer(*r)
                        .is_some_and(|p| p.initialized || p.is_optimizing())
            })
            .collect()
    }

    fn refresh_active_set(&mut self) {
        let active = self.participants();
        if active == self.round.active_robots {
            return;
        }
        info!(
            robot = %self.id,
            previous = ?self.round.active_robots,
            active = ?active,
            "Active robots changed"
        );
        self.leader.outstanding.retain(|r, _| active.contains(r));
        self.round.active_robots = active.clone();
        self.issue(Command::ActiveRobots { robots: active });
    }

    fn check_connectivity(&mut self, now: Instant) {
        self.monitor.check(now);
        if self.is_leader() {
            if matches!(self.round.mode, Mode::Initializing | Mode::Optimizing) {
                self.refresh_active_set();
            }
            return;
        }
        let reachable = self.monitor.connected_robots();
        if reachable != self.reported_reachable {
            self.reported_reachable = reachable.clone();
            self.send(Message::Connectivity(ConnectivityReport {
                robot: self.id,
                reachable,
            }));
        }
    }

    // Outbound

    fn heartbeat(&mut self, now: Instant) {
        let due = self.last_heartbeat.map_or(true, |t| {
            now.saturating_duration_since(t) >= self.config.protocol.heartbeat_interval
        });
        if !due {
            return;
        }
        self.publish_status(now);

        if self.round.mode != Mode::Optimizing {
            return;
        }
        if self.config.protocol.publish_iterate {
            self.publish_public_poses();
        }
        let rejoining = self.round.active_robots.iter().any(|r| {
            self.monitor
                .peer(*r)
                .is_some_and(|p| p.mode == Some(Mode::Initializing))
        });
        if rejoining {
            self.publish_shared_loop_closures();
        }
        if self.is_leader() {
            self.publish_anchor();
            // Keeps follower watchdogs quiet while an update is outstanding.
            self.send(Message::Command(Command::Noop));
            let lost_initialize = self.round.active_robots.iter().any(|r| {
                self.monitor
                    .peer(*r)
                    .is_some_and(|p| p.initialized && p.mode == Some(Mode::Initializing))
            });
            if lost_initialize {
                self.issue(Command::Initialize);
            }
        }
    }

    fn publish_status(&mut self, now: Instant) {
        let status = self.status();
        self.send(Message::Status(status));
        self.last_heartbeat = Some(now);
    }

    fn publish_shared_loop_closures(&mut self) {
        self.send(Message::PublicMeasurements(PublicMeasurements {
            robot: self.id,
            measurements: self.shared_loop_closures.clone(),
        }));
    }

    fn publish_public_poses(&mut self) {
        if self.public_indices.is_empty() {
            return;
        }
        let cluster = self.optimizer.active_cluster();
        let poses: Vec<PublicPose> = self
            .public_indices
            .iter()
            .filter_map(|index| {
                self.optimizer.pose_estimate(*index).map(|value| {
                    PublicPose::new(
                        PoseId::new(self.id, *index),
                        cluster,
                        value,
                        self.local_iteration,
                    )
                })
            })
            .collect();
        self.send(Message::PublicPoses(PublicPoses {
            robot: self.id,
            iteration: self.local_iteration,
            poses,
        }));
    }

    fn publish_anchor(&mut self) {
        if let Some(value) = self.optimizer.pose_estimate(0) {
            let pose = PublicPose::new(
                PoseId::new(self.id, 0),
                self.optimizer.active_cluster(),
                value,
                self.local_iteration,
            );
            self.send(Message::Anchor(Anchor { pose }));
        }
    }

    fn log_iteration(&mut self, now: Instant, objective: f64) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        let elapsed = self
            .optimizing_since
            .map_or(0, |t| now.saturating_duration_since(t).as_millis() as u64);
        let record = IterationRecord {
            robot: self.id,
            iteration: self.local_iteration,
            elapsed_ms: elapsed,
            objective,
            bytes_received: self.cache.bytes_received(),
        };
        if let Err(e) = log.append(&record) {
            warn!(robot = %self.id, path = %log.path().display(), error = %e, "Failed to write iteration log");
        }
    }

    fn send(&mut self, message: Message) {
        self.outbox
            .push(Envelope::new(self.id, self.round.instance, message));
    }

    /// Publish a command and queue it for the leader itself.
    fn issue(&mut self, cmd: Command) {
        self.send(Message::Command(cmd.clone()));
        self.inbox.push_back((self.round.instance, cmd));
    }

    // Helpers

    fn active_peers(&self) -> BTreeSet<RobotId> {
        self.round
            .active_robots
            .iter()
            .copied()
            .filter(|r| *r != self.id)
            .collect()
    }

    /// First active neighbor whose shared loop closures are still missing.
    fn missing_shared_loop_closures(&self) -> Option<RobotId> {
        self.neighbors
            .iter()
            .copied()
            .filter(|r| self.round.active_robots.contains(r))
            .find(|r| !self.barrier.has_shared_loop_closures(*r))
    }

    fn ready_to_terminate(&self) -> bool {
        self.round.mode == Mode::Optimizing
            && self.local_iteration > 0
            && self.optimizer.relative_change() < self.config.optimizer.rel_change_tol
    }

    /// Drop everything scoped to one run.
    fn reset_run(&mut self) {
        self.requests.cancel_all();
        self.pending_updates.clear();
        self.barrier.reset();
        self.init.reset();
        self.cache.clear();
        self.optimizer.reset();
        self.neighbors.clear();
        self.public_indices.clear();
        self.shared_loop_closures.clear();
        self.local_iteration = 0;
        self.handled_round = 0;
        self.last_objective = None;
        self.optimizing_since = None;
        self.leader = LeaderState::default();
        self.reset_round();
    }

    fn reset_round(&mut self) {
        self.round.iteration = 0;
        self.round.scheduler.reset();
        self.round.active_robots = if self.is_leader() {
            self.monitor.connected_robots()
        } else {
            initial_active_set(self.id, self.config.optimizer.num_robots)
        };
    }
}

fn initial_active_set(id: RobotId, num_robots: usize) -> BTreeSet<RobotId> {
    if id.is_leader() {
        std::iter::once(id).collect()
    } else {
        (0..num_robots as u32).map(RobotId).collect()
    }
}

fn log_path(dir: &Path, id: RobotId) -> std::path::PathBuf {
    dir.join(format!("robot_{id}.jsonl"))
}
