//! Wire messages exchanged between coordinators.
//!
//! Every message travels inside an [`Envelope`] that names the sender and the
//! run instance it belongs to. Envelopes are JSON encoded into the body of a
//! [`Frame`]; the channel is derived from the message variant.

use std::collections::BTreeSet;

use bytes::Bytes;
use dpgo_core::{Matrix, Measurement, MeasurementWeight, PublicPose, RobotId};
use dpgo_transfer::{Channel, Frame};
use serde::{Deserialize, Serialize};

use crate::coordinator::Mode;
use crate::error::Result;

/// Identifier of a request, unique per requesting robot.
pub type RequestId = u64;

/// Command issued by the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Start a run: every robot loads its local pose graph.
    RequestPoseGraph,
    /// Local initialization is done everywhere; start optimizing.
    Initialize,
    /// `robot` performs one local update as part of global `round`.
    Update { robot: RobotId, round: u64 },
    /// `robot` recomputes the robust weights it is responsible for.
    UpdateWeight { robot: RobotId },
    /// Graceful end of the run.
    Terminate,
    /// Stop and drop run state.
    HardTerminate,
    /// The leader's current view of who takes part.
    ActiveRobots { robots: BTreeSet<RobotId> },
    /// Keep-alive, no effect.
    Noop,
}

impl Command {
    /// Short name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::RequestPoseGraph => "REQUEST_POSE_GRAPH",
            Self::Initialize => "INITIALIZE",
            Self::Update { .. } => "UPDATE",
            Self::UpdateWeight { .. } => "UPDATE_WEIGHT",
            Self::Terminate => "TERMINATE",
            Self::HardTerminate => "HARD_TERMINATE",
            Self::ActiveRobots { .. } => "ACTIVE_ROBOTS",
            Self::Noop => "NOOP",
        }
    }

    /// The single robot that must act on this command, if any.
    pub fn executor(&self) -> Option<RobotId> {
        match self {
            Self::Update { robot, .. } | Self::UpdateWeight { robot } => Some(*robot),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Periodic heartbeat describing one robot's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub robot: RobotId,
    pub mode: Mode,
    /// Number of successful local updates in this run.
    pub iteration: u64,
    /// Last global round whose UPDATE this robot has handled.
    pub round: u64,
    /// Whether the robot believes it is in the active set.
    pub connected: bool,
    pub objective: Option<f64>,
    /// Local initialization finished.
    pub initialized: bool,
    pub ready_to_terminate: bool,
    /// Shared loop closures from every active neighbor have arrived.
    pub received_shared_loop_closures: bool,
}

/// Latest values of a robot's public poses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicPoses {
    pub robot: RobotId,
    /// Sender's iteration when the values were produced.
    pub iteration: u64,
    pub poses: Vec<PublicPose>,
}

/// A robot's shared loop closures, sent during initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicMeasurements {
    pub robot: RobotId,
    pub measurements: Vec<Measurement>,
}

/// Robust weights computed by the responsible robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementWeights {
    pub robot: RobotId,
    pub weights: Vec<MeasurementWeight>,
}

/// The leader's first pose, fixing the global frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub pose: PublicPose,
}

/// Which robots a follower currently hears from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityReport {
    pub robot: RobotId,
    pub reachable: BTreeSet<RobotId>,
}

/// Service-style query to one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Ask the leader for the lifting matrix.
    LiftingMatrix,
    /// Ask a peer for the current values of some of its poses.
    Poses { indices: Vec<u32> },
}

/// Answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    LiftingMatrix(Matrix),
    /// One pose per requested index, in request order.
    Poses(Vec<PublicPose>),
    /// The peer cannot serve the request.
    Refused { reason: String },
}

/// Everything that can travel on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Command(Command),
    Status(Status),
    PublicPoses(PublicPoses),
    PublicMeasurements(PublicMeasurements),
    MeasurementWeights(MeasurementWeights),
    Anchor(Anchor),
    Connectivity(ConnectivityReport),
    Request {
        id: RequestId,
        to: RobotId,
        request: Request,
    },
    Response {
        id: RequestId,
        to: RobotId,
        response: Response,
    },
}

impl Message {
    /// Channel this message is published on.
    pub fn channel(&self) -> Channel {
        match self {
            Self::Command(_) => Channel::Command,
            Self::Status(_) => Channel::Status,
            Self::PublicPoses(_) => Channel::PublicPoses,
            Self::PublicMeasurements(_) => Channel::PublicMeasurements,
            Self::MeasurementWeights(_) => Channel::MeasurementWeights,
            Self::Anchor(_) => Channel::Anchor,
            Self::Connectivity(_) => Channel::Connectivity,
            Self::Request { .. } => Channel::Request,
            Self::Response { .. } => Channel::Response,
        }
    }

    /// Single addressee for request/response traffic.
    pub fn addressee(&self) -> Option<RobotId> {
        match self {
            Self::Request { to, .. } | Self::Response { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// A message stamped with its sender and run instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: RobotId,
    /// Run instance started by the leader; older instances are stale.
    pub instance: u64,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: RobotId, instance: u64, message: Message) -> Self {
        Self {
            from,
            instance,
            message,
        }
    }

    /// Encode into a frame on the message's channel.
    pub fn to_frame(&self) -> Result<Frame> {
        let body = Bytes::from(serde_json::to_vec(self)?);
        let channel = self.message.channel();
        Ok(match self.message.addressee() {
            Some(to) => Frame::addressed(channel, self.from, to, body),
            None => Frame::broadcast(channel, self.from, body),
        })
    }

    /// Decode a received frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Ok(serde_json::from_slice(&frame.body)?)
    }
}
