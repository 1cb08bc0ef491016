//! Core framing types for the coordination bus

use bytes::Bytes;
use dpgo_core::RobotId;
use serde::{Deserialize, Serialize};

/// Per-sender sequence number
pub type SeqNo = u64;

/// Named channel a frame is published on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Leader commands (update, initialize, terminate, ...)
    Command,
    /// Status heartbeats
    Status,
    /// Public pose values
    PublicPoses,
    /// Shared loop closures exchanged during initialization
    PublicMeasurements,
    /// Robust weights of shared loop closures
    MeasurementWeights,
    /// Global anchor published by the leader
    Anchor,
    /// Reachability reports
    Connectivity,
    /// Service-style requests
    Request,
    /// Replies to requests
    Response,
}

impl Channel {
    /// All channels, in a fixed order
    pub const ALL: [Channel; 9] = [
        Channel::Command,
        Channel::Status,
        Channel::PublicPoses,
        Channel::PublicMeasurements,
        Channel::MeasurementWeights,
        Channel::Anchor,
        Channel::Connectivity,
        Channel::Request,
        Channel::Response,
    ];

    /// Topic-style name of the channel
    pub const fn name(self) -> &'static str {
        match self {
            Channel::Command => "/dpgo/command",
            Channel::Status => "/dpgo/status",
            Channel::PublicPoses => "/dpgo/public_poses",
            Channel::PublicMeasurements => "/dpgo/public_measurements",
            Channel::MeasurementWeights => "/dpgo/measurement_weights",
            Channel::Anchor => "/dpgo/anchor",
            Channel::Connectivity => "/dpgo/connectivity",
            Channel::Request => "/dpgo/request",
            Channel::Response => "/dpgo/response",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Frame header containing routing information
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Channel this frame was published on
    pub channel: Channel,
    /// Publishing robot
    pub from: RobotId,
    /// Addressee, `None` for a broadcast
    pub to: Option<RobotId>,
    /// Sequence number assigned by the sender's endpoint
    pub seq: SeqNo,
}

/// Complete frame with header and encoded body
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    /// Frame header
    pub hdr: FrameHeader,
    /// Encoded message
    pub body: Bytes,
}

impl Frame {
    /// Create a broadcast frame
    pub fn broadcast(channel: Channel, from: RobotId, body: Bytes) -> Self {
        Self {
            hdr: FrameHeader {
                channel,
                from,
                to: None,
                seq: 0,
            },
            body,
        }
    }

    /// Create a frame addressed to a single robot
    pub fn addressed(channel: Channel, from: RobotId, to: RobotId, body: Bytes) -> Self {
        Self {
            hdr: FrameHeader {
                channel,
                from,
                to: Some(to),
                seq: 0,
            },
            body,
        }
    }

    pub fn channel(&self) -> Channel {
        self.hdr.channel
    }

    pub fn from(&self) -> RobotId {
        self.hdr.from
    }

    /// Size of the encoded body in bytes
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Check whether `robot` should see this frame
    pub fn is_for(&self, robot: RobotId) -> bool {
        self.hdr.from != robot && self.hdr.to.map_or(true, |to| to == robot)
    }
}
