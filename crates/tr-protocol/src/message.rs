//! Message types for the agent protocol
//!
//! Every call made by the capturing agent travels as one or more frames
//! sharing a [`StreamId`](crate::StreamId).
//!
//! # Message Flow
//!
//! 1. Unary reports (`FlowsObserved`, `AgentStarted`, `ContainersObserved`)
//!    are answered with `Reply { status: "success" }` or `Error`.
//! 2. The agent opens its command stream with `OpenCommandStream` followed by
//!    a single `NoOp` handshake on the same stream id.
//! 3. The server pushes `Command` messages on that stream for as long as the
//!    connection lives, and ends it with `StreamEnd` on shutdown.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Status string carried by successful replies.
pub const REPLY_SUCCESS: &str = "success";

/// One observed half of a request/response exchange.
///
/// Either `request` or `response` is normally empty; the agent reports each
/// half as soon as it sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowFragment {
    /// Correlation key shared by both halves of one exchange
    pub uuid: String,
    pub local_addr: String,
    pub remote_addr: String,
    /// Transport protocol tag, e.g. "tcp"
    pub l4_protocol: String,
    /// Application protocol tag, e.g. "http"
    pub l7_protocol: String,
    /// Raw request bytes (empty if this fragment carries a response)
    pub request: Bytes,
    /// Raw response bytes (empty if this fragment carries a request)
    pub response: Bytes,
}

impl FlowFragment {
    /// Build a request fragment
    pub fn request(uuid: impl Into<String>, request: impl Into<Bytes>) -> Self {
        Self {
            uuid: uuid.into(),
            request: request.into(),
            ..Self::default()
        }
    }

    /// Build a response fragment
    pub fn response(uuid: impl Into<String>, response: impl Into<Bytes>) -> Self {
        Self {
            uuid: uuid.into(),
            response: response.into(),
            ..Self::default()
        }
    }

    /// Set the endpoint and protocol metadata
    pub fn with_endpoints(
        mut self,
        local_addr: impl Into<String>,
        remote_addr: impl Into<String>,
        l4_protocol: impl Into<String>,
        l7_protocol: impl Into<String>,
    ) -> Self {
        self.local_addr = local_addr.into();
        self.remote_addr = remote_addr.into();
        self.l4_protocol = l4_protocol.into();
        self.l7_protocol = l7_protocol.into();
        self
    }

    pub fn has_request(&self) -> bool {
        !self.request.is_empty()
    }

    pub fn has_response(&self) -> bool {
        !self.response.is_empty()
    }
}

/// A container seen by the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub status: String,
    pub image: String,
    pub ip: String,
}

/// Agent settings pushed over the command stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Containers the agent should intercept traffic for
    pub container_ids: Vec<String>,
}

impl Settings {
    pub fn new(container_ids: Vec<String>) -> Self {
        Self { container_ids }
    }

    /// Whether the given container is on the allow-list
    pub fn intercepts(&self, container_id: &str) -> bool {
        self.container_ids.iter().any(|id| id == container_id)
    }
}

/// Commands sent from the server to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Replace the agent's intercept settings
    SetSettings(Settings),
}

impl Command {
    /// The command type tag understood by the agent
    pub fn type_name(&self) -> &'static str {
        match self {
            Command::SetSettings(_) => "set_settings",
        }
    }
}

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Batch of flow fragments
    FlowsObserved = 0x01,
    /// Agent start notification
    AgentStarted = 0x02,
    /// Batch of observed containers
    ContainersObserved = 0x03,
    /// Request to open the command stream
    OpenCommandStream = 0x04,
    /// Handshake on the command stream
    NoOp = 0x05,
    /// Unary acknowledgement
    Reply = 0x06,
    /// Server command
    Command = 0x07,
    /// Stream closed
    StreamEnd = 0x08,
    /// Error response
    Error = 0xFF,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::FlowsObserved),
            0x02 => Some(Self::AgentStarted),
            0x03 => Some(Self::ContainersObserved),
            0x04 => Some(Self::OpenCommandStream),
            0x05 => Some(Self::NoOp),
            0x06 => Some(Self::Reply),
            0x07 => Some(Self::Command),
            0x08 => Some(Self::StreamEnd),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Error codes for error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// The peer broke the call sequence (e.g. no handshake)
    ProtocolViolation = 1,
    /// The message is not valid for this stream
    InvalidMessage = 2,
    /// The server is shutting down
    Unavailable = 3,
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    FlowsObserved { flows: Vec<FlowFragment> },

    AgentStarted,

    ContainersObserved { containers: Vec<ContainerRecord> },

    OpenCommandStream,

    NoOp,

    Reply { status: String },

    Command(Command),

    StreamEnd,

    Error {
        /// Error code
        code: ErrorCode,
        /// Human-readable message
        message: String,
    },
}

impl Message {
    /// Successful unary reply
    pub fn success() -> Self {
        Message::Reply {
            status: REPLY_SUCCESS.to_string(),
        }
    }

    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::FlowsObserved { .. } => MessageType::FlowsObserved,
            Message::AgentStarted => MessageType::AgentStarted,
            Message::ContainersObserved { .. } => MessageType::ContainersObserved,
            Message::OpenCommandStream => MessageType::OpenCommandStream,
            Message::NoOp => MessageType::NoOp,
            Message::Reply { .. } => MessageType::Reply,
            Message::Command(_) => MessageType::Command,
            Message::StreamEnd => MessageType::StreamEnd,
            Message::Error { .. } => MessageType::Error,
        }
    }
}
