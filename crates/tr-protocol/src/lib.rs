//! tr-protocol: Wire protocol for the Trayce agent channel
//!
//! This crate defines the binary protocol spoken between a capturing agent
//! and the desktop server: unary report calls (flows, containers, agent
//! start) and the long-lived command stream used to push settings.

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod stream;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{
    Command, ContainerRecord, ErrorCode, FlowFragment, Message, MessageType, Settings,
    REPLY_SUCCESS,
};
pub use stream::StreamId;
