//! Frame header
//!
//! ```text
//! 0       4    5          8
//! +-------+----+----------+----------------
//! | call  |type| length   | bincode payload
//! | u32 BE| u8 | u24 BE   |
//! +-------+----+----------+----------------
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ProtocolError;
use crate::message::MessageType;
use crate::stream::StreamId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Largest payload the 24-bit length field can describe
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

const TYPE_OFFSET: usize = 4;

/// Routing and length information preceding every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream_id: StreamId,
    pub message_type: MessageType,
    /// Payload length in bytes; only the low 24 bits go on the wire
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn new(stream_id: StreamId, message_type: MessageType, payload_length: u32) -> Self {
        Self {
            stream_id,
            message_type,
            payload_length,
        }
    }

    /// Wire representation of this header
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let id = self.stream_id.as_u32().to_be_bytes();
        let len = self.payload_length.to_be_bytes();
        [
            id[0],
            id[1],
            id[2],
            id[3],
            self.message_type.as_u8(),
            len[1],
            len[2],
            len[3],
        ]
    }

    /// Parse a header from its wire representation
    pub fn from_bytes(raw: &[u8; HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let type_byte = raw[TYPE_OFFSET];
        let message_type =
            MessageType::from_u8(type_byte).ok_or(ProtocolError::UnknownMessageType(type_byte))?;

        Ok(Self {
            stream_id: StreamId::new(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
            message_type,
            payload_length: u32::from_be_bytes([0, raw[5], raw[6], raw[7]]),
        })
    }

    /// Append the header to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.to_bytes());
    }

    /// Take a header off the front of `src`.
    ///
    /// Returns `Ok(None)` while fewer than [`HEADER_SIZE`] bytes are
    /// buffered. Nothing is consumed unless a valid header is returned.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        let Some(raw) = src.get(..HEADER_SIZE) else {
            return Ok(None);
        };
        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(raw);

        let header = Self::from_bytes(&bytes)?;
        src.advance(HEADER_SIZE);
        Ok(Some(header))
    }
}
