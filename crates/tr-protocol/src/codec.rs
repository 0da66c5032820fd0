//! Tokio codec for framed protocol messages

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::message::Message;
use crate::stream::StreamId;

/// A complete frame with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Call this frame belongs to
    pub stream_id: StreamId,
    /// The message payload
    pub message: Message,
}

impl Frame {
    /// Create a new frame
    pub fn new(stream_id: StreamId, message: Message) -> Self {
        Self { stream_id, message }
    }
}

/// Codec for encoding/decoding protocol frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Header whose payload has not fully arrived yet
    pending_header: Option<FrameHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_header: None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending_header {
            Some(header) => header,
            None => match FrameHeader::decode(src)? {
                Some(header) => header,
                None => return Ok(None),
            },
        };

        let needed = header.payload_length as usize;
        if src.len() < needed {
            tracing::trace!(
                stream = %header.stream_id,
                have = src.len(),
                need = needed,
                "Waiting for frame payload"
            );
            src.reserve(needed - src.len());
            self.pending_header = Some(header);
            return Ok(None);
        }
        self.pending_header = None;

        let payload = src.split_to(needed);
        let message: Message = bincode::deserialize(&payload)?;

        if message.message_type() != header.message_type {
            return Err(ProtocolError::TypeMismatch {
                header: header.message_type,
                payload: message.message_type(),
            });
        }

        Ok(Some(Frame::new(header.stream_id, message)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    /// Serializes straight into `dst` behind a placeholder header, which is
    /// filled in once the payload length is known.
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let start = dst.len();
        dst.put_bytes(0, HEADER_SIZE);

        if let Err(e) = bincode::serialize_into((&mut *dst).writer(), &frame.message) {
            dst.truncate(start);
            return Err(e.into());
        }

        let payload_len = dst.len() - start - HEADER_SIZE;
        if payload_len > MAX_PAYLOAD_SIZE {
            dst.truncate(start);
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let header = FrameHeader::new(
            frame.stream_id,
            frame.message.message_type(),
            payload_len as u32,
        );
        dst[start..start + HEADER_SIZE].copy_from_slice(&header.to_bytes());
        Ok(())
    }
}
