//! Binary frame format.
//!
//! Frame layout (5 bytes header + payload):
//!
//! ```text
//! +-------------+----------+---------------------+
//! | payload_len | msg_type | payload             |
//! | 4 bytes LE  | 1 byte   | payload_len bytes   |
//! +-------------+----------+---------------------+
//! ```
//!
//! A physical payload whose length equals the negotiated maximum block size
//! is a continuation: the logical message goes on in the next frame, until a
//! frame shorter than the block size (possibly empty) ends it.

use crate::error::ProtocolError;
use crate::MAX_MESSAGE_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header in bytes (4 + 1).
pub const FRAME_HEADER_SIZE: usize = 5;

/// A logical frame: one message type tag and its (reassembled) payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type tag.
    pub msg_type: u8,
    /// Frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(msg_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Creates a frame with a JSON-serialized payload.
    pub fn from_json<T: serde::Serialize>(msg_type: u8, value: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(msg_type, payload))
    }

    /// Encodes the frame as a single physical frame.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Appends the frame as a single physical frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: self.payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        put_physical(buf, self.msg_type, &self.payload);
        Ok(())
    }

    /// Encodes the frame split into physical frames of `max_block_size`.
    ///
    /// A payload that is an exact multiple of the block size is followed by
    /// an empty terminating frame.
    pub fn encode_chunked(&self, max_block_size: usize) -> BytesMut {
        let block = max_block_size.max(1);
        let chunks = self.payload.len() / block + 1;
        let mut buf = BytesMut::with_capacity(self.payload.len() + chunks * FRAME_HEADER_SIZE);

        let mut rest = &self.payload[..];
        loop {
            let take = rest.len().min(block);
            put_physical(&mut buf, self.msg_type, &rest[..take]);
            rest = &rest[take..];
            if take < block {
                break;
            }
        }
        buf
    }

    /// Decodes one physical frame from `buf`.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded, `Ok(None)`
    /// if more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let payload_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if payload_len > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_MESSAGE_SIZE,
            });
        }

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        let msg_type = buf[4];
        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self { msg_type, payload }))
    }
}

fn put_physical(buf: &mut BytesMut, msg_type: u8, payload: &[u8]) {
    buf.put_u32_le(payload.len() as u32);
    buf.put_u8(msg_type);
    buf.put_slice(payload);
}

/// Reassembles chunked messages from a byte buffer.
#[derive(Debug)]
pub struct FrameAssembler {
    max_block_size: usize,
    partial: Option<(u8, BytesMut)>,
}

impl FrameAssembler {
    pub fn new(max_block_size: usize) -> Self {
        Self {
            max_block_size: max_block_size.max(1),
            partial: None,
        }
    }

    /// Returns the negotiated maximum block size.
    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    /// Updates the maximum block size (after capability negotiation).
    pub fn set_max_block_size(&mut self, size: usize) {
        self.max_block_size = size.max(1);
    }

    /// Returns whether a chunked message has been started but not finished.
    pub fn is_mid_message(&self) -> bool {
        self.partial.is_some()
    }

    /// Drops any partially assembled message.
    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Attempts to decode the next logical frame from `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        while let Some(physical) = Frame::decode(buf)? {
            let is_continued = physical.payload.len() == self.max_block_size;

            let frame = match self.partial.take() {
                None if !is_continued => return Ok(Some(physical)),
                None => {
                    self.partial = Some((physical.msg_type, BytesMut::from(&physical.payload[..])));
                    continue;
                }
                Some((msg_type, mut assembled)) => {
                    if physical.msg_type != msg_type {
                        return Err(ProtocolError::ContinuationMismatch {
                            expected: msg_type,
                            actual: physical.msg_type,
                        });
                    }
                    if assembled.len() + physical.payload.len() > MAX_MESSAGE_SIZE {
                        return Err(ProtocolError::FrameTooLarge {
                            size: assembled.len() + physical.payload.len(),
                            max: MAX_MESSAGE_SIZE,
                        });
                    }
                    assembled.extend_from_slice(&physical.payload);
                    if is_continued {
                        self.partial = Some((msg_type, assembled));
                        continue;
                    }
                    Frame::new(msg_type, assembled.freeze())
                }
            };
            return Ok(Some(frame));
        }
        Ok(None)
    }
}
