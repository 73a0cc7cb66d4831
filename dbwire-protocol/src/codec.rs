//! Encoder and decoder for dbwire frames and messages.

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameAssembler};
use crate::message::{ClientMessage, ServerMessage};
use crate::DEFAULT_MAX_BLOCK_SIZE;
use bytes::{Bytes, BytesMut};

/// Encodes client and server messages into wire bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a client message as a single physical frame.
    pub fn encode_client(msg: &ClientMessage) -> Result<BytesMut, ProtocolError> {
        msg.to_frame()?.encode()
    }

    /// Encodes a server message, chunking it at `max_block_size`.
    pub fn encode_server(
        msg: &ServerMessage,
        max_block_size: usize,
    ) -> Result<BytesMut, ProtocolError> {
        Ok(msg.to_frame()?.encode_chunked(max_block_size))
    }
}

/// Buffers incoming bytes and decodes logical frames and messages.
pub struct Decoder {
    buffer: BytesMut,
    assembler: FrameAssembler,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_block_size(DEFAULT_MAX_BLOCK_SIZE)
    }

    pub fn with_max_block_size(max_block_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            assembler: FrameAssembler::new(max_block_size),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Updates the maximum block size used for reassembly.
    pub fn set_max_block_size(&mut self, size: usize) {
        self.assembler.set_max_block_size(size);
    }

    pub fn max_block_size(&self) -> usize {
        self.assembler.max_block_size()
    }

    /// Attempts to decode the next logical frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        self.assembler.decode(&mut self.buffer)
    }

    /// Attempts to decode the next server message from the buffer.
    pub fn decode_server(&mut self) -> Result<Option<ServerMessage>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some(ServerMessage::from_frame(frame)?)),
            None => Ok(None),
        }
    }

    /// Attempts to decode the next client message from the buffer.
    pub fn decode_client(&mut self) -> Result<Option<ClientMessage>, ProtocolError> {
        match self.decode_frame()? {
            Some(frame) => Ok(Some(ClientMessage::from_frame(&frame)?)),
            None => Ok(None),
        }
    }

    /// Returns whether bytes of an unfinished frame are pending.
    pub fn is_mid_frame(&self) -> bool {
        !self.buffer.is_empty() || self.assembler.is_mid_message()
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears buffered bytes and any partially assembled message.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.assembler.reset();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
