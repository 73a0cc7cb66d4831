//! # dbwire-protocol
//!
//! Wire protocol implementation for dbwire.
//!
//! This crate provides:
//! - Length-prefixed framing with reassembly of chunked messages
//! - Client and server message types keyed by a one-byte type tag
//! - Statement model shared by table and document CRUD
//! - Row value codec with per-column type checking
//! - Server error codes and protocol errors

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod statement;
pub mod value;

pub use codec::{Decoder, Encoder};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Frame, FrameAssembler, FRAME_HEADER_SIZE};
pub use message::{
    AuthContinue, AuthStart, Capabilities, ClientMessage, ClientMessageType, ColumnMeta, ExecuteOk,
    Notice, NoticeKind, ServerError, ServerMessage, ServerMessageType,
};
pub use statement::{
    Bindings, Collection, DataModel, Limit, Order, Statement, StatementKind, UpdateOperation,
};
pub use value::{ColumnType, Value};

/// Default port for a dbwire server.
pub const DEFAULT_PORT: u16 = 33060;

/// Default maximum physical frame payload (16 MiB - 1).
///
/// A payload of exactly this length marks a continuation frame.
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 0x00FF_FFFF;

/// Maximum size of a reassembled message (64 MiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
