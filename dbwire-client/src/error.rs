//! Client error types.

use crate::session::SessionState;
use dbwire_protocol::{ErrorCode, ProtocolError, ServerError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to {address}: {message}")]
    Connect { address: String, message: String },

    #[error("server does not support TLS")]
    TlsUnsupported,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("stream closed mid-frame ({buffered} bytes of an unfinished frame)")]
    TruncatedStream { buffered: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("decode error: {message}")]
    Decode {
        message: String,
        /// The frame stream can no longer be trusted; the session was closed.
        session_fatal: bool,
    },

    #[error("result stream is poisoned by an earlier decode error")]
    StreamPoisoned,

    #[error("transient server error {}: {}", .0.code, .0.message)]
    TransientServer(ServerError),

    #[error("server error {}: {}", .0.code, .0.message)]
    FatalServer(ServerError),

    #[error("request timeout")]
    Timeout,

    #[error("invalid session state: {action} requires {expected:?}, session is {actual:?}")]
    InvalidState {
        action: &'static str,
        expected: SessionState,
        actual: SessionState,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A message was refused before any byte of it reached the wire.
    #[error("cannot send message: {0}")]
    Encode(ProtocolError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Classifies a server-reported error by its code.
    pub fn from_server(err: ServerError) -> Self {
        if err.code.is_transient() {
            ClientError::TransientServer(err)
        } else {
            ClientError::FatalServer(err)
        }
    }

    /// Returns the server error code, if the server reported this error.
    pub fn server_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::TransientServer(err) | ClientError::FatalServer(err) => Some(err.code),
            _ => None,
        }
    }

    /// Returns whether the backoff policy may retry this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::TransientServer(_))
    }

    /// Returns whether no usable transport could be established or kept.
    ///
    /// These are the errors the failover manager handles by trying another
    /// endpoint.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ClientError::Connect { .. }
            | ClientError::TruncatedStream { .. }
            | ClientError::ConnectionClosed
            | ClientError::Timeout
            | ClientError::Io(_)
            | ClientError::TlsHandshake(_) => true,
            ClientError::Protocol(ProtocolError::Io(_)) => true,
            ClientError::FatalServer(err) => err.code == ErrorCode::UNABLE_TO_CONNECT,
            _ => false,
        }
    }

    /// Returns whether the session that raised this error must be closed.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            ClientError::TruncatedStream { .. }
            | ClientError::ConnectionClosed
            | ClientError::Timeout
            | ClientError::Io(_) => true,
            ClientError::Decode { session_fatal, .. } => *session_fatal,
            ClientError::Protocol(err) => err.breaks_framing(),
            ClientError::TransientServer(err) | ClientError::FatalServer(err) => err.fatal,
            _ => false,
        }
    }
}
