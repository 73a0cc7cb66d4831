//! Protocol error types and server error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("continuation frame type {actual:#04x} does not match message type {expected:#04x}")]
    ContinuationMismatch { expected: u8, actual: u8 },

    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("cannot decode column {column} as {column_type}: {reason}")]
    ValueDecode {
        column: usize,
        column_type: String,
        reason: String,
    },

    #[error("malformed row: {0}")]
    MalformedRow(String),

    #[error("statement mixes positional and named bindings")]
    MixedBindings,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("invalid hex in payload: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl ProtocolError {
    /// Returns whether the error leaves the frame stream at an unknown position.
    ///
    /// Value-level decode failures happen after a whole frame was consumed,
    /// so the stream can continue; everything else cannot be trusted.
    pub fn breaks_framing(&self) -> bool {
        !matches!(
            self,
            ProtocolError::ValueDecode { .. } | ProtocolError::MixedBindings
        )
    }
}

/// Numeric error code carried by server error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    /// Too many connections.
    pub const TOO_MANY_CONNECTIONS: ErrorCode = ErrorCode(1040);
    /// Unable to connect to any of the specified hosts.
    pub const UNABLE_TO_CONNECT: ErrorCode = ErrorCode(1042);
    /// Access denied for user.
    pub const ACCESS_DENIED: ErrorCode = ErrorCode(1045);
    /// Lock wait timeout exceeded.
    pub const LOCK_WAIT_TIMEOUT: ErrorCode = ErrorCode(1205);
    /// Deadlock found when trying to get lock.
    pub const DEADLOCK: ErrorCode = ErrorCode(1213);
    /// Transaction branch was rolled back: deadlock was detected.
    pub const XA_DEADLOCK: ErrorCode = ErrorCode(1614);
    /// Server has gone away.
    pub const SERVER_GONE_AWAY: ErrorCode = ErrorCode(2006);
    /// Lost connection to server during query.
    pub const LOST_CONNECTION: ErrorCode = ErrorCode(2013);

    /// Codes a client may retry after a delay.
    pub const TRANSIENT: [ErrorCode; 6] = [
        ErrorCode::TOO_MANY_CONNECTIONS,
        ErrorCode::LOCK_WAIT_TIMEOUT,
        ErrorCode::DEADLOCK,
        ErrorCode::XA_DEADLOCK,
        ErrorCode::SERVER_GONE_AWAY,
        ErrorCode::LOST_CONNECTION,
    ];

    /// Returns whether this error is on the transient allow-list.
    pub fn is_transient(&self) -> bool {
        Self::TRANSIENT.contains(self)
    }

    /// Returns a short name for well-known codes.
    pub fn name(&self) -> Option<&'static str> {
        match self.0 {
            1040 => Some("TOO_MANY_CONNECTIONS"),
            1042 => Some("UNABLE_TO_CONNECT"),
            1045 => Some("ACCESS_DENIED"),
            1205 => Some("LOCK_WAIT_TIMEOUT"),
            1213 => Some("DEADLOCK"),
            1614 => Some("XA_DEADLOCK"),
            2006 => Some("SERVER_GONE_AWAY"),
            2013 => Some("LOST_CONNECTION"),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(code: u16) -> Self {
        ErrorCode(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_transient() {
        assert!(ErrorCode::TOO_MANY_CONNECTIONS.is_transient());
        assert!(ErrorCode::LOCK_WAIT_TIMEOUT.is_transient());
        assert!(ErrorCode::DEADLOCK.is_transient());
        assert!(ErrorCode::XA_DEADLOCK.is_transient());
        assert!(ErrorCode::SERVER_GONE_AWAY.is_transient());
        assert!(ErrorCode::LOST_CONNECTION.is_transient());

        assert!(!ErrorCode::ACCESS_DENIED.is_transient());
        assert!(!ErrorCode::UNABLE_TO_CONNECT.is_transient());
        assert!(!ErrorCode(1064).is_transient());
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::DEADLOCK.to_string(), "1213 (DEADLOCK)");
        assert_eq!(ErrorCode(1064).to_string(), "1064");
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::DEADLOCK).unwrap();
        assert_eq!(json, "1213");

        let parsed: ErrorCode = serde_json::from_str("2013").unwrap();
        assert_eq!(parsed, ErrorCode::LOST_CONNECTION);
    }

    #[test]
    fn test_breaks_framing() {
        let value = ProtocolError::ValueDecode {
            column: 0,
            column_type: "sint".into(),
            reason: "bad length".into(),
        };
        assert!(!value.breaks_framing());
        assert!(ProtocolError::MalformedRow("overrun".into()).breaks_framing());
        assert!(ProtocolError::UnknownMessageType(0x7f).breaks_framing());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::ContinuationMismatch {
            expected: 0x0d,
            actual: 0x0e,
        };
        assert!(err.to_string().contains("0x0e"));

        let err = ProtocolError::UnknownMessageType(0xff);
        assert!(err.to_string().contains("0xff"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));
    }
}
