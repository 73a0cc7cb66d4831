//! # dbwire-client
//!
//! Client library for dbwire.
//!
//! This crate provides:
//! - Frame transport over TCP with in-place TLS upgrade
//! - Session state machine with pluggable authentication
//! - Lazy, forward-only result streams
//! - Statement and exception interceptor chains
//! - Per-error backoff policy and retry loop

pub mod auth;
pub mod backoff;
pub mod config;
pub mod error;
pub mod interceptor;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod result;
pub mod session;
pub mod tls;
pub mod transport;

pub use auth::{AuthMechanism, AuthPlugin};
pub use backoff::{Backoff, BackoffAlgorithm, BackoffPolicy, BackoffStrategy, RetryStats};
pub use config::{ConnectionConfig, TlsClientConfig, TlsMode};
pub use error::ClientError;
pub use interceptor::{
    CommandChain, CommandInterceptor, ErrorTransformer, ExceptionChain, ExceptionInterceptor,
    InterceptorRegistry, ResultSet, StatementInterceptor,
};
pub use result::{ResultStream, Row};
pub use session::{Session, SessionBuilder, SessionState};
pub use transport::Transport;

pub use dbwire_protocol::{Collection, DataModel, Statement, Value};
