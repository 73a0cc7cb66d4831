//! Replication error types.

use crate::config::ConfigError;
use dbwire_client::ClientError;
use thiserror::Error;

/// Replication errors.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("replication group not found: {0}")]
    GroupNotFound(String),

    #[error("no available endpoint in group '{group}'{}", describe(.last_error))]
    NoAvailableEndpoint {
        group: String,
        /// Error from the last endpoint that was tried, if any was.
        last_error: Option<Box<ClientError>>,
    },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn describe(last_error: &Option<Box<ClientError>>) -> String {
    match last_error {
        Some(err) => format!(" (last error: {})", err),
        None => String::new(),
    }
}
