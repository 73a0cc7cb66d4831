//! Replication endpoints.

use crate::error::ReplicationError;
use dbwire_client::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Role of an endpoint within its group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    /// Accepts writes.
    Master,
    /// Serves reads only.
    #[default]
    Replica,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRole::Master => f.write_str("master"),
            EndpointRole::Replica => f.write_str("replica"),
        }
    }
}

/// One server of a replication group.
///
/// Availability is shared between request paths and the background probe,
/// so it lives in atomics rather than behind the group.
pub struct Endpoint {
    name: String,
    role: EndpointRole,
    priority: i32,
    config: ConnectionConfig,
    available: AtomicBool,
    probe_running: AtomicBool,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, role: EndpointRole, config: ConnectionConfig) -> Self {
        Self {
            name: name.into(),
            role,
            priority: 0,
            config,
            available: AtomicBool::new(true),
            probe_running: AtomicBool::new(false),
        }
    }

    /// Creates an endpoint from a connection descriptor.
    pub fn parse(
        name: impl Into<String>,
        role: EndpointRole,
        descriptor: &str,
    ) -> Result<Self, ReplicationError> {
        let config = ConnectionConfig::from_descriptor(descriptor)?;
        Ok(Self::new(name, role, config))
    }

    /// Sets the priority used by sequential selection. Higher goes first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> EndpointRole {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == EndpointRole::Master
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn is_probe_running(&self) -> bool {
        self.probe_running.load(Ordering::Acquire)
    }

    /// Claims the probe slot. Returns false if a probe is already running.
    pub(crate) fn begin_probe(&self) -> bool {
        self.probe_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_probe(&self) {
        self.probe_running.store(false, Ordering::Release);
    }

    /// Whether this endpoint can serve a request of the given kind.
    pub(crate) fn serves(&self, require_master: bool) -> bool {
        !require_master || self.is_master()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("priority", &self.priority)
            .field("address", &self.config.address())
            .field("available", &self.is_available())
            .finish()
    }
}
