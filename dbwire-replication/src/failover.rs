//! Failover manager.
//!
//! Hands out sessions for a replication group. When an endpoint cannot be
//! reached it is marked unavailable, a probe is started for it and the next
//! candidate is tried. The probe restores the endpoint once it accepts TCP
//! connections again.

use crate::config::{ConfigError, ReplicationConfig};
use crate::endpoint::Endpoint;
use crate::error::ReplicationError;
use crate::group::{Group, SelectorRegistry};
use dbwire_client::{ClientError, InterceptorRegistry, Session, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Selects endpoints and opens sessions with failover.
pub struct FailoverManager {
    groups: Vec<Arc<Group>>,
    interceptors: Option<Arc<InterceptorRegistry>>,
    probes: Mutex<Vec<JoinHandle<()>>>,
}

impl FailoverManager {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            interceptors: None,
            probes: Mutex::new(Vec::new()),
        }
    }

    /// Builds a manager from a replication configuration.
    pub fn from_config(
        config: &ReplicationConfig,
        selectors: &SelectorRegistry,
    ) -> Result<Self, ReplicationError> {
        let mut manager = Self::new();
        for group in config.build_groups(selectors)? {
            manager.add_group(group)?;
        }
        Ok(manager)
    }

    /// Resolves interceptor names of new sessions against `registry`.
    pub fn with_interceptors(mut self, registry: Arc<InterceptorRegistry>) -> Self {
        self.interceptors = Some(registry);
        self
    }

    /// Adds a group. Group names are unique, ignoring case.
    pub fn add_group(&mut self, group: Group) -> Result<(), ReplicationError> {
        if self.find(group.name()).is_some() {
            return Err(ConfigError::ValidationError(format!(
                "duplicate group '{}'",
                group.name()
            ))
            .into());
        }
        tracing::debug!(
            group = %group.name(),
            endpoints = group.endpoints().len(),
            strategy = %group.strategy().name(),
            "Replication group registered"
        );
        self.groups.push(Arc::new(group));
        Ok(())
    }

    pub fn is_group(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Looks up a group by name, ignoring case.
    pub fn group(&self, name: &str) -> Result<&Arc<Group>, ReplicationError> {
        self.find(name)
            .ok_or_else(|| ReplicationError::GroupNotFound(name.to_string()))
    }

    pub fn groups(&self) -> impl Iterator<Item = &Arc<Group>> {
        self.groups.iter()
    }

    fn find(&self, name: &str) -> Option<&Arc<Group>> {
        self.groups
            .iter()
            .find(|g| g.name().eq_ignore_ascii_case(name))
    }

    /// Selects an available endpoint of `group`.
    pub fn select(
        &self,
        group: &str,
        require_master: bool,
    ) -> Result<Arc<Endpoint>, ReplicationError> {
        let group = self.group(group)?;
        group
            .select(require_master, &[])
            .ok_or_else(|| ReplicationError::NoAvailableEndpoint {
                group: group.name().to_string(),
                last_error: None,
            })
    }

    /// Returns a session on an endpoint of `group`.
    ///
    /// `existing` is returned as is when it is open and already connected to
    /// the selected endpoint; otherwise it is closed. Endpoints that cannot be
    /// reached are skipped; any other error is returned immediately.
    pub async fn get_connection(
        &self,
        group: &str,
        require_master: bool,
        existing: Option<Session>,
    ) -> Result<Session, ReplicationError> {
        let group = self.group(group)?.clone();
        let mut existing = existing;
        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<ClientError> = None;

        loop {
            let Some(endpoint) = group.select(require_master, &tried) else {
                return Err(ReplicationError::NoAvailableEndpoint {
                    group: group.name().to_string(),
                    last_error: last_error.map(Box::new),
                });
            };

            if let Some(mut session) = existing.take() {
                if session.is_open() && session.config() == endpoint.config() {
                    tracing::debug!(
                        group = %group.name(),
                        endpoint = %endpoint.name(),
                        session = %session.id(),
                        "Reusing session"
                    );
                    return Ok(session);
                }
                if let Err(e) = session.close().await {
                    tracing::debug!(session = %session.id(), error = %e, "Error closing replaced session");
                }
            }

            match self.open(&endpoint).await {
                Ok(session) => {
                    tracing::debug!(
                        group = %group.name(),
                        endpoint = %endpoint.name(),
                        session = %session.id(),
                        "Session opened"
                    );
                    return Ok(session);
                }
                Err(err) => {
                    tracing::warn!(
                        group = %group.name(),
                        endpoint = %endpoint.name(),
                        error = %err,
                        "Endpoint failed, marking unavailable"
                    );
                    endpoint.set_available(false);
                    self.schedule_probe(&endpoint, group.retry_time());

                    if !err.is_connection_error() {
                        return Err(err.into());
                    }
                    tried.push(endpoint.name().to_string());
                    last_error = Some(err);
                }
            }
        }
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Session, ClientError> {
        let mut builder = Session::builder(endpoint.config().clone());
        if let Some(registry) = &self.interceptors {
            builder = builder.registry(registry.clone());
        }
        builder.open().await
    }

    /// Starts probing `endpoint` unless a probe is already running.
    fn schedule_probe(&self, endpoint: &Arc<Endpoint>, retry_time: Duration) {
        if !endpoint.begin_probe() {
            return;
        }

        let mut guard = ProbeGuard::new(endpoint.clone());
        let handle = tokio::spawn(async move {
            let endpoint = guard.endpoint.clone();
            let config = endpoint.config();
            let mut ticker = interval_at(Instant::now() + retry_time, retry_time);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match Transport::probe(&config.host, config.port, config.connect_timeout).await {
                    Ok(()) => {
                        // A failure seen right after this must be able to start a new probe.
                        guard.release();
                        endpoint.set_available(true);
                        tracing::info!(
                            endpoint = %endpoint.name(),
                            address = %config.address(),
                            "Endpoint available again"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(endpoint = %endpoint.name(), error = %e, "Probe failed");
                    }
                }
            }
        });

        let mut probes = self.probes.lock();
        probes.retain(|h| !h.is_finished());
        probes.push(handle);
    }

    /// Number of probes still running.
    pub fn active_probes(&self) -> usize {
        let mut probes = self.probes.lock();
        probes.retain(|h| !h.is_finished());
        probes.len()
    }
}

impl Default for FailoverManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FailoverManager {
    fn drop(&mut self) {
        for handle in self.probes.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// Releases the endpoint's probe slot when the probe ends or is aborted.
struct ProbeGuard {
    endpoint: Arc<Endpoint>,
    armed: bool,
}

impl ProbeGuard {
    fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            endpoint,
            armed: true,
        }
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.armed) {
            self.endpoint.end_probe();
        }
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.release();
    }
}
