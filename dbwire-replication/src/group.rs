//! Replication groups and endpoint selection.

use crate::config::ConfigError;
use crate::endpoint::Endpoint;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default interval between availability probes of a failed endpoint.
pub const DEFAULT_RETRY_TIME: Duration = Duration::from_secs(60);

/// Picks one endpoint out of the eligible candidates.
pub trait EndpointSelector: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the index of the chosen candidate. `candidates` is never empty
    /// and is in declaration order.
    fn select(&self, candidates: &[Arc<Endpoint>]) -> Option<usize>;
}

/// How a group chooses among its available endpoints.
pub enum SelectionStrategy {
    /// Cycles through candidates in declaration order.
    RoundRobin { cursor: AtomicUsize },
    /// First candidate by descending priority, then declaration order.
    Sequential,
    Custom(Box<dyn EndpointSelector>),
}

impl SelectionStrategy {
    pub fn round_robin() -> Self {
        SelectionStrategy::RoundRobin {
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn custom(selector: impl EndpointSelector + 'static) -> Self {
        SelectionStrategy::Custom(Box::new(selector))
    }

    pub fn name(&self) -> &str {
        match self {
            SelectionStrategy::RoundRobin { .. } => SelectorRegistry::ROUND_ROBIN,
            SelectionStrategy::Sequential => SelectorRegistry::SEQUENTIAL,
            SelectionStrategy::Custom(selector) => selector.name(),
        }
    }

    fn pick(&self, candidates: &[Arc<Endpoint>]) -> Option<usize> {
        match self {
            SelectionStrategy::RoundRobin { cursor } => {
                let n = cursor.fetch_add(1, Ordering::Relaxed);
                Some(n % candidates.len())
            }
            SelectionStrategy::Sequential => candidates
                .iter()
                .enumerate()
                // max_by_key keeps the last maximum; reverse so ties resolve
                // to the earliest declaration.
                .rev()
                .max_by_key(|(_, endpoint)| endpoint.priority())
                .map(|(index, _)| index),
            SelectionStrategy::Custom(selector) => selector.select(candidates),
        }
    }
}

impl Default for SelectionStrategy {
    fn default() -> Self {
        Self::round_robin()
    }
}

impl fmt::Debug for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type SelectorFactory = Box<dyn Fn() -> Box<dyn EndpointSelector> + Send + Sync>;

/// Maps strategy names from configuration to strategies.
///
/// `round-robin` and `sequential` are always present. Names are
/// case-insensitive and `_` matches `-`.
pub struct SelectorRegistry {
    factories: HashMap<String, SelectorFactory>,
}

impl SelectorRegistry {
    pub const ROUND_ROBIN: &'static str = "round-robin";
    pub const SEQUENTIAL: &'static str = "sequential";

    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers a custom selector under `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn EndpointSelector> + Send + Sync + 'static,
    {
        self.factories.insert(normalize(name), Box::new(factory));
    }

    /// Builds a fresh strategy for `name`.
    pub fn strategy(&self, name: &str) -> Result<SelectionStrategy, ConfigError> {
        let key = normalize(name);
        match key.as_str() {
            Self::ROUND_ROBIN | "roundrobin" => Ok(SelectionStrategy::round_robin()),
            Self::SEQUENTIAL => Ok(SelectionStrategy::Sequential),
            _ => self
                .factories
                .get(&key)
                .map(|factory| SelectionStrategy::Custom(factory()))
                .ok_or_else(|| {
                    ConfigError::ValidationError(format!("unknown selection strategy '{}'", name))
                }),
        }
    }
}

impl Default for SelectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('_', "-")
}

/// A named set of endpoints serving the same data.
#[derive(Debug)]
pub struct Group {
    name: String,
    endpoints: Vec<Arc<Endpoint>>,
    strategy: SelectionStrategy,
    retry_time: Duration,
}

impl Group {
    pub fn new(name: impl Into<String>, strategy: SelectionStrategy) -> Self {
        Self {
            name: name.into(),
            endpoints: Vec::new(),
            strategy,
            retry_time: DEFAULT_RETRY_TIME,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(Arc::new(endpoint));
        self
    }

    /// Sets the interval between probes of an unavailable endpoint.
    pub fn with_retry_time(mut self, retry_time: Duration) -> Self {
        self.retry_time = retry_time;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn endpoint(&self, name: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.name() == name)
    }

    pub fn strategy(&self) -> &SelectionStrategy {
        &self.strategy
    }

    pub fn retry_time(&self) -> Duration {
        self.retry_time
    }

    /// Chooses an available endpoint that can serve the request and is not
    /// in `excluded`.
    pub fn select(&self, require_master: bool, excluded: &[String]) -> Option<Arc<Endpoint>> {
        let candidates: Vec<Arc<Endpoint>> = self
            .endpoints
            .iter()
            .filter(|e| e.is_available() && e.serves(require_master))
            .filter(|e| !excluded.iter().any(|name| name == e.name()))
            .cloned()
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let index = self.strategy.pick(&candidates)?;
        candidates.get(index).cloned()
    }
}
