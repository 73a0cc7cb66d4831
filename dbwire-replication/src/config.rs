//! Replication group configuration.
//!
//! Groups are described in YAML:
//!
//! ```yaml
//! groups:
//!   - name: orders
//!     strategy: round-robin
//!     retry_time_secs: 30
//!     endpoints:
//!       - name: primary
//!         role: master
//!         descriptor: "server=db1;user=app;password=secret"
//!       - name: replica-1
//!         role: replica
//!         priority: 10
//!         descriptor: "server=db2;user=app;password=secret"
//! ```
//!
//! The file is taken from `DBWIRE_REPLICATION_CONFIG` by [`ReplicationConfig::load`].

use crate::endpoint::{Endpoint, EndpointRole};
use crate::group::{Group, SelectorRegistry};
use dbwire_client::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the replication config file.
pub const CONFIG_ENV: &str = "DBWIRE_REPLICATION_CONFIG";

/// Replication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub groups: Vec<GroupConfig>,
}

/// One replication group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    /// Selection strategy name, resolved against a [`SelectorRegistry`].
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Seconds between availability probes of a failed endpoint.
    #[serde(default = "default_retry_time_secs")]
    pub retry_time_secs: u64,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// One endpoint of a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    #[serde(default)]
    pub role: EndpointRole,
    #[serde(default)]
    pub priority: i32,
    /// Connection descriptor (`key=value;...`).
    pub descriptor: String,
}

fn default_strategy() -> String {
    SelectorRegistry::ROUND_ROBIN.to_string()
}

fn default_retry_time_secs() -> u64 {
    60
}

impl ReplicationConfig {
    /// Loads the file named by `DBWIRE_REPLICATION_CONFIG`, or an empty
    /// configuration when the variable is unset.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Loads and validates a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ReplicationConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut group_names = HashSet::new();
        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "group name must not be empty".to_string(),
                ));
            }
            if !group_names.insert(group.name.to_ascii_lowercase()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate group '{}'",
                    group.name
                )));
            }
            group.validate()?;
        }
        Ok(())
    }

    /// Builds the groups, resolving strategy names against `selectors`.
    pub fn build_groups(&self, selectors: &SelectorRegistry) -> Result<Vec<Group>, ConfigError> {
        self.validate()?;
        self.groups.iter().map(|g| g.build(selectors)).collect()
    }
}

impl GroupConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "group '{}' has no endpoints",
                self.name
            )));
        }
        if self.retry_time_secs == 0 {
            return Err(ConfigError::ValidationError(format!(
                "group '{}': retry_time_secs must be positive",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            if !names.insert(endpoint.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "group '{}': duplicate endpoint '{}'",
                    self.name, endpoint.name
                )));
            }
            endpoint.connection_config().map_err(|e| {
                ConfigError::ValidationError(format!(
                    "group '{}', endpoint '{}': {}",
                    self.name, endpoint.name, e
                ))
            })?;
        }
        Ok(())
    }

    fn build(&self, selectors: &SelectorRegistry) -> Result<Group, ConfigError> {
        let strategy = selectors.strategy(&self.strategy)?;
        let mut group = Group::new(&self.name, strategy)
            .with_retry_time(Duration::from_secs(self.retry_time_secs));
        for endpoint in &self.endpoints {
            let config = endpoint.connection_config().map_err(|e| {
                ConfigError::ValidationError(format!("endpoint '{}': {}", endpoint.name, e))
            })?;
            group = group.with_endpoint(
                Endpoint::new(&endpoint.name, endpoint.role, config)
                    .with_priority(endpoint.priority),
            );
        }
        Ok(group)
    }
}

impl EndpointConfig {
    fn connection_config(&self) -> Result<ConnectionConfig, dbwire_client::ClientError> {
        ConnectionConfig::from_descriptor(&self.descriptor)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(_, e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
groups:
  - name: orders
    strategy: sequential
    retry_time_secs: 5
    endpoints:
      - name: primary
        role: master
        priority: 10
        descriptor: "server=db1;port=4406;user=app;password=secret"
      - name: replica-1
        descriptor: "server=db2;port=4406;user=app;password=secret"
  - name: reports
    endpoints:
      - name: analytics
        descriptor: "server=db3"
"#;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_from_file() {
        let file = write_config(SAMPLE);
        let config = ReplicationConfig::from_file(file.path()).unwrap();

        assert_eq!(config.groups.len(), 2);
        let orders = &config.groups[0];
        assert_eq!(orders.strategy, "sequential");
        assert_eq!(orders.retry_time_secs, 5);
        assert_eq!(orders.endpoints[0].role, EndpointRole::Master);
        assert_eq!(orders.endpoints[0].priority, 10);
        assert_eq!(orders.endpoints[1].role, EndpointRole::Replica);

        let reports = &config.groups[1];
        assert_eq!(reports.strategy, "round-robin");
        assert_eq!(reports.retry_time_secs, 60);
    }

    #[test]
    fn test_build_groups() {
        let file = write_config(SAMPLE);
        let config = ReplicationConfig::from_file(file.path()).unwrap();
        let groups = config.build_groups(&SelectorRegistry::default()).unwrap();

        let orders = &groups[0];
        assert_eq!(orders.name(), "orders");
        assert_eq!(orders.strategy().name(), "sequential");
        assert_eq!(orders.retry_time(), Duration::from_secs(5));
        let primary = orders.endpoint("primary").unwrap();
        assert!(primary.is_master());
        assert_eq!(primary.config().host, "db1");
        assert_eq!(primary.priority(), 10);
    }

    #[test]
    fn test_missing_file() {
        let err = ReplicationConfig::from_file("/nonexistent/replication.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));
    }

    #[test]
    fn test_invalid_yaml() {
        let file = write_config("groups: [name: ");
        let err = ReplicationConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            "groups:\n  - name: empty\n",
            "groups:\n  - name: a\n    endpoints: [{name: x, descriptor: \"server=h\"}]\n  - name: A\n    endpoints: [{name: y, descriptor: \"server=h\"}]\n",
            "groups:\n  - name: dup\n    endpoints:\n      - {name: x, descriptor: \"server=h\"}\n      - {name: x, descriptor: \"server=h2\"}\n",
            "groups:\n  - name: bad\n    endpoints: [{name: x, descriptor: \"server\"}]\n",
            "groups:\n  - name: zero\n    retry_time_secs: 0\n    endpoints: [{name: x, descriptor: \"server=h\"}]\n",
        ];

        for yaml in cases {
            let file = write_config(yaml);
            let err = ReplicationConfig::from_file(file.path()).unwrap_err();
            assert!(
                matches!(err, ConfigError::ValidationError(_)),
                "expected validation error for {:?}, got {}",
                yaml,
                err
            );
        }
    }

    #[test]
    fn test_unknown_strategy() {
        let config: ReplicationConfig = serde_yaml::from_str(
            "groups:\n  - name: g\n    strategy: random\n    endpoints: [{name: x, descriptor: \"server=h\"}]\n",
        )
        .unwrap();
        let err = config
            .build_groups(&SelectorRegistry::default())
            .unwrap_err();
        assert!(err.to_string().contains("unknown selection strategy"));
    }
}
