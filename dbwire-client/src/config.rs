//! Connection configuration.
//!
//! A [`ConnectionConfig`] is built either with the builder methods or from
//! a connection descriptor string of `key=value` pairs separated by `;`:
//!
//! ```text
//! server=db1.internal;port=33060;user=app;password=secret;ssl-mode=required
//! ```
//!
//! Keys are case-insensitive and `_` is accepted in place of `-`.

use crate::error::ClientError;
use dbwire_protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default number of retries for transient server errors.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default upper bound for a single retry delay.
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// TLS policy for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Never upgrade.
    Disabled,
    /// Upgrade when the server supports it, otherwise continue unencrypted.
    #[default]
    Preferred,
    /// Fail the session when the server cannot upgrade.
    Required,
}

impl FromStr for TlsMode {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "none" | "false" => Ok(TlsMode::Disabled),
            "preferred" => Ok(TlsMode::Preferred),
            "required" | "true" => Ok(TlsMode::Required),
            other => Err(ClientError::Config(format!("invalid ssl-mode '{}'", other))),
        }
    }
}

/// TLS configuration for client connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsClientConfig {
    /// Upgrade policy.
    pub mode: TlsMode,
    /// Path to PEM-encoded CA certificate(s) for server verification.
    /// If None, the bundled web PKI roots are used.
    pub ca_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client certificate (for mTLS).
    pub client_cert_path: Option<PathBuf>,
    /// Path to PEM-encoded client private key (for mTLS).
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification (INSECURE - development only).
    pub insecure: bool,
    /// Server name for SNI (defaults to the configured host).
    pub server_name: Option<String>,
}

impl TlsClientConfig {
    pub fn new(mode: TlsMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn with_client_cert(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.client_cert_path = Some(cert_path.into());
        self.client_key_path = Some(key_path.into());
        self
    }

    pub fn with_insecure(mut self) -> Self {
        self.insecure = true;
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Connection configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// User name for authentication.
    pub user: String,
    /// Password for authentication.
    pub password: String,
    /// Default schema.
    pub database: Option<String>,
    /// Authentication plugin name.
    pub auth_plugin: String,
    /// Client name reported in logs.
    pub client_name: Option<String>,
    /// TLS configuration.
    pub tls: TlsClientConfig,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Timeout for each server response.
    pub command_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Base retry count for transient errors.
    pub max_retries: u32,
    /// Base upper bound for a retry delay.
    pub max_retry_delay: Duration,
    /// Statement interceptor names, resolved against an interceptor registry.
    pub command_interceptors: Vec<String>,
    /// Exception interceptor names, resolved against an interceptor registry.
    pub exception_interceptors: Vec<String>,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("auth_plugin", &self.auth_plugin)
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: String::new(),
            password: String::new(),
            database: None,
            auth_plugin: "baseline".to_string(),
            client_name: None,
            tls: TlsClientConfig::default(),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            command_interceptors: Vec::new(),
            exception_interceptors: Vec::new(),
        }
    }

    /// Parses a connection descriptor string.
    pub fn from_descriptor(descriptor: &str) -> Result<Self, ClientError> {
        let mut config = Self::default();

        for part in descriptor.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=').ok_or_else(|| {
                ClientError::Config(format!("descriptor entry '{}' is not key=value", part))
            })?;
            let key = key.trim().to_ascii_lowercase().replace('_', "-");
            let value = value.trim();

            match key.as_str() {
                "server" | "host" => config.host = value.to_string(),
                "port" => config.port = parse_value(&key, value)?,
                "user" | "uid" => config.user = value.to_string(),
                "password" | "pwd" => config.password = value.to_string(),
                "database" | "schema" => {
                    config.database = (!value.is_empty()).then(|| value.to_string())
                }
                "auth" => config.auth_plugin = value.to_ascii_lowercase(),
                "client-name" => config.client_name = Some(value.to_string()),
                "ssl-mode" => config.tls.mode = value.parse()?,
                "ssl-ca" => config.tls.ca_cert_path = Some(PathBuf::from(value)),
                "ssl-cert" => config.tls.client_cert_path = Some(PathBuf::from(value)),
                "ssl-key" => config.tls.client_key_path = Some(PathBuf::from(value)),
                "ssl-server-name" => config.tls.server_name = Some(value.to_string()),
                "ssl-insecure" => config.tls.insecure = parse_bool(&key, value)?,
                "connect-timeout" => config.connect_timeout = parse_timeout(&key, value)?,
                "command-timeout" => config.command_timeout = parse_timeout(&key, value)?,
                "read-buffer-size" => {
                    config = config.with_read_buffer_size(parse_value(&key, value)?)
                }
                "max-retries" => config.max_retries = parse_value(&key, value)?,
                "max-retry-delay" => {
                    config.max_retry_delay = Duration::from_secs(parse_value(&key, value)?)
                }
                "command-interceptors" => config.command_interceptors = parse_list(value),
                "exception-interceptors" => config.exception_interceptors = parse_list(value),
                other => {
                    return Err(ClientError::Config(format!(
                        "unknown descriptor key '{}'",
                        other
                    )))
                }
            }
        }

        if config.host.is_empty() {
            return Err(ClientError::Config("descriptor has no server".to_string()));
        }
        if config.tls.client_cert_path.is_some() != config.tls.client_key_path.is_some() {
            return Err(ClientError::Config(
                "ssl-cert and ssl-key must be set together".to_string(),
            ));
        }
        Ok(config)
    }

    /// Returns `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_auth_plugin(mut self, name: impl Into<String>) -> Self {
        self.auth_plugin = name.into();
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_tls(mut self, tls_config: TlsClientConfig) -> Self {
        self.tls = tls_config;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_retry_limits(mut self, max_retries: u32, max_retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.max_retry_delay = max_retry_delay;
        self
    }

    pub fn with_command_interceptor(mut self, name: impl Into<String>) -> Self {
        self.command_interceptors.push(name.into());
        self
    }

    pub fn with_exception_interceptor(mut self, name: impl Into<String>) -> Self {
        self.exception_interceptors.push(name.into());
        self
    }
}

impl FromStr for ConnectionConfig {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_descriptor(s)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ClientError> {
    value
        .parse()
        .map_err(|_| ClientError::Config(format!("invalid value '{}' for {}", value, key)))
}

/// Timeouts are whole seconds; zero would fail every read immediately.
fn parse_timeout(key: &str, value: &str) -> Result<Duration, ClientError> {
    match parse_value::<u64>(key, value)? {
        0 => Err(ClientError::Config(format!("{} must be at least 1 second", key))),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ClientError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ClientError::Config(format!(
            "invalid value '{}' for {}",
            value, key
        ))),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
