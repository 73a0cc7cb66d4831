//! Authentication plugins.
//!
//! The session drives a fixed `AuthStart -> challenge -> AuthContinue ->
//! AuthOk` exchange; a plugin only turns the server challenge into a
//! response.

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use sha2::{Digest, Sha256};
use std::fmt;

/// A pluggable authentication mechanism.
pub trait AuthMechanism: Send + fmt::Debug {
    /// Mechanism name sent in `AuthStart`.
    fn plugin_name(&self) -> &str;

    /// Data sent along with `AuthStart`.
    fn initial_data(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Whether the mechanism refuses to run over an unencrypted stream.
    fn requires_tls(&self) -> bool {
        false
    }

    /// Produces the response to a server challenge.
    fn continue_auth(&mut self, challenge: &[u8]) -> Result<Vec<u8>, ClientError>;
}

/// Hashed-challenge mechanism. The password never crosses the wire.
pub struct BaselineAuth {
    user: String,
    password: String,
    database: String,
}

impl BaselineAuth {
    pub const NAME: &'static str = "baseline";

    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            database: database.into(),
        }
    }
}

impl fmt::Debug for BaselineAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaselineAuth")
            .field("user", &self.user)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl AuthMechanism for BaselineAuth {
    fn plugin_name(&self) -> &str {
        Self::NAME
    }

    fn continue_auth(&mut self, challenge: &[u8]) -> Result<Vec<u8>, ClientError> {
        if challenge.is_empty() {
            return Err(ClientError::Authentication(
                "server sent an empty challenge".to_string(),
            ));
        }

        let mut response = credential_prefix(&self.database, &self.user);
        if !self.password.is_empty() {
            response.extend_from_slice(hex::encode(scramble(&self.password, challenge)).as_bytes());
        }
        Ok(response)
    }
}

/// Cleartext mechanism. Only allowed over TLS.
pub struct PlainAuth {
    user: String,
    password: String,
    database: String,
}

impl PlainAuth {
    pub const NAME: &'static str = "plain";

    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            database: database.into(),
        }
    }
}

impl fmt::Debug for PlainAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainAuth")
            .field("user", &self.user)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl AuthMechanism for PlainAuth {
    fn plugin_name(&self) -> &str {
        Self::NAME
    }

    fn requires_tls(&self) -> bool {
        true
    }

    fn continue_auth(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, ClientError> {
        let mut response = credential_prefix(&self.database, &self.user);
        response.extend_from_slice(self.password.as_bytes());
        Ok(response)
    }
}

/// The plugin a session authenticates with.
#[derive(Debug)]
pub enum AuthPlugin {
    Baseline(BaselineAuth),
    Plain(PlainAuth),
    Custom(Box<dyn AuthMechanism>),
}

impl AuthPlugin {
    /// Builds the built-in plugin named by `config.auth_plugin`.
    pub fn from_config(config: &ConnectionConfig) -> Result<Self, ClientError> {
        let database = config.database.clone().unwrap_or_default();
        match config.auth_plugin.to_ascii_lowercase().as_str() {
            BaselineAuth::NAME => Ok(AuthPlugin::Baseline(BaselineAuth::new(
                &config.user,
                &config.password,
                database,
            ))),
            PlainAuth::NAME => Ok(AuthPlugin::Plain(PlainAuth::new(
                &config.user,
                &config.password,
                database,
            ))),
            other => Err(ClientError::Config(format!(
                "unknown auth plugin '{}'",
                other
            ))),
        }
    }

    pub fn custom(mechanism: impl AuthMechanism + 'static) -> Self {
        AuthPlugin::Custom(Box::new(mechanism))
    }

    fn mechanism(&self) -> &dyn AuthMechanism {
        match self {
            AuthPlugin::Baseline(m) => m as &dyn AuthMechanism,
            AuthPlugin::Plain(m) => m as &dyn AuthMechanism,
            AuthPlugin::Custom(m) => m.as_ref(),
        }
    }

    pub fn name(&self) -> &str {
        self.mechanism().plugin_name()
    }

    pub fn initial_data(&self) -> Vec<u8> {
        self.mechanism().initial_data()
    }

    pub fn requires_tls(&self) -> bool {
        self.mechanism().requires_tls()
    }

    pub fn continue_auth(&mut self, challenge: &[u8]) -> Result<Vec<u8>, ClientError> {
        match self {
            AuthPlugin::Baseline(m) => m.continue_auth(challenge),
            AuthPlugin::Plain(m) => m.continue_auth(challenge),
            AuthPlugin::Custom(m) => m.continue_auth(challenge),
        }
    }
}

fn credential_prefix(database: &str, user: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(database.len() + user.len() + 2 + 64);
    data.extend_from_slice(database.as_bytes());
    data.push(0);
    data.extend_from_slice(user.as_bytes());
    data.push(0);
    data
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Computes `SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) || nonce)`.
pub fn scramble(password: &str, nonce: &[u8]) -> [u8; 32] {
    let stage1 = sha256(&[password.as_bytes()]);
    let stage2 = sha256(&[&stage1]);
    let mask = sha256(&[&stage2, nonce]);

    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = stage1[i] ^ mask[i];
    }
    out
}

/// Returns the stored form of a password: `SHA256(SHA256(pw))`.
pub fn password_hash(password: &str) -> [u8; 32] {
    sha256(&[&sha256(&[password.as_bytes()])])
}

/// Checks a scramble against a stored password hash.
pub fn verify_scramble(stored: &[u8; 32], nonce: &[u8], scrambled: &[u8]) -> bool {
    if scrambled.len() != 32 {
        return false;
    }
    let mask = sha256(&[stored, nonce]);
    let mut stage1 = [0u8; 32];
    for (i, byte) in stage1.iter_mut().enumerate() {
        *byte = scrambled[i] ^ mask[i];
    }
    sha256(&[&stage1]) == *stored
}
