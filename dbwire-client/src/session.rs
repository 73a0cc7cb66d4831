//! Session state machine.
//!
//! A session walks `Connecting -> Authenticating -> Open -> Closed`, never
//! backwards. The optional TLS upgrade happens while still `Connecting`.

use crate::auth::AuthPlugin;
use crate::backoff::BackoffPolicy;
use crate::config::{ConnectionConfig, TlsMode};
use crate::error::ClientError;
use crate::interceptor::{
    CommandChain, CommandInterceptor, ExceptionChain, ExceptionInterceptor, InterceptorRegistry,
};
use crate::result::{
    discard_until_complete, read_header, unexpected, Prepared, ResultHeader, ResultStream,
};
use crate::transport::Transport;
use dbwire_protocol::{
    AuthContinue, AuthStart, Capabilities, ClientMessage, ServerMessage, Statement,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Open,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Open => "open",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Builder for a [`Session`] with custom plugins and interceptors.
pub struct SessionBuilder {
    config: ConnectionConfig,
    registry: Option<Arc<InterceptorRegistry>>,
    auth: Option<AuthPlugin>,
    commands: Vec<CommandInterceptor>,
    exceptions: Vec<ExceptionInterceptor>,
}

impl SessionBuilder {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            registry: None,
            auth: None,
            commands: Vec::new(),
            exceptions: Vec::new(),
        }
    }

    /// Resolves the interceptor names in the configuration against
    /// `registry` instead of the built-in one.
    pub fn registry(mut self, registry: Arc<InterceptorRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Authenticates with `plugin` instead of the configured one.
    pub fn auth_plugin(mut self, plugin: AuthPlugin) -> Self {
        self.auth = Some(plugin);
        self
    }

    /// Registers a statement interceptor after the configured ones.
    pub fn command_interceptor(mut self, interceptor: CommandInterceptor) -> Self {
        self.commands.push(interceptor);
        self
    }

    /// Registers an exception interceptor after the configured ones.
    pub fn exception_interceptor(mut self, interceptor: ExceptionInterceptor) -> Self {
        self.exceptions.push(interceptor);
        self
    }

    /// Connects, negotiates and authenticates.
    pub async fn open(self) -> Result<Session, ClientError> {
        let registry = self.registry.unwrap_or_default();

        let mut commands = registry.command_chain(&self.config.command_interceptors)?;
        for interceptor in self.commands {
            commands.push(interceptor);
        }
        let mut exceptions = registry.exception_chain(&self.config.exception_interceptors)?;
        for interceptor in self.exceptions {
            exceptions.push(interceptor);
        }

        let auth = match self.auth {
            Some(plugin) => plugin,
            None => AuthPlugin::from_config(&self.config)?,
        };

        let mut session = Session {
            id: Uuid::new_v4(),
            config: self.config,
            transport: None,
            state: SessionState::Connecting,
            capabilities: Capabilities::default(),
            auth_plugin: String::new(),
            tls_downgraded: false,
            commands,
            exceptions,
            pending_result: false,
        };

        tracing::debug!(session = %session.id, address = %session.config.address(), "Opening session");
        match session.establish(auth).await {
            Ok(()) => {
                tracing::debug!(
                    session = %session.id,
                    tls = session.is_tls(),
                    auth = %session.auth_plugin,
                    "Session open"
                );
                Ok(session)
            }
            Err(err) => {
                tracing::debug!(session = %session.id, error = %err, "Session failed to open");
                session.abort();
                Err(session.exceptions.transform(err))
            }
        }
    }
}

/// One authenticated connection to a server.
pub struct Session {
    id: Uuid,
    config: ConnectionConfig,
    transport: Option<Transport>,
    state: SessionState,
    capabilities: Capabilities,
    auth_plugin: String,
    tls_downgraded: bool,
    commands: CommandChain,
    exceptions: ExceptionChain,
    /// A result stream was dropped before it completed.
    pending_result: bool,
}

impl Session {
    /// Opens a session with the configured plugin and interceptors.
    pub async fn open(config: ConnectionConfig) -> Result<Self, ClientError> {
        SessionBuilder::new(config).open().await
    }

    pub fn builder(config: ConnectionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Capabilities advertised by the server.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Name of the plugin the session authenticated with.
    pub fn auth_plugin(&self) -> &str {
        &self.auth_plugin
    }

    pub fn is_tls(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_tls)
    }

    /// Whether TLS was preferred but the server could not provide it.
    pub fn tls_downgraded(&self) -> bool {
        self.tls_downgraded
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(Transport::peer)
    }

    /// Whether an abandoned result will be dumped before the next statement.
    pub fn has_pending_result(&self) -> bool {
        self.pending_result
    }

    /// Executes a statement and returns a stream over its results.
    pub async fn execute(&mut self, statement: &Statement) -> Result<ResultStream<'_>, ClientError> {
        match self.prepare(statement).await {
            Ok(prepared) => Ok(ResultStream::new(self, prepared)),
            Err(err) => Err(self.exceptions.transform(err)),
        }
    }

    /// Executes a statement, retrying transient server errors per `policy`.
    ///
    /// Retry decisions see the error as the server reported it; the
    /// exception chain only runs on the error that is finally returned.
    pub async fn execute_with_retry(
        &mut self,
        statement: &Statement,
        policy: &mut BackoffPolicy,
    ) -> Result<ResultStream<'_>, ClientError> {
        policy.reset();
        let prepared = loop {
            policy.record_attempt();
            match self.prepare(statement).await {
                Ok(prepared) => break prepared,
                Err(err) => {
                    if !policy.wait_for_retry(&err).await {
                        return Err(self.exceptions.transform(err));
                    }
                }
            }
        };
        Ok(ResultStream::new(self, prepared))
    }

    /// Runs a no-op statement and drains it.
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        let mut result = self.execute(&Statement::sql("SELECT 1")).await?;
        result.dump().await
    }

    /// Sends a best-effort close notification and releases the transport.
    ///
    /// Calling this on a closed session does nothing.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        if let Some(mut transport) = self.transport.take() {
            if self.state == SessionState::Open {
                if let Err(e) = transport.send(&ClientMessage::SessionClose).await {
                    tracing::debug!(session = %self.id, error = %e, "Close notification failed");
                }
            }
            transport.shutdown().await.ok();
        }

        self.transition(SessionState::Closed);
        self.pending_result = false;
        Ok(())
    }

    async fn establish(&mut self, mut auth: AuthPlugin) -> Result<(), ClientError> {
        let mut transport = Transport::connect(&self.config).await?;

        transport.send(&ClientMessage::CapabilitiesGet).await?;
        let capabilities = match read_skipping_notices(&mut transport).await? {
            ServerMessage::Capabilities(caps) => caps,
            ServerMessage::Error(err) => return Err(ClientError::from_server(err)),
            other => return Err(unexpected(&other, "during capability negotiation")),
        };
        if let Some(size) = capabilities.max_block_size {
            transport.set_max_block_size(size);
        }

        match (self.config.tls.mode, capabilities.tls) {
            (TlsMode::Disabled, _) => {}
            (TlsMode::Required, false) => return Err(ClientError::TlsUnsupported),
            (TlsMode::Preferred, false) => {
                tracing::warn!(
                    session = %self.id,
                    address = %self.config.address(),
                    "Server does not support TLS, continuing unencrypted"
                );
                self.tls_downgraded = true;
            }
            (_, true) => {
                transport
                    .send(&ClientMessage::CapabilitiesSet(Capabilities::request_tls()))
                    .await?;
                match read_skipping_notices(&mut transport).await? {
                    ServerMessage::Ok(_) => {}
                    ServerMessage::Error(err) => return Err(ClientError::from_server(err)),
                    other => return Err(unexpected(&other, "after TLS request")),
                }
                transport = transport.upgrade_to_tls(&self.config.tls).await?;
                tracing::debug!(session = %self.id, "Transport upgraded to TLS");
            }
        }
        self.capabilities = capabilities;

        self.transition(SessionState::Authenticating);
        if auth.requires_tls() && !transport.is_tls() {
            return Err(ClientError::Authentication(format!(
                "plugin '{}' requires TLS",
                auth.name()
            )));
        }
        if !self.capabilities.supports_mechanism(auth.name()) {
            return Err(ClientError::Authentication(format!(
                "server does not accept plugin '{}'",
                auth.name()
            )));
        }
        authenticate(&mut transport, &mut auth).await?;

        self.auth_plugin = auth.name().to_string();
        self.transport = Some(transport);
        self.transition(SessionState::Open);
        Ok(())
    }

    /// Sends a statement and reads its header, or lets an interceptor
    /// answer it.
    ///
    /// Errors come back untransformed so callers can classify them first.
    async fn prepare(&mut self, statement: &Statement) -> Result<Prepared, ClientError> {
        if self.state != SessionState::Open {
            return Err(ClientError::InvalidState {
                action: "execute",
                expected: SessionState::Open,
                actual: self.state,
            });
        }

        if self.pending_result {
            let drained = match self.transport_mut() {
                Ok(transport) => discard_until_complete(transport).await,
                Err(err) => Err(err),
            };
            match drained {
                Ok(_) => self.finish_result(),
                Err(err) => {
                    self.abort_if_fatal(&err);
                    return Err(err);
                }
            }
        }

        if let Some(set) = self.commands.try_handle(statement) {
            return Ok(Prepared::Intercepted(set));
        }

        tracing::trace!(session = %self.id, statement = %statement.describe(), "Sending statement");
        match self.send_statement(statement).await {
            Ok(header) => Ok(Prepared::Wire(header)),
            Err(err) => {
                self.abort_if_fatal(&err);
                Err(err)
            }
        }
    }

    async fn send_statement(
        &mut self,
        statement: &Statement,
    ) -> Result<ResultHeader, ClientError> {
        let transport = self.transport_mut()?;
        transport
            .send(&ClientMessage::Execute(Box::new(statement.clone())))
            .await?;
        self.pending_result = true;

        let transport = self.transport_mut()?;
        let header = read_header(transport).await;
        if let Err(ref err) = header {
            if err.server_code().is_some() {
                self.finish_result();
            }
        }
        header
    }

    pub(crate) fn transport_mut(&mut self) -> Result<&mut Transport, ClientError> {
        let state = self.state;
        self.transport.as_mut().ok_or(ClientError::InvalidState {
            action: "read",
            expected: SessionState::Open,
            actual: state,
        })
    }

    pub(crate) fn finish_result(&mut self) {
        self.pending_result = false;
    }

    /// Closes the session if `err` broke it, then runs the exception chain.
    pub(crate) fn fail(&mut self, err: ClientError) -> ClientError {
        self.abort_if_fatal(&err);
        self.exceptions.transform(err)
    }

    fn abort_if_fatal(&mut self, err: &ClientError) {
        if err.is_session_fatal() {
            tracing::debug!(session = %self.id, error = %err, "Closing session after fatal error");
            self.abort();
        }
    }

    /// Drops the transport without notifying the server.
    fn abort(&mut self) {
        self.transport = None;
        self.pending_result = false;
        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(next >= self.state, "{} -> {}", self.state, next);
        if next != self.state {
            tracing::trace!(session = %self.id, from = %self.state, to = %next, "State change");
            self.state = next;
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("address", &self.config.address())
            .field("state", &self.state)
            .field("tls", &self.is_tls())
            .field("auth_plugin", &self.auth_plugin)
            .finish_non_exhaustive()
    }
}

/// Runs `AuthStart -> challenge -> AuthContinue -> AuthOk`.
async fn authenticate(transport: &mut Transport, auth: &mut AuthPlugin) -> Result<(), ClientError> {
    transport
        .send(&ClientMessage::AuthStart(AuthStart {
            mech_name: auth.name().to_string(),
            auth_data: auth.initial_data(),
        }))
        .await?;

    let challenge = match read_skipping_notices(transport).await? {
        ServerMessage::AuthContinue(challenge) => challenge.auth_data,
        ServerMessage::Error(err) => return Err(ClientError::Authentication(err.message)),
        ServerMessage::AuthOk => {
            return Err(ClientError::Authentication(
                "server accepted before the challenge".to_string(),
            ))
        }
        other => {
            return Err(ClientError::Authentication(format!(
                "unexpected {:?} instead of a challenge",
                other.msg_type()
            )))
        }
    };

    let response = auth.continue_auth(&challenge)?;
    transport
        .send(&ClientMessage::AuthContinue(AuthContinue {
            auth_data: response,
        }))
        .await?;

    match read_skipping_notices(transport).await? {
        ServerMessage::AuthOk => Ok(()),
        ServerMessage::Error(err) => Err(ClientError::Authentication(err.message)),
        ServerMessage::AuthContinue(_) => Err(ClientError::Authentication(
            "server sent a second challenge".to_string(),
        )),
        other => Err(ClientError::Authentication(format!(
            "unexpected {:?} instead of AuthOk",
            other.msg_type()
        ))),
    }
}

async fn read_skipping_notices(transport: &mut Transport) -> Result<ServerMessage, ClientError> {
    loop {
        match transport.read_message().await? {
            ServerMessage::Notice(notice) => {
                tracing::debug!(kind = ?notice.kind, message = %notice.message, "Notice during handshake");
            }
            msg => return Ok(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{Backoff, BackoffAlgorithm};
    use crate::config::TlsClientConfig;
    use crate::interceptor::{ErrorTransformer, ResultSet, StatementInterceptor};
    use crate::mock::{self, MockIdentity, MockOptions, MockServer};
    use dbwire_protocol::{ColumnMeta, ColumnType, Collection, DataModel, ErrorCode, Value};
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn three_rows(_: &Statement) -> Vec<ServerMessage> {
        mock::result_set(
            &[("id", ColumnType::Sint), ("name", ColumnType::String)],
            &[
                vec![Value::Sint(1), Value::from("alpha")],
                vec![Value::Sint(2), Value::from("beta")],
                vec![Value::Sint(3), Value::Null],
            ],
        )
    }

    fn find_users() -> Statement {
        Statement::find(Collection::new("users"), DataModel::Table)
    }

    async fn open(server: &MockServer) -> Session {
        Session::open(server.config()).await.unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_reads_three_rows() {
        let server = MockServer::start(MockOptions::default(), three_rows).await.unwrap();
        let mut session = open(&server).await;
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.auth_plugin(), "baseline");
        assert!(!session.is_tls());

        let mut result = session.execute(&find_users()).await.unwrap();
        assert_eq!(result.columns().len(), 2);

        for expected in 1..=3 {
            let row = result.next().await.unwrap().unwrap();
            assert_eq!(row.get(0), Some(&Value::Sint(expected)));
        }
        assert!(result.next().await.unwrap().is_none());
        assert!(result.is_complete());
        drop(result);

        assert!(!session.has_pending_result());
        assert_eq!(server.statements(), vec![find_users()]);
    }

    #[tokio::test]
    async fn test_row_accessors() {
        let server = MockServer::start(MockOptions::default(), three_rows).await.unwrap();
        let mut session = open(&server).await;

        let mut result = session.execute(&find_users()).await.unwrap();
        let rows = result.fetch_all().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get_str("NAME"), Some("alpha"));
        assert_eq!(rows[1].get_i64("id"), Some(2));
        assert_eq!(rows[2].get_by_name("name"), Some(&Value::Null));
        assert_eq!(
            rows[0].to_json(),
            serde_json::json!({"id": 1, "name": "alpha"})
        );
    }

    #[tokio::test]
    async fn test_second_challenge_fails_authentication() {
        let options = MockOptions {
            extra_challenge: true,
            ..MockOptions::default()
        };
        let server = MockServer::start(options, three_rows).await.unwrap();

        let err = Session::open(server.config()).await.unwrap_err();
        assert!(matches!(err, ClientError::Authentication(ref m) if m.contains("second challenge")));
    }

    #[tokio::test]
    async fn test_wrong_password_carries_server_reason() {
        let server = MockServer::start(MockOptions::default(), three_rows).await.unwrap();
        let config = server.config().with_credentials("app", "wrong");

        let err = Session::open(config).await.unwrap_err();
        assert!(matches!(err, ClientError::Authentication(ref m) if m == "Access denied"));
    }

    #[tokio::test]
    async fn test_tls_policy() {
        let server = MockServer::start(MockOptions::default(), three_rows).await.unwrap();

        let required = server.config().with_tls(TlsClientConfig::new(TlsMode::Required));
        assert!(matches!(
            Session::open(required).await,
            Err(ClientError::TlsUnsupported)
        ));

        let preferred = server.config().with_tls(TlsClientConfig::new(TlsMode::Preferred));
        let session = Session::open(preferred).await.unwrap();
        assert!(session.tls_downgraded());
        assert!(!session.is_tls());

        let session = open(&server).await;
        assert!(!session.tls_downgraded());
    }

    fn localhost_identity() -> MockIdentity {
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "dbwire mock");
        params.subject_alt_names = vec![rcgen::SanType::DnsName(
            "localhost".to_string().try_into().unwrap(),
        )];
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        MockIdentity {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        }
    }

    #[tokio::test]
    async fn test_required_tls_authenticates_over_upgraded_stream() {
        let identity = localhost_identity();
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        ca.write_all(identity.cert_pem.as_bytes()).unwrap();

        let options = MockOptions {
            tls_identity: Some(identity),
            ..MockOptions::default()
        };
        let server = MockServer::start(options, three_rows).await.unwrap();
        let tls = TlsClientConfig::new(TlsMode::Required)
            .with_ca_cert(ca.path())
            .with_server_name("localhost");
        // PLAIN is only offered once the transport is encrypted.
        let config = server.config().with_tls(tls).with_auth_plugin("plain");

        let mut session = Session::open(config).await.unwrap();
        assert!(session.is_tls());
        assert!(!session.tls_downgraded());

        let mut result = session.execute(&find_users()).await.unwrap();
        assert_eq!(result.fetch_all().await.unwrap().len(), 3);
        drop(result);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_untrusted_server_certificate_fails_handshake() {
        let options = MockOptions {
            tls_identity: Some(localhost_identity()),
            ..MockOptions::default()
        };
        let server = MockServer::start(options, three_rows).await.unwrap();
        let tls = TlsClientConfig::new(TlsMode::Required).with_server_name("localhost");

        let err = Session::open(server.config().with_tls(tls)).await.unwrap_err();
        assert!(matches!(err, ClientError::TlsHandshake(_)));
    }

    #[tokio::test]
    async fn test_plain_auth_refused_without_tls() {
        let server = MockServer::start(MockOptions::default(), three_rows).await.unwrap();
        let config = server.config().with_auth_plugin("plain");

        let err = Session::open(config).await.unwrap_err();
        assert!(matches!(err, ClientError::Authentication(ref m) if m.contains("requires TLS")));
    }

    #[tokio::test]
    async fn test_unadvertised_mechanism_is_rejected() {
        let options = MockOptions {
            auth_mechanisms: vec!["plain".to_string()],
            ..MockOptions::default()
        };
        let server = MockServer::start(options, three_rows).await.unwrap();

        let err = Session::open(server.config()).await.unwrap_err();
        assert!(matches!(err, ClientError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_dump_is_idempotent() {
        let server = MockServer::start(MockOptions::default(), three_rows).await.unwrap();
        let mut session = open(&server).await;

        let mut result = session.execute(&find_users()).await.unwrap();
        result.next().await.unwrap();
        tokio_test::assert_ok!(result.dump().await);
        assert!(result.is_complete());
        tokio_test::assert_ok!(result.dump().await);
        assert!(result.next().await.unwrap().is_none());
        drop(result);

        let mut result = session.execute(&find_users()).await.unwrap();
        assert_eq!(result.buffer_all().await.unwrap(), 3);
        result.dump().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_result_is_dumped_before_next_statement() {
        let server = MockServer::start(MockOptions::default(), three_rows).await.unwrap();
        let mut session = open(&server).await;

        {
            let mut result = session.execute(&find_users()).await.unwrap();
            result.next().await.unwrap();
        }
        assert!(session.has_pending_result());

        let mut result = session.execute(&find_users()).await.unwrap();
        let first = result.next().await.unwrap().unwrap();
        assert_eq!(first.get(0), Some(&Value::Sint(1)));
        assert_eq!(result.fetch_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_value_decode_error_poisons_stream_only() {
        let server = MockServer::start(MockOptions::default(), |stmt: &Statement| {
            if stmt.sql.is_some() {
                return mock::execute_ok(0);
            }
            let mut messages = vec![
                ServerMessage::ColumnMetaData(ColumnMeta::new("id", ColumnType::Sint)),
                ServerMessage::Row(dbwire_protocol::value::encode_row(&[Value::from("abc")])),
            ];
            messages.extend(mock::result_set(&[], &[]));
            messages
        })
        .await
        .unwrap();
        let mut session = open(&server).await;

        let mut result = session.execute(&find_users()).await.unwrap();
        let err = result.next().await.unwrap_err();
        assert!(matches!(err, ClientError::Decode { session_fatal: false, .. }));
        assert!(result.is_poisoned());
        assert!(matches!(
            result.next().await,
            Err(ClientError::StreamPoisoned)
        ));
        result.dump().await.unwrap();
        drop(result);

        assert!(session.is_open());
        session.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_row_closes_session() {
        let server = MockServer::start(MockOptions::default(), |_: &Statement| {
            mock::result_set(
                &[("a", ColumnType::Sint), ("b", ColumnType::Sint)],
                &[vec![Value::Sint(1)]],
            )
        })
        .await
        .unwrap();
        let mut session = open(&server).await;

        let mut result = session.execute(&find_users()).await.unwrap();
        let err = result.next().await.unwrap_err();
        assert!(matches!(err, ClientError::Decode { session_fatal: true, .. }));
        result.dump().await.unwrap();
        drop(result);

        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.execute(&find_users()).await,
            Err(ClientError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_server_error_keeps_session_open() {
        let server = MockServer::start(MockOptions::default(), |stmt: &Statement| {
            if stmt.sql.is_some() {
                mock::execute_ok(0)
            } else {
                mock::server_error(1146u16, "Table 'users' doesn't exist")
            }
        })
        .await
        .unwrap();
        let mut session = open(&server).await;

        let err = session.execute(&find_users()).await.unwrap_err();
        assert_eq!(err.server_code(), Some(ErrorCode(1146)));
        assert!(!err.is_transient());
        assert!(session.is_open());
        assert!(!session.has_pending_result());
        session.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_multiple_result_sets() {
        let server = MockServer::start(MockOptions::default(), |_: &Statement| {
            vec![
                ServerMessage::ColumnMetaData(ColumnMeta::new("a", ColumnType::Sint)),
                ServerMessage::Row(dbwire_protocol::value::encode_row(&[Value::Sint(1)])),
                ServerMessage::FetchDoneMoreResultsets,
                ServerMessage::ColumnMetaData(ColumnMeta::new("b", ColumnType::String)),
                ServerMessage::Row(dbwire_protocol::value::encode_row(&[Value::from("x")])),
                ServerMessage::Row(dbwire_protocol::value::encode_row(&[Value::from("y")])),
                ServerMessage::FetchDone,
                ServerMessage::StmtExecuteOk(dbwire_protocol::ExecuteOk {
                    rows_affected: 0,
                    last_insert_id: Some(42),
                    generated_ids: Vec::new(),
                }),
            ]
        })
        .await
        .unwrap();
        let mut session = open(&server).await;

        let mut result = session.execute(&Statement::sql("CALL two_sets()")).await.unwrap();
        assert_eq!(result.columns()[0].name, "a");
        assert_eq!(result.fetch_all().await.unwrap().len(), 1);

        assert!(result.next_result().await.unwrap());
        assert_eq!(result.columns()[0].name, "b");
        let rows = result.fetch_all().await.unwrap();
        assert_eq!(rows[1].get_str("b"), Some("y"));

        assert!(!result.next_result().await.unwrap());
        assert_eq!(result.last_insert_id(), Some(42));
    }

    #[tokio::test]
    async fn test_large_rows_are_reassembled() {
        let options = MockOptions {
            max_block_size: Some(1024),
            ..MockOptions::default()
        };
        let text = "z".repeat(5000);
        let reply = text.clone();
        let server = MockServer::start(options, move |_: &Statement| {
            mock::result_set(&[("doc", ColumnType::String)], &[vec![Value::from(reply.as_str())]])
        })
        .await
        .unwrap();
        let mut session = open(&server).await;

        let mut result = session.execute(&find_users()).await.unwrap();
        let row = result.next().await.unwrap().unwrap();
        assert_eq!(row.get(0).and_then(Value::as_str), Some(text.as_str()));
    }

    struct CannedUsers;

    impl StatementInterceptor for CannedUsers {
        fn name(&self) -> &str {
            "canned"
        }

        fn try_handle(&self, statement: &Statement, _: &CommandChain) -> Option<ResultSet> {
            if statement.collection.name != "users" {
                return None;
            }
            Some(
                ResultSet::new(vec![ColumnMeta::new("id", ColumnType::Sint)])
                    .with_row(vec![Value::Sint(99)]),
            )
        }
    }

    #[tokio::test]
    async fn test_interceptor_short_circuits_execution() {
        let server = MockServer::start(MockOptions::default(), three_rows).await.unwrap();
        let mut session = Session::builder(server.config().with_command_interceptor("trace"))
            .command_interceptor(CommandInterceptor::custom(CannedUsers))
            .open()
            .await
            .unwrap();

        let mut result = session.execute(&find_users()).await.unwrap();
        let rows = result.fetch_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0), Some(&Value::Sint(99)));
        result.dump().await.unwrap();
        drop(result);

        assert!(server.statements().is_empty());
    }

    struct Relabel;

    impl ErrorTransformer for Relabel {
        fn name(&self) -> &str {
            "relabel"
        }

        fn transform(&self, error: ClientError) -> ClientError {
            match error {
                ClientError::FatalServer(err) => ClientError::Config(err.message),
                other => other,
            }
        }
    }

    #[tokio::test]
    async fn test_exception_interceptor_transforms_server_errors() {
        let server = MockServer::start(MockOptions::default(), |_: &Statement| {
            mock::server_error(1064u16, "syntax")
        })
        .await
        .unwrap();
        let mut session = Session::builder(server.config())
            .exception_interceptor(ExceptionInterceptor::custom(Relabel))
            .open()
            .await
            .unwrap();

        let err = session.execute(&Statement::sql("SELEC")).await.unwrap_err();
        assert!(matches!(err, ClientError::Config(ref m) if m == "syntax"));
    }

    #[tokio::test]
    async fn test_unknown_interceptor_name_fails_open() {
        let server = MockServer::start(MockOptions::default(), three_rows).await.unwrap();
        let config = server.config().with_command_interceptor("nonexistent");
        assert!(matches!(
            Session::open(config).await,
            Err(ClientError::Config(_))
        ));
        assert_eq!(server.connections(), 0);
    }

    #[tokio::test]
    async fn test_execute_with_retry_recovers_from_deadlocks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let server = MockServer::start(MockOptions::default(), move |stmt: &Statement| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                mock::server_error(ErrorCode::DEADLOCK, "Deadlock found")
            } else {
                three_rows(stmt)
            }
        })
        .await
        .unwrap();
        let mut session = open(&server).await;

        let mut policy = BackoffPolicy::default().with_algorithm(
            ErrorCode::DEADLOCK,
            Backoff::Exponential(BackoffAlgorithm::new(3, Duration::from_millis(1))),
        );
        let mut result = session
            .execute_with_retry(&find_users(), &mut policy)
            .await
            .unwrap();
        assert_eq!(result.fetch_all().await.unwrap().len(), 3);
        drop(result);

        let stats = policy.stats();
        assert_eq!(stats.delay_requests, 2);
        assert_eq!(stats.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct MaskDeadlocks;

    impl ErrorTransformer for MaskDeadlocks {
        fn name(&self) -> &str {
            "mask-deadlocks"
        }

        fn transform(&self, error: ClientError) -> ClientError {
            match error {
                ClientError::TransientServer(err) => ClientError::FatalServer(
                    dbwire_protocol::ServerError::new(1064u16, err.message),
                ),
                other => other,
            }
        }
    }

    #[tokio::test]
    async fn test_retry_sees_server_code_before_exception_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let server = MockServer::start(MockOptions::default(), move |stmt: &Statement| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                mock::server_error(ErrorCode::DEADLOCK, "Deadlock found")
            } else {
                three_rows(stmt)
            }
        })
        .await
        .unwrap();
        let mut session = Session::builder(server.config())
            .exception_interceptor(ExceptionInterceptor::custom(MaskDeadlocks))
            .open()
            .await
            .unwrap();

        let mut policy = BackoffPolicy::default().with_algorithm(
            ErrorCode::DEADLOCK,
            Backoff::Exponential(BackoffAlgorithm::new(3, Duration::from_millis(1))),
        );
        let mut result = session
            .execute_with_retry(&find_users(), &mut policy)
            .await
            .unwrap();
        assert_eq!(result.fetch_all().await.unwrap().len(), 3);
        drop(result);
        assert_eq!(policy.stats().delay_requests, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retry_returns_transformed_error() {
        let server = MockServer::start(MockOptions::default(), |_: &Statement| {
            mock::server_error(ErrorCode::DEADLOCK, "Deadlock found")
        })
        .await
        .unwrap();
        let mut session = Session::builder(server.config())
            .exception_interceptor(ExceptionInterceptor::custom(MaskDeadlocks))
            .open()
            .await
            .unwrap();

        let mut policy = BackoffPolicy::default().with_algorithm(
            ErrorCode::DEADLOCK,
            Backoff::Exponential(BackoffAlgorithm::new(1, Duration::from_millis(1))),
        );
        let err = session
            .execute_with_retry(&find_users(), &mut policy)
            .await
            .unwrap_err();
        assert_eq!(err.server_code(), Some(ErrorCode::from(1064u16)));
        assert_eq!(policy.stats().delay_requests, 2);
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_oversized_statement_keeps_session_open() {
        let options = MockOptions {
            max_block_size: Some(1024),
            ..MockOptions::default()
        };
        let server = MockServer::start(options, three_rows).await.unwrap();
        let mut session = open(&server).await;

        let huge = Statement::sql(format!("SELECT '{}'", "x".repeat(4096)));
        let err = session.execute(&huge).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Encode(dbwire_protocol::ProtocolError::FrameTooLarge { max: 1024, .. })
        ));
        assert!(session.is_open());
        assert!(!session.has_pending_result());

        let mut result = session.execute(&find_users()).await.unwrap();
        assert_eq!(result.fetch_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = MockServer::start(MockOptions::default(), three_rows).await.unwrap();
        let mut session = open(&server).await;

        tokio_test::assert_ok!(session.close().await);
        assert_eq!(session.state(), SessionState::Closed);
        tokio_test::assert_ok!(session.close().await);
        assert!(session.peer().is_none());
        assert!(matches!(
            session.ping().await,
            Err(ClientError::InvalidState {
                actual: SessionState::Closed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = Session::open(ConnectionConfig::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(err.is_connection_error());
    }
}
