//! In-process mock server for tests.
//!
//! Speaks the handshake and answers each statement through a responder
//! closure. TLS upgrades are accepted only when a [`MockIdentity`] is set.

use crate::auth::{password_hash, verify_scramble, BaselineAuth, PlainAuth};
use crate::config::{ConnectionConfig, TlsClientConfig, TlsMode};
use dbwire_protocol::value::encode_row;
use dbwire_protocol::{
    AuthContinue, Capabilities, ClientMessage, ColumnMeta, ColumnType, Decoder, Encoder,
    ErrorCode, ExecuteOk, ServerError, ServerMessage, Statement, Value, DEFAULT_MAX_BLOCK_SIZE,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

/// Nonce sent as the authentication challenge.
pub const MOCK_NONCE: &[u8] = b"mock-nonce-0123456789";

type Responder = Arc<dyn Fn(&Statement) -> Vec<ServerMessage> + Send + Sync>;

/// PEM-encoded certificate chain and private key the server presents.
#[derive(Debug, Clone)]
pub struct MockIdentity {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Mock server behavior.
#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Advertise TLS support. Upgrade requests still fail without an identity.
    pub tls: bool,
    /// Certificate used to accept TLS upgrades. Implies `tls`.
    pub tls_identity: Option<MockIdentity>,
    pub auth_mechanisms: Vec<String>,
    pub user: String,
    pub password: String,
    /// Reject every authentication attempt.
    pub reject_auth: bool,
    /// Answer the client's response with another challenge.
    pub extra_challenge: bool,
    pub max_block_size: Option<usize>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            tls: false,
            tls_identity: None,
            auth_mechanisms: vec![BaselineAuth::NAME.to_string(), PlainAuth::NAME.to_string()],
            user: "app".to_string(),
            password: "secret".to_string(),
            reject_auth: false,
            extra_challenge: false,
            max_block_size: None,
        }
    }
}

struct Shared {
    options: MockOptions,
    acceptor: Option<TlsAcceptor>,
    responder: Responder,
    connections: AtomicUsize,
    statements: Mutex<Vec<Statement>>,
}

/// A running mock server. Stops accepting when dropped.
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl MockServer {
    /// Starts a server on an ephemeral port.
    pub async fn start<F>(options: MockOptions, responder: F) -> io::Result<Self>
    where
        F: Fn(&Statement) -> Vec<ServerMessage> + Send + Sync + 'static,
    {
        Self::start_at("127.0.0.1:0".parse().map_err(io::Error::other)?, options, responder).await
    }

    /// Starts a server on `addr`.
    pub async fn start_at<F>(addr: SocketAddr, options: MockOptions, responder: F) -> io::Result<Self>
    where
        F: Fn(&Statement) -> Vec<ServerMessage> + Send + Sync + 'static,
    {
        let acceptor = options.tls_identity.as_ref().map(tls_acceptor).transpose()?;
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            options,
            acceptor,
            responder: Arc::new(responder),
            connections: AtomicUsize::new(0),
            statements: Mutex::new(Vec::new()),
        });

        let accept_shared = shared.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                let conn_shared = accept_shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, conn_shared).await {
                        tracing::debug!(error = %e, "Mock connection ended");
                    }
                });
            }
        });

        Ok(Self {
            addr,
            shared,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connection config with the server's credentials and TLS disabled.
    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", self.port())
            .with_credentials(&self.shared.options.user, &self.shared.options.password)
            .with_tls(TlsClientConfig::new(TlsMode::Disabled))
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Statements received so far, in order.
    pub fn statements(&self) -> Vec<Statement> {
        self.shared
            .statements
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Messages for a single result set followed by completion.
pub fn result_set(columns: &[(&str, ColumnType)], rows: &[Vec<Value>]) -> Vec<ServerMessage> {
    let mut messages: Vec<ServerMessage> = columns
        .iter()
        .map(|(name, ty)| ServerMessage::ColumnMetaData(ColumnMeta::new(*name, *ty)))
        .collect();
    messages.extend(rows.iter().map(|row| ServerMessage::Row(encode_row(row))));
    messages.push(ServerMessage::FetchDone);
    messages.push(ServerMessage::StmtExecuteOk(ExecuteOk::default()));
    messages
}

/// Completion of a statement that returns no rows.
pub fn execute_ok(rows_affected: u64) -> Vec<ServerMessage> {
    vec![ServerMessage::StmtExecuteOk(ExecuteOk {
        rows_affected,
        ..ExecuteOk::default()
    })]
}

/// A server error response.
pub fn server_error(code: impl Into<ErrorCode>, message: &str) -> Vec<ServerMessage> {
    vec![ServerMessage::Error(ServerError::new(code, message))]
}

enum Outcome {
    Closed,
    StartTls,
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) -> io::Result<()> {
    if let Outcome::Closed = converse(&mut stream, &shared, shared.acceptor.is_some()).await? {
        return Ok(());
    }
    let Some(acceptor) = shared.acceptor.clone() else {
        return Ok(());
    };
    let mut tls = acceptor.accept(stream).await?;
    converse(&mut tls, &shared, false).await?;
    Ok(())
}

/// Answers client messages until the client leaves or TLS is agreed.
async fn converse<S>(stream: &mut S, shared: &Shared, can_upgrade: bool) -> io::Result<Outcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let options = &shared.options;
    let block_size = options.max_block_size.unwrap_or(DEFAULT_MAX_BLOCK_SIZE);
    let mut decoder = Decoder::with_max_block_size(block_size);
    let mut buf = vec![0u8; 8192];
    let mut mechanism = String::new();

    loop {
        let msg = loop {
            match decoder.decode_client().map_err(io::Error::other)? {
                Some(msg) => break msg,
                None => {
                    let n = stream.read(&mut buf).await?;
                    if n == 0 {
                        return Ok(Outcome::Closed);
                    }
                    decoder.extend(&buf[..n]);
                }
            }
        };

        let mut upgrade = false;
        let replies = match msg {
            ClientMessage::CapabilitiesGet => vec![ServerMessage::Capabilities(Capabilities {
                tls: options.tls || options.tls_identity.is_some(),
                auth_mechanisms: options.auth_mechanisms.clone(),
                max_block_size: options.max_block_size,
                ..Capabilities::default()
            })],
            ClientMessage::CapabilitiesSet(caps) if caps.tls && can_upgrade => {
                upgrade = true;
                vec![ServerMessage::Ok(None)]
            }
            ClientMessage::CapabilitiesSet(_) => {
                server_error(5001u16, "TLS is not available on this server")
            }
            ClientMessage::AuthStart(start) => {
                mechanism = start.mech_name;
                vec![challenge()]
            }
            ClientMessage::AuthContinue(response) => {
                if options.extra_challenge {
                    vec![challenge()]
                } else if options.reject_auth || !accepts(options, &mechanism, &response.auth_data)
                {
                    let mut err = ServerError::new(ErrorCode::ACCESS_DENIED, "Access denied");
                    err.fatal = true;
                    vec![ServerMessage::Error(err)]
                } else {
                    vec![ServerMessage::AuthOk]
                }
            }
            ClientMessage::Execute(statement) => {
                let replies = (shared.responder)(&statement);
                if let Ok(mut received) = shared.statements.lock() {
                    received.push(*statement);
                }
                replies
            }
            ClientMessage::SessionClose | ClientMessage::SessionReset => {
                vec![ServerMessage::Ok(None)]
            }
            ClientMessage::ConnectionClose => return Ok(Outcome::Closed),
        };

        for reply in &replies {
            let encoded = Encoder::encode_server(reply, block_size).map_err(io::Error::other)?;
            stream.write_all(&encoded).await?;
        }
        stream.flush().await?;
        if upgrade {
            return Ok(Outcome::StartTls);
        }
    }
}

fn tls_acceptor(identity: &MockIdentity) -> io::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut identity.cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut identity.key_pem.as_bytes())?
        .ok_or_else(|| io::Error::other("no private key in PEM"))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(io::Error::other)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn challenge() -> ServerMessage {
    ServerMessage::AuthContinue(AuthContinue {
        auth_data: MOCK_NONCE.to_vec(),
    })
}

fn accepts(options: &MockOptions, mechanism: &str, data: &[u8]) -> bool {
    let mut parts = data.splitn(3, |b| *b == 0);
    let (_database, user, secret) = match (parts.next(), parts.next(), parts.next()) {
        (Some(d), Some(u), Some(s)) => (d, u, s),
        _ => return false,
    };
    if user != options.user.as_bytes() {
        return false;
    }

    match mechanism {
        BaselineAuth::NAME if options.password.is_empty() => secret.is_empty(),
        BaselineAuth::NAME => hex::decode(secret).is_ok_and(|scrambled| {
            verify_scramble(&password_hash(&options.password), MOCK_NONCE, &scrambled)
        }),
        PlainAuth::NAME => secret == options.password.as_bytes(),
        _ => false,
    }
}
