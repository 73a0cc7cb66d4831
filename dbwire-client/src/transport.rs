//! Frame transport over TCP or TLS.
//!
//! A [`Transport`] owns the socket and the frame decoder. Reads reassemble
//! chunked messages; writes never chunk.

use crate::config::ConnectionConfig;
use crate::config::TlsClientConfig;
use crate::error::ClientError;
use crate::tls;
use bytes::{BufMut, BytesMut};
use dbwire_protocol::{
    ClientMessage, Decoder, Frame, ProtocolError, ServerMessage, FRAME_HEADER_SIZE,
};
use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio_rustls::client::TlsStream;

pin_project! {
    /// The byte stream under a transport: plain TCP, or TLS after an upgrade.
    #[project = ClientStreamProj]
    pub enum ClientStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl ClientStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls { .. })
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            ClientStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_flush(cx),
            ClientStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            ClientStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            ClientStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}

/// A framed connection to one server.
pub struct Transport {
    stream: ClientStream,
    decoder: Decoder,
    read_buf: Vec<u8>,
    peer: SocketAddr,
    host: String,
    read_timeout: Duration,
}

impl Transport {
    /// Connects to the server named by `config`.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, ClientError> {
        let (tcp, peer) = open_tcp(&config.host, config.port, config.connect_timeout).await?;
        tracing::debug!(peer = %peer, "TCP connected");

        Ok(Self {
            stream: ClientStream::Plain { stream: tcp },
            decoder: Decoder::new(),
            read_buf: vec![0u8; config.read_buffer_size],
            peer,
            host: config.host.clone(),
            read_timeout: config.command_timeout,
        })
    }

    /// Checks that a TCP connection to `host:port` can be established.
    pub async fn probe(host: &str, port: u16, timeout: Duration) -> Result<(), ClientError> {
        let (tcp, _) = open_tcp(host, port, timeout).await?;
        drop(tcp);
        Ok(())
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    pub fn max_block_size(&self) -> usize {
        self.decoder.max_block_size()
    }

    /// Applies the block size advertised by the server.
    pub fn set_max_block_size(&mut self, size: usize) {
        tracing::debug!(size, "Max block size negotiated");
        self.decoder.set_max_block_size(size);
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Reads one logical (reassembled) frame.
    pub async fn read_frame(&mut self) -> Result<Frame, ClientError> {
        let peer = self.peer;
        tokio::time::timeout(self.read_timeout, self.fill_frame())
            .await
            .map_err(|_| {
                tracing::debug!(peer = %peer, "Read timeout");
                ClientError::Timeout
            })?
    }

    async fn fill_frame(&mut self) -> Result<Frame, ClientError> {
        loop {
            if let Some(frame) = self.decoder.decode_frame()? {
                return Ok(frame);
            }

            let n = self.stream.read(&mut self.read_buf).await?;
            if n == 0 {
                if self.decoder.is_mid_frame() {
                    let buffered = self.decoder.buffered();
                    tracing::debug!(buffered, "Stream closed mid-frame");
                    return Err(ClientError::TruncatedStream { buffered });
                }
                return Err(ClientError::ConnectionClosed);
            }
            self.decoder.extend(&self.read_buf[..n]);
        }
    }

    /// Reads and parses one server message.
    pub async fn read_message(&mut self) -> Result<ServerMessage, ClientError> {
        let frame = self.read_frame().await?;
        Ok(ServerMessage::from_frame(frame)?)
    }

    /// Writes a single physical frame.
    pub async fn write_frame(&mut self, msg_type: u8, payload: &[u8]) -> Result<(), ClientError> {
        let max = self.decoder.max_block_size();
        if payload.len() >= max {
            return Err(ClientError::Encode(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max,
            }));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u32_le(payload.len() as u32);
        buf.put_u8(msg_type);
        buf.put_slice(payload);

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Encodes and writes a client message.
    pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        let frame = msg.to_frame().map_err(ClientError::Encode)?;
        tracing::trace!(msg_type = ?msg.msg_type(), len = frame.payload.len(), "Sending");
        self.write_frame(frame.msg_type, &frame.payload).await
    }

    /// Replaces the plain stream with a TLS stream.
    ///
    /// Bytes buffered from the plain stream are discarded.
    pub async fn upgrade_to_tls(self, config: &TlsClientConfig) -> Result<Self, ClientError> {
        let Transport {
            stream,
            mut decoder,
            read_buf,
            peer,
            host,
            read_timeout,
        } = self;

        let tcp = match stream {
            ClientStream::Plain { stream } => stream,
            ClientStream::Tls { .. } => {
                return Err(ClientError::TlsConfig(
                    "transport is already encrypted".to_string(),
                ))
            }
        };

        if decoder.buffered() > 0 {
            tracing::debug!(bytes = decoder.buffered(), "Discarding plaintext bytes");
        }
        decoder.clear();

        let tls_stream = tls::upgrade(tcp, config, &host).await?;
        Ok(Self {
            stream: ClientStream::Tls { stream: tls_stream },
            decoder,
            read_buf,
            peer,
            host,
            read_timeout,
        })
    }

    /// Shuts down the write side of the stream.
    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Resolves `host` and connects to the first candidate that accepts.
///
/// A refused connection moves on to the next candidate; any other error
/// aborts.
async fn open_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<(TcpStream, SocketAddr), ClientError> {
    let address = format!("{}:{}", host, port);
    let connect_err = |message: String| ClientError::Connect {
        address: address.clone(),
        message,
    };

    let attempt = async {
        let candidates: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| connect_err(format!("cannot resolve: {}", e)))?
            .collect();

        let mut last_refusal = None;
        for candidate in candidates {
            match TcpStream::connect(candidate).await {
                Ok(tcp) => {
                    tcp.set_nodelay(true).ok();
                    return Ok((tcp, candidate));
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    tracing::debug!(candidate = %candidate, "Connection refused, trying next");
                    last_refusal = Some(e);
                }
                Err(e) => return Err(connect_err(e.to_string())),
            }
        }

        Err(connect_err(match last_refusal {
            Some(e) => e.to_string(),
            None => "no addresses resolved".to_string(),
        }))
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| ClientError::Timeout)?
}
