use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;

use crate::edgetun::tunnel::protocol::{self, ConnectRequest};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

#[derive(Debug, Clone, Default)]
pub struct QuicListenOptions {
    pub cert_file: String,
    pub key_file: String,
    pub next_protos: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct QuicDialOptions {
    pub server_name: String,
    pub insecure_skip_verify: bool,
    pub next_protos: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct TransportListenOptions {
    pub quic: QuicListenOptions,
}

#[derive(Debug, Clone, Default)]
pub struct TransportDialOptions {
    pub quic: QuicDialOptions,
}

/// A transport that carries many streams over one session (QUIC, yamux over TCP).
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn accept_stream(&self) -> anyhow::Result<BoxedStream>;
    async fn close(&self);
    fn is_closed(&self) -> bool;
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// The client-side "establish transport" primitive: yields one fresh
/// full-duplex stream to the edge, ready for a flow header.
#[async_trait]
pub trait Establisher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn establish(&self) -> anyhow::Result<BoxedStream>;
}

/// Edge endpoint transports.
pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "quic" | "ws" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|quic|ws)"),
    }
}

pub fn default_alpn(next: &[Vec<u8>]) -> Vec<Vec<u8>> {
    if !next.is_empty() {
        return next.to_vec();
    }
    vec![b"edgetun".to_vec()]
}

pub mod quic;
pub mod tcp;
pub mod tls;
pub mod ws;

/// Session-oriented transports only; `ws` has its own listener and establisher.
pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        "quic" => Ok(Arc::new(quic::QuicTransport::new())),
        other => anyhow::bail!("tunnel: transport {other:?} is not session-oriented"),
    }
}

/// Establishes streams over one shared session, re-dialling the session
/// lazily once it has died. Every stream opens with the edge connect
/// handshake.
pub struct SessionEstablisher {
    transport: Arc<dyn Transport>,
    addr: String,
    opts: TransportDialOptions,
    dial_timeout: Duration,
    session: tokio::sync::Mutex<Option<Arc<dyn TransportSession>>>,
}

impl SessionEstablisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        addr: impl Into<String>,
        opts: TransportDialOptions,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            addr: addr.into(),
            opts,
            dial_timeout,
            session: tokio::sync::Mutex::new(None),
        }
    }

    async fn session(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let mut cur = self.session.lock().await;
        if let Some(s) = cur.as_ref() {
            if !s.is_closed() {
                return Ok(s.clone());
            }
        }
        if let Some(dead) = cur.take() {
            dead.close().await;
        }

        let s = tokio::time::timeout(
            self.dial_timeout,
            self.transport.dial(&self.addr, self.opts.clone()),
        )
        .await
        .with_context(|| format!("dial {} {}: timeout", self.transport.name(), self.addr))??;

        tracing::info!(
            transport = %self.transport.name(),
            server = %self.addr,
            "transport: session established"
        );
        *cur = Some(s.clone());
        Ok(s)
    }

    async fn invalidate(&self, sess: &Arc<dyn TransportSession>) {
        let mut cur = self.session.lock().await;
        if cur.as_ref().is_some_and(|s| Arc::ptr_eq(s, sess)) {
            cur.take();
            sess.close().await;
        }
    }
}

#[async_trait]
impl Establisher for SessionEstablisher {
    fn name(&self) -> &'static str {
        self.transport.name()
    }

    async fn establish(&self) -> anyhow::Result<BoxedStream> {
        let sess = self.session().await?;
        let mut st = match sess.open_stream().await {
            Ok(st) => st,
            Err(err) => {
                self.invalidate(&sess).await;
                return Err(err.context("open stream"));
            }
        };

        let key = generate_key();
        let handshake = async {
            protocol::write_connect_request(&mut st, &ConnectRequest::websocket(&key)).await?;
            protocol::read_connect_response(&mut st, &key).await
        };
        tokio::time::timeout(self.dial_timeout, handshake)
            .await
            .context("edge handshake: timeout")?
            .context("edge handshake")?;
        Ok(st)
    }
}
