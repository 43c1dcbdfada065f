//! Yamux over plain TCP.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_yamux::{Config, Control, Session, StreamHandle};

use crate::edgetun::net;
use crate::edgetun::tunnel::transport::{
    BoxedStream, Transport, TransportDialOptions, TransportListenOptions, TransportListener,
    TransportSession,
};

const ACCEPT_BACKLOG: usize = 64;

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        addr: &str,
        _opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind_addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind tcp {addr}"))?;
        Ok(Box::new(YamuxListener { ln }))
    }

    async fn dial(
        &self,
        addr: &str,
        _opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let c = TcpStream::connect(addr.trim())
            .await
            .with_context(|| format!("dial tcp {addr}"))?;
        c.set_nodelay(true)?;
        Ok(Arc::new(YamuxSession::start(c, Side::Client)))
    }
}

struct YamuxListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for YamuxListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let (c, _) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        Ok(Arc::new(YamuxSession::start(c, Side::Server)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// One yamux connection. The client opens streams, the edge accepts them;
/// both sides share the same driver.
struct YamuxSession {
    control: Mutex<Control>,
    accepted: Mutex<mpsc::Receiver<StreamHandle>>,
    dead: Arc<AtomicBool>,
    remote: Option<SocketAddr>,
    driver: JoinHandle<()>,
}

impl YamuxSession {
    fn start(c: TcpStream, side: Side) -> Self {
        let remote = c.peer_addr().ok();
        let mut session = match side {
            Side::Client => Session::new_client(c, Config::default()),
            Side::Server => Session::new_server(c, Config::default()),
        };
        let control = session.control();
        let dead = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
        let driver = tokio::spawn(drive(session, tx, dead.clone(), remote));

        Self {
            control: Mutex::new(control),
            accepted: Mutex::new(rx),
            dead,
            remote,
            driver,
        }
    }
}

/// Polls the session until the connection fails. Inbound streams are only
/// expected on the edge side; a client drops what the edge never sends.
async fn drive(
    mut session: Session<TcpStream>,
    accepted: mpsc::Sender<StreamHandle>,
    dead: Arc<AtomicBool>,
    remote: Option<SocketAddr>,
) {
    loop {
        match session.next().await {
            Some(Ok(st)) => {
                if accepted.send(st).await.is_err() {
                    break;
                }
            }
            Some(Err(err)) => {
                tracing::debug!(remote = ?remote, err = %err, "yamux: session failed");
                break;
            }
            None => break,
        }
    }
    dead.store(true, Ordering::Release);
}

#[async_trait]
impl TransportSession for YamuxSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        if self.is_closed() {
            anyhow::bail!("yamux: session closed");
        }
        let st = self.control.lock().await.open_stream().await?;
        Ok(Box::new(st))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        let st = self
            .accepted
            .lock()
            .await
            .recv()
            .await
            .context("yamux: session closed")?;
        Ok(Box::new(st))
    }

    async fn close(&self) {
        self.dead.store(true, Ordering::Release);
        self.control.lock().await.close().await;
        self.driver.abort();
    }

    fn is_closed(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}
