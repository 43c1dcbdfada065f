//! WebSocket carriage for tunnel streams.
//!
//! The client dials through the CDN: TCP goes to the `cdn_ip` override when
//! one is set, while `Host` and SNI keep the tunnel hostname. Binary
//! messages are exposed as a plain byte stream on both ends.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use anyhow::Context as _;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures_util::{Sink, Stream};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        self, Message,
        handshake::client::generate_key,
        handshake::server::{ErrorResponse, Request, Response},
        http,
    },
};

use crate::edgetun::net;
use crate::edgetun::tunnel::protocol::Metadata;
use crate::edgetun::tunnel::transport::{BoxedStream, Establisher, tls};

#[derive(Debug, Clone)]
pub struct WsOptions {
    /// `host[:port][/path]`, with or without a `ws://`/`wss://` scheme.
    pub url: String,
    pub tls: bool,
    pub cdn_ip: String,
    pub cdn_port: u16,
    pub server_name: String,
    pub insecure_skip_verify: bool,
    pub headers: Vec<(String, String)>,
    pub dial_timeout: Duration,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            tls: true,
            cdn_ip: String::new(),
            cdn_port: 443,
            server_name: String::new(),
            insecure_skip_verify: false,
            headers: Vec::new(),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WsTarget {
    host: String,
    port: u16,
    path: String,
}

impl WsTarget {
    fn parse(url: &str, default_port: u16) -> anyhow::Result<Self> {
        let mut rest = url.trim();
        for scheme in ["wss://", "ws://", "https://", "http://"] {
            if let Some(r) = rest.strip_prefix(scheme) {
                rest = r;
                break;
            }
        }
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            anyhow::bail!("ws: url {url:?} has no host");
        }
        let (host, port) = match net::split_host_port(authority) {
            Some((h, p)) => (h.to_string(), p),
            None => (authority.to_string(), default_port),
        };
        Ok(Self {
            host,
            port,
            path: path.to_string(),
        })
    }

    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Establishes one websocket per stream.
pub struct WsEstablisher {
    opts: WsOptions,
    target: WsTarget,
    connector: Option<tokio_rustls::TlsConnector>,
}

impl WsEstablisher {
    pub fn new(opts: WsOptions) -> anyhow::Result<Self> {
        let target = WsTarget::parse(&opts.url, opts.cdn_port)?;
        let connector = if opts.tls {
            let cfg = tls::client_crypto_config(
                opts.insecure_skip_verify,
                vec![b"http/1.1".to_vec()],
            )?;
            Some(tokio_rustls::TlsConnector::from(Arc::new(cfg)))
        } else {
            None
        };
        Ok(Self {
            opts,
            target,
            connector,
        })
    }

    fn dial_addr(&self) -> String {
        let ip = self.opts.cdn_ip.trim();
        if ip.is_empty() {
            return self.target.authority();
        }
        if ip.contains(':') && !ip.starts_with('[') {
            format!("[{ip}]:{}", self.opts.cdn_port)
        } else {
            format!("{ip}:{}", self.opts.cdn_port)
        }
    }

    fn request(&self) -> anyhow::Result<http::Request<()>> {
        let scheme = if self.opts.tls { "wss" } else { "ws" };
        let uri = format!("{scheme}://{}{}", self.target.authority(), self.target.path);
        let mut builder = http::Request::builder()
            .uri(uri)
            .header("Host", self.target.host.as_str())
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key());
        for (k, v) in &self.opts.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        Ok(builder.body(())?)
    }

    async fn connect(&self) -> anyhow::Result<BoxedStream> {
        let addr = self.dial_addr();
        let tcp = TcpStream::connect(addr.as_str())
            .await
            .with_context(|| format!("ws: connect {addr}"))?;
        tcp.set_nodelay(true)?;

        let io: BoxedStream = match &self.connector {
            Some(connector) => {
                let name = if self.opts.server_name.trim().is_empty() {
                    self.target.host.as_str()
                } else {
                    self.opts.server_name.as_str()
                };
                let tls = connector
                    .connect(tls::server_name(name)?, tcp)
                    .await
                    .with_context(|| format!("ws: tls handshake with {name}"))?;
                Box::new(tls)
            }
            None => Box::new(tcp),
        };

        let (ws, _resp) = tokio_tungstenite::client_async(self.request()?, io)
            .await
            .context("ws: upgrade")?;
        Ok(Box::new(WsStream::new(ws)))
    }
}

#[async_trait]
impl Establisher for WsEstablisher {
    fn name(&self) -> &'static str {
        if self.opts.tls { "wss" } else { "ws" }
    }

    async fn establish(&self) -> anyhow::Result<BoxedStream> {
        tokio::time::timeout(self.opts.dial_timeout, self.connect())
            .await
            .with_context(|| format!("ws: dial {}: timeout", self.dial_addr()))?
    }
}

/// Accepts websocket upgrades on a plain TCP listener.
pub struct WsListener {
    ln: TcpListener,
}

impl WsListener {
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let bind_addr = net::normalize_bind_addr(addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind ws {addr}"))?;
        Ok(Self { ln })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (c, peer) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        Ok((c, peer))
    }
}

/// Completes the server side of the upgrade. The request headers come back
/// as `HttpHeader:<name>` metadata.
pub async fn upgrade(stream: TcpStream) -> anyhow::Result<(BoxedStream, Vec<Metadata>)> {
    let mut metadata = Vec::new();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        metadata = req
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                let v = v.to_str().ok()?;
                Some(Metadata::new(format!("HttpHeader:{}", k.as_str()), v))
            })
            .collect();
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .context("ws: accept upgrade")?;
    Ok((Box::new(WsStream::new(ws)), metadata))
}

/// Byte-stream view of a websocket.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buf: BytesMut,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: BytesMut::new(),
        }
    }
}

fn ws_io_error(err: tungstenite::Error) -> io::Error {
    match err {
        tungstenite::Error::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf[..n]);
                self.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                ))) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(ws_io_error(e))),
                Poll::Ready(Some(Ok(msg))) => match msg {
                    Message::Binary(data) => self.read_buf.extend_from_slice(&data),
                    Message::Text(text) => self.read_buf.extend_from_slice(text.as_bytes()),
                    Message::Close(_) => return Poll::Ready(Ok(())),
                    // Pongs are queued by tungstenite itself.
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                },
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(ws_io_error(e))),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(data.to_vec()))
            .map_err(ws_io_error)?;
        // Push the frame out opportunistically; poll_flush finishes the job.
        if let Poll::Ready(Err(e)) = Pin::new(&mut self.inner).poll_flush(cx) {
            return Poll::Ready(Err(ws_io_error(e)));
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.inner).poll_close(cx) {
            Poll::Ready(Err(
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
            )) => Poll::Ready(Ok(())),
            other => other.map_err(ws_io_error),
        }
    }
}
