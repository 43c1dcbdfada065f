//! QUIC: every tunnel stream is one bidirectional QUIC stream.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, SendStream, ServerConfig, TransportConfig};

use crate::edgetun::net;
use crate::edgetun::tunnel::transport::{
    BoxedStream, QuicDialOptions, QuicListenOptions, Transport, TransportDialOptions,
    TransportListenOptions, TransportListener, TransportSession, default_alpn, tls,
};

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const KEEP_ALIVE: Duration = Duration::from_secs(20);

pub struct QuicTransport;

impl QuicTransport {
    pub fn new() -> Self {
        Self
    }
}

fn transport_config() -> anyhow::Result<Arc<TransportConfig>> {
    let mut cfg = TransportConfig::default();
    cfg.max_idle_timeout(Some(IDLE_TIMEOUT.try_into()?));
    cfg.keep_alive_interval(Some(KEEP_ALIVE));
    Ok(Arc::new(cfg))
}

/// The edge name to verify against: the configured name, else the dialled host.
fn verify_name(server_name: &str, addr: &str) -> String {
    let name = server_name.trim();
    if !name.is_empty() {
        return name.to_string();
    }
    net::split_host_port(addr)
        .map(|(h, _)| h.to_string())
        .unwrap_or_else(|| "localhost".to_string())
}

#[async_trait]
impl Transport for QuicTransport {
    fn name(&self) -> &'static str {
        "quic"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let bind: SocketAddr = net::normalize_bind_addr(addr)
            .parse()
            .with_context(|| format!("quic: bad listen address {addr:?}"))?;
        let QuicListenOptions { cert_file, key_file, next_protos: alpn } = &opts.quic;
        let (cert_chain, key) = tls::load_or_generate_cert(cert_file, key_file)?;
        let crypto = tls::server_crypto_config(cert_chain, key, default_alpn(alpn))?;
        let mut server_cfg = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(crypto)?,
        ));
        server_cfg.transport_config(transport_config()?);

        let endpoint =
            Endpoint::server(server_cfg, bind).with_context(|| format!("quic: bind {addr}"))?;
        Ok(Box::new(QuicListener { endpoint }))
    }

    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let quic: &QuicDialOptions = &opts.quic;
        let crypto = tls::client_crypto_config(quic.insecure_skip_verify, default_alpn(&quic.next_protos))?;
        let mut client_cfg = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)?,
        ));
        client_cfg.transport_config(transport_config()?);

        let remote = net::resolve_socket_addr(addr).await?;
        let local = if remote.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let mut endpoint = Endpoint::client(local)?;
        endpoint.set_default_client_config(client_cfg);

        let conn = endpoint
            .connect(remote, &verify_name(&quic.server_name, addr))?
            .await
            .with_context(|| format!("quic: handshake with {addr}"))?;
        Ok(Arc::new(QuicSession {
            conn,
            _endpoint: Some(endpoint),
        }))
    }
}

struct QuicListener {
    endpoint: Endpoint,
}

#[async_trait]
impl TransportListener for QuicListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .context("quic: endpoint closed")?;
        let conn = incoming.await.context("quic: handshake")?;
        Ok(Arc::new(QuicSession {
            conn,
            _endpoint: None,
        }))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.endpoint.close(0u32.into(), b"shutdown");
        Ok(())
    }
}

struct QuicSession {
    conn: Connection,
    // A client endpoint is dropped with its only connection.
    _endpoint: Option<Endpoint>,
}

fn join_bi((send, recv): (SendStream, RecvStream)) -> BoxedStream {
    Box::new(tokio::io::join(recv, send))
}

#[async_trait]
impl TransportSession for QuicSession {
    async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
        Ok(join_bi(self.conn.open_bi().await?))
    }

    async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
        Ok(join_bi(self.conn.accept_bi().await?))
    }

    async fn close(&self) {
        self.conn.close(0u32.into(), b"closed");
    }

    fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.conn.remote_address())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn verify_name_prefers_the_configured_name() {
        assert_eq!(verify_name(" edge.example.com ", "10.0.0.1:443"), "edge.example.com");
        assert_eq!(verify_name("", "edge.example.com:443"), "edge.example.com");
        assert_eq!(verify_name("", "garbage"), "localhost");
    }

    #[tokio::test]
    async fn bidirectional_streams_and_close() {
        let t = QuicTransport::new();
        let ln = t
            .listen("127.0.0.1:0", TransportListenOptions::default())
            .await
            .unwrap();
        let addr = ln.local_addr().unwrap();
        let opts = TransportDialOptions {
            quic: QuicDialOptions {
                server_name: "localhost".into(),
                insecure_skip_verify: true,
                next_protos: vec![],
            },
        };
        let addr_str = addr.to_string();
        let (client, server) = tokio::join!(t.dial(&addr_str, opts), ln.accept());
        let (client, server) = (client.unwrap(), server.unwrap());

        let mut c = client.open_stream().await.unwrap();
        c.write_all(b"ping").await.unwrap();
        let mut s = server.accept_stream().await.unwrap();
        let mut got = [0u8; 4];
        s.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");
        s.write_all(b"pong").await.unwrap();
        c.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");

        client.close().await;
        assert!(client.is_closed());
    }
}
