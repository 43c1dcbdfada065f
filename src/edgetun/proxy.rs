//! Client-side local listeners.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::watch,
};

use crate::edgetun::{
    net,
    telemetry::{FlowGuard, FlowKind, SharedFlows},
    tunnel::{
        buffer::BufferPool,
        flow::{FlowMetadata, Network},
        pool::Pool,
        relay::TcpConnector,
        udp::{SessionTable, SessionTableOptions},
    },
};

/// Shared by every client listener.
#[derive(Clone)]
pub struct ClientContext {
    pub pool: Arc<Pool>,
    pub tcp_buffers: Arc<BufferPool>,
    pub udp_buffers: Arc<BufferPool>,
    pub flows: SharedFlows,
}

pub async fn serve_tcp_with_shutdown(
    listen_addr: &str,
    remote: SocketAddr,
    ctx: ClientContext,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))?;
    tracing::info!(listen_addr = %listen_addr, remote = %remote, "tcp: listening");
    serve_tcp_listener(ln, remote, ctx, shutdown).await
}

pub async fn serve_tcp_listener(
    ln: TcpListener,
    remote: SocketAddr,
    ctx: ClientContext,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let connector = Arc::new(TcpConnector::new(ctx.pool.clone(), ctx.tcp_buffers.clone()));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (conn, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(err = %err, "tcp: accept failed");
                        tokio::time::sleep(net::ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let _ = conn.set_nodelay(true);
                let connector = connector.clone();
                let flows = ctx.flows.clone();

                tokio::spawn(async move {
                    let flow = FlowGuard::register(&flows, FlowKind::Tcp, peer.to_string(), remote.to_string());
                    metrics::counter!("edgetun_tcp_flows_total").increment(1);
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        tracing::debug!(sid = %flow.id(), client = %peer, "tcp: accepted");
                    }

                    let meta = FlowMetadata::new(Network::Tcp, remote).with_source(peer);
                    match connector.relay(conn, meta).await {
                        Ok(stats) => tracing::debug!(
                            sid = %flow.id(),
                            ingress = stats.ingress,
                            egress = stats.egress,
                            reconnects = stats.reconnects,
                            "tcp: flow closed"
                        ),
                        Err(err) => tracing::debug!(sid = %flow.id(), err = %err, "tcp: flow ended with error"),
                    }
                });
            }
        }
    }

    Ok(())
}

pub async fn serve_udp_with_shutdown(
    listen_addr: &str,
    remote: SocketAddr,
    idle_timeout: Duration,
    ctx: ClientContext,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let sock = UdpSocket::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind udp {listen_addr}"))?;
    tracing::info!(listen_addr = %listen_addr, remote = %remote, "udp: listening");
    serve_udp_socket(Arc::new(sock), remote, idle_timeout, ctx, shutdown).await
}

pub async fn serve_udp_socket(
    sock: Arc<UdpSocket>,
    remote: SocketAddr,
    idle_timeout: Duration,
    ctx: ClientContext,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let table = SessionTable::new(
        sock.clone(),
        ctx.pool.clone(),
        ctx.udp_buffers.clone(),
        FlowMetadata::new(Network::Udp, remote),
        SessionTableOptions {
            idle_timeout,
            ..SessionTableOptions::default()
        },
        ctx.flows.clone(),
    );

    loop {
        let mut buf = ctx.udp_buffers.get();
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = sock.recv_from(&mut buf) => {
                // Empty datagrams are forwarded like any other.
                let (n, src) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        // ICMP errors from a previous send surface here on some platforms.
                        tracing::debug!(err = %err, "udp: recv failed");
                        tokio::time::sleep(net::ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                table.dispatch(src, buf, n).await;
            }
        }
    }

    table.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::edgetun::telemetry::FlowRegistry;
    use crate::edgetun::tunnel::{
        buffer::{TCP_BUFFER_SIZE, UDP_BUFFER_SIZE},
        datagram::DatagramReader,
        flow::{IPV4_HEADER_LEN, IPV6_HEADER_LEN},
        pool::{PoolOptions, testutil::DuplexEstablisher},
    };

    fn ctx() -> (ClientContext, tokio::sync::mpsc::UnboundedReceiver<tokio::io::DuplexStream>) {
        let (est, peers) = DuplexEstablisher::new(0);
        let pool = Pool::new(
            est,
            PoolOptions {
                capacity: 0,
                ..PoolOptions::default()
            },
        );
        (
            ClientContext {
                pool,
                tcp_buffers: BufferPool::new(TCP_BUFFER_SIZE),
                udp_buffers: BufferPool::new(UDP_BUFFER_SIZE),
                flows: Arc::new(FlowRegistry::new()),
            },
            peers,
        )
    }

    #[tokio::test]
    async fn tcp_listener_forwards_with_header() {
        let (ctx, mut peers) = ctx();
        let flows = ctx.flows.clone();
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let remote: SocketAddr = "93.184.216.34:443".parse().unwrap();
        let (tx, rx) = watch::channel(false);
        let served = tokio::spawn(serve_tcp_listener(ln, remote, ctx, rx));

        let mut c = tokio::net::TcpStream::connect(addr).await.unwrap();
        let payload = [42u8; 100];
        c.write_all(&payload).await.unwrap();

        let mut edge = peers.recv().await.unwrap();
        let mut hdr = [0u8; IPV4_HEADER_LEN];
        edge.read_exact(&mut hdr).await.unwrap();
        assert_eq!(hdr, [4, 6, 93, 184, 216, 34, 0x01, 0xBB]);
        let mut got = [0u8; 100];
        edge.read_exact(&mut got).await.unwrap();
        assert_eq!(got, payload);
        assert_eq!(flows.len(), 1);

        tx.send(true).unwrap();
        served.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn udp_listener_opens_a_session_per_source() {
        let (ctx, mut peers) = ctx();
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = sock.local_addr().unwrap();
        let remote: SocketAddr = "[2001:4860:4860::8888]:53".parse().unwrap();
        let (tx, rx) = watch::channel(false);
        let served = tokio::spawn(serve_udp_socket(
            sock,
            remote,
            Duration::from_secs(30),
            ctx,
            rx,
        ));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"q1", addr).await.unwrap();
        client.send_to(b"q2", addr).await.unwrap();

        let mut edge = peers.recv().await.unwrap();
        let mut hdr = [0u8; IPV6_HEADER_LEN];
        edge.read_exact(&mut hdr).await.unwrap();
        assert_eq!(hdr[0], 6);
        assert_eq!(hdr[1], 17);

        let mut r = DatagramReader::new(edge);
        let mut buf = [0u8; 16];
        let n = r.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"q1");
        let n = r.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"q2");
        assert!(peers.try_recv().is_err(), "one transport per source");

        tx.send(true).unwrap();
        served.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn udp_listener_forwards_empty_datagrams() {
        let (ctx, mut peers) = ctx();
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = sock.local_addr().unwrap();
        let remote: SocketAddr = "127.0.0.1:5353".parse().unwrap();
        let (tx, rx) = watch::channel(false);
        let served = tokio::spawn(serve_udp_socket(sock, remote, Duration::from_secs(30), ctx, rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"", addr).await.unwrap();
        client.send_to(b"after", addr).await.unwrap();

        let mut edge = peers.recv().await.unwrap();
        let mut hdr = [0u8; IPV4_HEADER_LEN];
        edge.read_exact(&mut hdr).await.unwrap();
        assert_eq!(hdr[1], 17);

        let mut r = DatagramReader::new(edge);
        let mut buf = [0u8; 16];
        assert_eq!(r.read_datagram(&mut buf).await.unwrap(), 0);
        let n = r.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"after");

        tx.send(true).unwrap();
        served.await.unwrap().unwrap();
    }
}
