//! Accepting side: every inbound stream names its destination, either in
//! the connect metadata or in a flow header, and is relayed to a freshly
//! dialled socket.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::watch,
};

use crate::edgetun::net;
use crate::edgetun::telemetry::{FlowGuard, FlowKind, SharedFlows};
use crate::edgetun::tunnel::{
    buffer::BufferPool,
    datagram::{DatagramReader, DatagramWriter},
    dialer::{Destination, DestinationDialer, RetryPolicy, dial_with_retry},
    flow::{FlowMetadata, HeaderError, Network},
    protocol::{self, ConnectRequest, ConnectResponse, ForwardTarget, Metadata},
    relay::ConnState,
    transport::{
        BoxedStream, QuicListenOptions, TransportListenOptions, TransportListener,
        TransportSession, transport_by_name, ws,
    },
};

pub const UDP_READ_DEADLINE: Duration = Duration::from_secs(60);
pub const DNS_READ_DEADLINE: Duration = Duration::from_secs(1);
/// Time a peer gets to finish the connect handshake or websocket upgrade.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Routes inbound streams to their destinations.
pub struct Demux {
    dialer: Arc<dyn DestinationDialer>,
    retry: RetryPolicy,
    buffers: Arc<BufferPool>,
    flows: SharedFlows,
    handshake_timeout: Duration,
    udp_deadline: Duration,
    dns_deadline: Duration,
}

impl Demux {
    pub fn new(
        dialer: Arc<dyn DestinationDialer>,
        retry: RetryPolicy,
        buffers: Arc<BufferPool>,
        flows: SharedFlows,
    ) -> Self {
        Self {
            dialer,
            retry,
            buffers,
            flows,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            udp_deadline: UDP_READ_DEADLINE,
            dns_deadline: DNS_READ_DEADLINE,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Overrides the per-read deadlines on UDP flows (port 53 gets `dns`).
    pub fn with_udp_deadlines(mut self, udp: Duration, dns: Duration) -> Self {
        self.udp_deadline = udp;
        self.dns_deadline = dns;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Read deadline applied to each destination read on a UDP flow to `port`.
    pub fn udp_read_deadline(&self, port: u16) -> Duration {
        if port == 53 {
            self.dns_deadline
        } else {
            self.udp_deadline
        }
    }

    /// Serves a stream that opens with the connect handshake (quic, yamux).
    pub async fn serve_stream(&self, mut st: BoxedStream, peer: Option<SocketAddr>) -> anyhow::Result<()> {
        let handshake = async {
            protocol::read_preamble(&mut st).await?;
            let req = protocol::read_connect_request(&mut st).await?;
            protocol::write_connect_response(
                &mut st,
                &ConnectResponse::switching_protocols(req.websocket_key()),
            )
            .await?;
            Ok::<_, protocol::ProtocolError>(req)
        };
        let req = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .context("edge: connect handshake timeout")??;
        self.route(st, req.forward_target(), peer).await
    }

    /// Serves an upgraded websocket; its request headers are the metadata.
    pub async fn serve_upgraded(
        &self,
        st: BoxedStream,
        metadata: Vec<Metadata>,
        peer: Option<SocketAddr>,
    ) -> anyhow::Result<()> {
        let req = ConnectRequest {
            metadata,
            ..ConnectRequest::default()
        };
        self.route(st, req.forward_target(), peer).await
    }

    async fn route(
        &self,
        mut st: BoxedStream,
        target: Option<ForwardTarget>,
        peer: Option<SocketAddr>,
    ) -> anyhow::Result<()> {
        metrics::counter!("edgetun_edge_streams_total").increment(1);

        let (network, addr, buffered) = match target {
            Some(t) => {
                let network = Network::from_name(&t.network)
                    .with_context(|| format!("edge: unknown forward proto {:?}", t.network))?;
                (network, t.address, Vec::new())
            }
            None => {
                let (meta, rest) = self.read_flow_header(&mut st).await?;
                (meta.network, meta.dest_address(), rest)
            }
        };

        let client = peer.map(|p| p.to_string()).unwrap_or_default();
        let dest = match dial_with_retry(self.dialer.as_ref(), network, &addr, self.retry).await {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(client = %client, dest = %addr, err = %err, "edge: dial exhausted");
                let _ = st.shutdown().await;
                return Err(err.into());
            }
        };

        let flow = FlowGuard::register(&self.flows, FlowKind::Edge, client, addr.clone());
        tracing::debug!(sid = %flow.id(), network = %network, dest = %addr, "edge: relaying");

        let res = match dest {
            Destination::Tcp(conn) => self.relay_tcp(st, conn, buffered).await,
            Destination::Udp(sock) => {
                let port = net_port(&addr);
                self.relay_udp(st, sock, buffered, self.udp_read_deadline(port)).await
            }
        };
        if let Err(err) = &res {
            tracing::debug!(sid = %flow.id(), err = %err, "edge: stream ended with error");
        }
        res.map_err(Into::into)
    }

    /// Reads until a complete flow header is buffered. Bytes after it are
    /// returned for the destination.
    async fn read_flow_header(&self, st: &mut BoxedStream) -> anyhow::Result<(FlowMetadata, Vec<u8>)> {
        let mut buf = self.buffers.get();
        let mut acc = Vec::new();
        loop {
            match FlowMetadata::decode(&acc) {
                Ok((meta, rest)) => return Ok((meta, rest.to_vec())),
                Err(HeaderError::Truncated { .. }) => {}
                Err(err) => return Err(err).context("edge: flow header"),
            }
            let n = st.read(&mut buf).await?;
            if n == 0 {
                anyhow::bail!("edge: stream closed before flow header ({} bytes)", acc.len());
            }
            acc.extend_from_slice(&buf[..n]);
        }
    }

    async fn relay_tcp(&self, st: BoxedStream, mut conn: TcpStream, buffered: Vec<u8>) -> io::Result<()> {
        if !buffered.is_empty() {
            conn.write_all(&buffered).await?;
        }
        let (mut sr, mut sw) = tokio::io::split(st);
        let (mut dr, mut dw) = conn.into_split();
        let cancel = ConnState::new();

        let (up, down) = tokio::join!(
            copy_until_cancel(&mut sr, &mut dw, &self.buffers, &cancel),
            copy_until_cancel(&mut dr, &mut sw, &self.buffers, &cancel),
        );
        let _ = sw.shutdown().await;
        let _ = dw.shutdown().await;

        let (up, down) = (up?, down?);
        metrics::counter!("edgetun_bytes_ingress_total").increment(up);
        metrics::counter!("edgetun_bytes_egress_total").increment(down);
        Ok(())
    }

    async fn relay_udp(
        &self,
        st: BoxedStream,
        sock: UdpSocket,
        buffered: Vec<u8>,
        deadline: Duration,
    ) -> io::Result<()> {
        let (sr, sw) = tokio::io::split(st);
        let mut reader = DatagramReader::new(std::io::Cursor::new(buffered).chain(sr));
        let mut writer = DatagramWriter::new(sw);
        let cancel = ConnState::new();

        let up = async {
            let mut buf = self.buffers.get();
            let res = loop {
                let n = tokio::select! {
                    _ = cancel.closed() => break Ok(()),
                    r = reader.read_datagram(&mut buf) => r,
                };
                match n {
                    Ok(n) => {
                        if let Err(err) = sock.send(&buf[..n]).await {
                            break Err(err);
                        }
                    }
                    Err(protocol::ProtocolError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        break Ok(());
                    }
                    Err(err) => break Err(io::Error::other(err)),
                }
            };
            cancel.close();
            res
        };

        let down = async {
            let mut buf = self.buffers.get();
            let res = loop {
                let read = tokio::select! {
                    _ = cancel.closed() => break Ok(()),
                    r = tokio::time::timeout(deadline, sock.recv(&mut buf)) => r,
                };
                let n = match read {
                    Ok(Ok(n)) => n,
                    Ok(Err(err)) => break Err(err),
                    // Deadline: the exchange is over.
                    Err(_) => break Ok(()),
                };
                if let Err(err) = writer.write_datagram(&buf[..n]).await {
                    break Err(io::Error::other(err));
                }
            };
            cancel.close();
            writer.shutdown().await;
            res
        };

        let (up, down) = tokio::join!(up, down);
        up.and(down)
    }
}

fn net_port(addr: &str) -> u16 {
    net::split_host_port(addr)
        .map(|(_, p)| p)
        .unwrap_or(0)
}

/// Copies until EOF, an error, or cancellation. Either way the sibling
/// direction is cancelled, so both sockets close together.
async fn copy_until_cancel<R, W>(
    r: &mut R,
    w: &mut W,
    buffers: &Arc<BufferPool>,
    cancel: &ConnState,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = buffers.get();
    let mut total = 0u64;
    let res = loop {
        let n = tokio::select! {
            _ = cancel.closed() => break Ok(total),
            res = r.read(&mut buf) => res,
        };
        match n {
            Ok(0) => {
                let _ = w.shutdown().await;
                break Ok(total);
            }
            Ok(n) => {
                if let Err(err) = w.write_all(&buf[..n]).await {
                    break Err(err);
                }
                if let Err(err) = w.flush().await {
                    break Err(err);
                }
                total += n as u64;
            }
            Err(err) => break Err(err),
        }
    };
    cancel.close();
    res
}

#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub listen_addr: String,
    pub transport: String,
    pub quic: QuicListenOptions,
}

pub enum EdgeListener {
    Session(Box<dyn TransportListener>),
    Ws(ws::WsListener),
}

impl EdgeListener {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            EdgeListener::Session(ln) => ln.local_addr(),
            EdgeListener::Ws(ln) => ln.local_addr(),
        }
    }
}

/// One edge endpoint.
pub struct EdgeServer {
    opts: EndpointOptions,
    demux: Arc<Demux>,
}

impl EdgeServer {
    pub fn new(opts: EndpointOptions, demux: Arc<Demux>) -> Self {
        Self { opts, demux }
    }

    pub async fn listen(&self) -> anyhow::Result<EdgeListener> {
        if self.opts.transport.trim().eq_ignore_ascii_case("ws") {
            return Ok(EdgeListener::Ws(ws::WsListener::bind(&self.opts.listen_addr).await?));
        }
        let tr = transport_by_name(&self.opts.transport)?;
        let ln = tr
            .listen(
                &self.opts.listen_addr,
                TransportListenOptions {
                    quic: self.opts.quic.clone(),
                },
            )
            .await?;
        Ok(EdgeListener::Session(ln))
    }

    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let ln = self.listen().await?;
        self.serve(ln, shutdown).await
    }

    pub async fn serve(&self, ln: EdgeListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            addr = %self.opts.listen_addr,
            local = ?ln.local_addr(),
            transport = %self.opts.transport,
            "edge: listening"
        );

        match ln {
            EdgeListener::Ws(ln) => loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                    res = ln.accept() => {
                        let (conn, peer) = match res {
                            Ok(v) => v,
                            Err(err) => {
                                tracing::warn!(err = %err, "edge: ws accept failed");
                                tokio::time::sleep(net::ACCEPT_BACKOFF).await;
                                continue;
                            }
                        };
                        let demux = self.demux.clone();
                        tokio::spawn(async move {
                            let res = async {
                                let (st, metadata) =
                                    tokio::time::timeout(demux.handshake_timeout(), ws::upgrade(conn))
                                        .await
                                        .context("edge: ws upgrade timeout")??;
                                demux.serve_upgraded(st, metadata, Some(peer)).await
                            }
                            .await;
                            if let Err(err) = res {
                                tracing::debug!(client = %peer, err = %format!("{err:#}"), "edge: ws stream ended with error");
                            }
                        });
                    }
                }
            },
            EdgeListener::Session(ln) => {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                        sess = ln.accept() => {
                            let sess = match sess {
                                Ok(s) => s,
                                Err(err) => {
                                    // Failed handshakes must not take the endpoint down.
                                    tracing::debug!(err = %err, "edge: session accept failed");
                                    tokio::time::sleep(net::ACCEPT_BACKOFF).await;
                                    continue;
                                }
                            };
                            let demux = self.demux.clone();
                            tokio::spawn(handle_session(demux, sess));
                        }
                    }
                }
                ln.close().await?;
                Ok(())
            }
        }
    }
}

async fn handle_session(demux: Arc<Demux>, sess: Arc<dyn TransportSession>) {
    let remote = sess.remote_addr();
    tracing::debug!(client = ?remote, "edge: session opened");
    while let Ok(st) = sess.accept_stream().await {
        let demux = demux.clone();
        tokio::spawn(async move {
            if let Err(err) = demux.serve_stream(st, remote).await {
                tracing::debug!(client = ?remote, err = %format!("{err:#}"), "edge: stream ended with error");
            }
        });
    }
    sess.close().await;
    tracing::debug!(client = ?remote, "edge: session closed");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::net::TcpListener;

    use super::*;
    use crate::edgetun::telemetry::FlowRegistry;
    use crate::edgetun::tunnel::{
        buffer::{EDGE_BUFFER_SIZE, TCP_BUFFER_SIZE},
        dialer::{DialError, SocketDialer},
        pool::{Pool, PoolOptions},
        relay::TcpConnector,
        transport::{
            Establisher, QuicDialOptions, SessionEstablisher, TransportDialOptions,
            quic::QuicTransport, tcp::TcpTransport,
        },
    };

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(1),
        }
    }

    fn demux(dialer: Arc<dyn DestinationDialer>) -> Arc<Demux> {
        Arc::new(Demux::new(
            dialer,
            fast_retry(),
            BufferPool::new(EDGE_BUFFER_SIZE),
            Arc::new(FlowRegistry::new()),
        ))
    }

    fn direct() -> Arc<dyn DestinationDialer> {
        Arc::new(SocketDialer::direct(Duration::from_secs(2)))
    }

    async fn echo_tcp() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut c, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = c.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn client_handshake(st: &mut tokio::io::DuplexStream, req: ConnectRequest) {
        let key = req.websocket_key().to_string();
        protocol::write_connect_request(st, &req).await.unwrap();
        protocol::read_connect_response(st, &key).await.unwrap();
    }

    /// Times out every dial and records what was asked for.
    struct RecordingDialer {
        attempts: AtomicUsize,
        asked: parking_lot::Mutex<Vec<(Network, String)>>,
    }

    #[async_trait]
    impl DestinationDialer for RecordingDialer {
        async fn dial(&self, network: Network, addr: &str) -> io::Result<Destination> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.asked.lock().push((network, addr.to_string()));
            Err(io::ErrorKind::TimedOut.into())
        }
    }

    #[tokio::test]
    async fn header_path_dials_and_relays_buffered_payload() {
        let dest = echo_tcp().await;
        let d = demux(direct());
        let (mut client, edge) = tokio::io::duplex(64 * 1024);
        let served = tokio::spawn(async move { d.serve_stream(Box::new(edge), None).await });

        client_handshake(&mut client, ConnectRequest::websocket("k1")).await;
        let mut first = FlowMetadata::new(Network::Tcp, dest).encode();
        first.extend_from_slice(b"hello");
        client.write_all(&first).await.unwrap();

        let mut back = [0u8; 5];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"hello");

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        served.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn forward_metadata_path_relays_udp() {
        let dest = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, from)) = dest.recv_from(&mut buf).await {
                let _ = dest.send_to(&buf[..n], from).await;
            }
        });

        let d = demux(direct());
        let (mut client, edge) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move { d.serve_stream(Box::new(edge), None).await });

        let req = ConnectRequest::websocket("k2").with_forward(Network::Udp, &dest_addr.to_string());
        client_handshake(&mut client, req).await;

        let (rd, wr) = tokio::io::split(client);
        let mut w = DatagramWriter::new(wr);
        let mut r = DatagramReader::new(rd);
        w.write_datagram(b"one").await.unwrap();
        w.write_datagram(b"two").await.unwrap();

        let mut buf = [0u8; 64];
        let n = r.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = r.read_datagram(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[tokio::test]
    async fn unreachable_destination_is_dialled_three_times() {
        let dialer = Arc::new(RecordingDialer {
            attempts: AtomicUsize::new(0),
            asked: parking_lot::Mutex::new(Vec::new()),
        });
        let d = demux(dialer.clone());
        let (mut client, edge) = tokio::io::duplex(64 * 1024);
        let served = tokio::spawn(async move { d.serve_stream(Box::new(edge), None).await });

        client_handshake(&mut client, ConnectRequest::websocket("k3")).await;
        let mut first = FlowMetadata::new(Network::Tcp, "93.184.216.34:443".parse().unwrap()).encode();
        first.extend_from_slice(&[7u8; 100]);
        client.write_all(&first).await.unwrap();

        let err = served.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DialError>(),
            Some(DialError::Exhausted { attempts: 3, .. })
        ));
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 3);
        let asked = dialer.asked.lock();
        assert!(asked.iter().all(|(n, a)| *n == Network::Tcp && a == "93.184.216.34:443"));
    }

    #[tokio::test]
    async fn bad_header_version_is_rejected() {
        let d = demux(direct());
        let (mut client, edge) = tokio::io::duplex(1024);
        let served = tokio::spawn(async move { d.serve_stream(Box::new(edge), None).await });
        client_handshake(&mut client, ConnectRequest::websocket("k4")).await;
        client.write_all(&[5, 6, 0, 0]).await.unwrap();
        assert!(served.await.unwrap().is_err());
    }

    #[test]
    fn dns_gets_the_short_deadline() {
        let d = demux(direct());
        assert_eq!(d.udp_read_deadline(53), DNS_READ_DEADLINE);
        assert_eq!(d.udp_read_deadline(443), UDP_READ_DEADLINE);
    }

    /// Accepts connections and holds them open without ever writing.
    async fn silent_tcp() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((c, _)) = ln.accept().await {
                held.push(c);
            }
        });
        addr
    }

    #[tokio::test]
    async fn client_going_away_ends_a_flow_to_a_silent_destination() {
        let dest = silent_tcp().await;
        let d = demux(direct());
        let (mut client, edge) = tokio::io::duplex(64 * 1024);
        let served = tokio::spawn(async move { d.serve_stream(Box::new(edge), None).await });

        client_handshake(&mut client, ConnectRequest::websocket("k5")).await;
        client
            .write_all(&FlowMetadata::new(Network::Tcp, dest).encode())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(client);

        tokio::time::timeout(Duration::from_secs(3), served)
            .await
            .expect("flow outlived its client")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn udp_flow_ends_after_the_read_deadline() {
        let dest = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest_addr = dest.local_addr().unwrap();

        let d = Arc::new(
            Demux::new(
                direct(),
                fast_retry(),
                BufferPool::new(EDGE_BUFFER_SIZE),
                Arc::new(FlowRegistry::new()),
            )
            .with_udp_deadlines(Duration::from_millis(200), Duration::from_millis(200)),
        );
        let (mut client, edge) = tokio::io::duplex(64 * 1024);
        let served = tokio::spawn(async move { d.serve_stream(Box::new(edge), None).await });

        let req = ConnectRequest::websocket("k6").with_forward(Network::Udp, &dest_addr.to_string());
        client_handshake(&mut client, req).await;
        let (mut rd, wr) = tokio::io::split(client);
        let mut w = DatagramWriter::new(wr);
        w.write_datagram(b"anyone there").await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = dest.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"anyone there");

        tokio::time::timeout(Duration::from_secs(2), served)
            .await
            .expect("udp flow outlived its deadline")
            .unwrap()
            .unwrap();
        let mut rest = Vec::new();
        rd.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        let d = Arc::new(
            Demux::new(
                direct(),
                fast_retry(),
                BufferPool::new(EDGE_BUFFER_SIZE),
                Arc::new(FlowRegistry::new()),
            )
            .with_handshake_timeout(Duration::from_millis(100)),
        );
        let (_client, edge) = tokio::io::duplex(1024);
        let res = tokio::time::timeout(Duration::from_secs(2), d.serve_stream(Box::new(edge), None))
            .await
            .expect("handshake never timed out");
        assert!(res.is_err());
    }

    async fn start_edge(transport: &str) -> SocketAddr {
        let server = EdgeServer::new(
            EndpointOptions {
                listen_addr: "127.0.0.1:0".into(),
                transport: transport.into(),
                quic: QuicListenOptions::default(),
            },
            demux(direct()),
        );
        let ln = server.listen().await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            let _tx = tx;
            let _ = server.serve(ln, rx).await;
        });
        addr
    }

    async fn roundtrip_through(est: Arc<dyn Establisher>) {
        let dest = echo_tcp().await;
        let pool = Pool::new(
            est,
            PoolOptions {
                capacity: 0,
                ..PoolOptions::default()
            },
        );
        let connector = TcpConnector::new(pool, BufferPool::new(TCP_BUFFER_SIZE));
        let (mut client, local) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            connector
                .relay(local, FlowMetadata::new(Network::Tcp, dest))
                .await
        });

        client.write_all(b"through the edge").await.unwrap();
        let mut back = [0u8; 16];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut back))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&back, b"through the edge");
    }

    #[tokio::test]
    async fn end_to_end_over_yamux() {
        let edge = start_edge("tcp").await;
        let est = SessionEstablisher::new(
            Arc::new(TcpTransport::new()),
            edge.to_string(),
            TransportDialOptions::default(),
            Duration::from_secs(5),
        );
        roundtrip_through(Arc::new(est)).await;
    }

    #[tokio::test]
    async fn end_to_end_over_quic() {
        let edge = start_edge("quic").await;
        let est = SessionEstablisher::new(
            Arc::new(QuicTransport::new()),
            edge.to_string(),
            TransportDialOptions {
                quic: QuicDialOptions {
                    server_name: "localhost".into(),
                    insecure_skip_verify: true,
                    next_protos: vec![],
                },
            },
            Duration::from_secs(5),
        );
        roundtrip_through(Arc::new(est)).await;
    }

    #[tokio::test]
    async fn end_to_end_over_websocket() {
        let edge = start_edge("ws").await;
        let est = ws::WsEstablisher::new(ws::WsOptions {
            url: format!("{edge}/tunnel"),
            tls: false,
            ..ws::WsOptions::default()
        })
        .unwrap();
        roundtrip_through(Arc::new(est)).await;
    }
}
