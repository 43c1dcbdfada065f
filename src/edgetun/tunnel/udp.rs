//! UDP session table.
//!
//! Each client source address owns one session with its own transport
//! connection. Return traffic from every session funnels into one
//! listener-wide queue drained by a fixed set of workers.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    net::UdpSocket,
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::edgetun::telemetry::{FlowGuard, FlowKind, SharedFlows};
use crate::edgetun::tunnel::{
    buffer::{BufferPool, PooledBuf},
    datagram::{DatagramReader, DatagramWriter},
    flow::FlowMetadata,
    pool::Pool,
    protocol::ProtocolError,
    transport::BoxedStream,
};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const INBOUND_QUEUE: usize = 1024;
pub const OUTBOUND_QUEUE: usize = 65536;

/// Why a session ended. Idle expiry is routine teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    IdleTimeout,
    TransportClosed,
    TransportError,
    Closed,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionEnd::IdleTimeout => "idle timeout",
            SessionEnd::TransportClosed => "transport closed",
            SessionEnd::TransportError => "transport error",
            SessionEnd::Closed => "closed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionTableOptions {
    pub idle_timeout: Duration,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub workers: usize,
}

impl Default for SessionTableOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            inbound_capacity: INBOUND_QUEUE,
            outbound_capacity: OUTBOUND_QUEUE,
            workers: num_cpus::get(),
        }
    }
}

struct Inbound {
    buf: PooledBuf,
    len: usize,
}

struct Outbound {
    dest: SocketAddr,
    buf: PooledBuf,
    len: usize,
}

pub struct Session {
    id: String,
    source: SocketAddr,
    inbound: mpsc::Sender<Inbound>,
    born: Instant,
    last_remote_read_ms: AtomicU64,
    closed: watch::Sender<bool>,
    reason: parking_lot::Mutex<Option<SessionEnd>>,
    _flow: FlowGuard,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    fn touch(&self) {
        let ms = self.born.elapsed().as_millis() as u64;
        self.last_remote_read_ms.store(ms, Ordering::Relaxed);
    }

    /// Time since the transport last produced a datagram (or since creation).
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_remote_read_ms.load(Ordering::Relaxed));
        self.born.elapsed().saturating_sub(last)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn end_reason(&self) -> Option<SessionEnd> {
        *self.reason.lock()
    }

    /// First close wins and fixes the reason.
    pub fn close(&self, reason: SessionEnd) -> bool {
        {
            let mut r = self.reason.lock();
            if r.is_some() {
                return false;
            }
            *r = Some(reason);
        }
        self.closed.send_replace(true);
        true
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }
}

/// Sessions for one local UDP listener, all bound for the same destination.
pub struct SessionTable {
    sessions: DashMap<SocketAddr, Arc<Session>>,
    pool: Arc<Pool>,
    buffers: Arc<BufferPool>,
    dest: FlowMetadata,
    opts: SessionTableOptions,
    outbound: mpsc::Sender<Outbound>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    flows: SharedFlows,
}

impl SessionTable {
    /// Creates the table and starts the outbound workers writing to `sock`.
    pub fn new(
        sock: Arc<UdpSocket>,
        pool: Arc<Pool>,
        buffers: Arc<BufferPool>,
        dest: FlowMetadata,
        mut opts: SessionTableOptions,
        flows: SharedFlows,
    ) -> Arc<Self> {
        if opts.idle_timeout.is_zero() {
            opts.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        let (tx, rx) = mpsc::channel(opts.outbound_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..opts.workers.max(1))
            .map(|_| tokio::spawn(outbound_worker(sock.clone(), rx.clone())))
            .collect();

        Arc::new(Self {
            sessions: DashMap::new(),
            pool,
            buffers,
            dest,
            opts,
            outbound: tx,
            workers: parking_lot::Mutex::new(workers),
            flows,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn get(&self, source: &SocketAddr) -> Option<Arc<Session>> {
        self.sessions.get(source).map(|s| s.value().clone())
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Routes one datagram received from `source`. Blocks while the
    /// session's inbound queue is full.
    pub async fn dispatch(self: &Arc<Self>, source: SocketAddr, buf: PooledBuf, len: usize) {
        let mut item = Inbound { buf, len };
        // A session closing between lookup and send gets replaced once.
        for _ in 0..2 {
            let sess = self.session_for(source);
            match sess.inbound.send(item).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(back)) => {
                    self.sessions
                        .remove_if(&source, |_, s| Arc::ptr_eq(s, &sess));
                    item = back;
                }
            }
        }
        tracing::debug!(client = %source, "udp: dropped datagram for closed session");
    }

    fn session_for(self: &Arc<Self>, source: SocketAddr) -> Arc<Session> {
        match self.sessions.entry(source) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(v) => {
                let (tx, rx) = mpsc::channel(self.opts.inbound_capacity.max(1));
                let (closed, _) = watch::channel(false);
                let flow = FlowGuard::register(
                    &self.flows,
                    FlowKind::Udp,
                    source.to_string(),
                    self.dest.dest_address(),
                );
                let sess = Arc::new(Session {
                    id: flow.id().to_string(),
                    source,
                    inbound: tx,
                    born: Instant::now(),
                    last_remote_read_ms: AtomicU64::new(0),
                    closed,
                    reason: parking_lot::Mutex::new(None),
                    _flow: flow,
                });
                v.insert(sess.clone());

                metrics::counter!("edgetun_udp_sessions_total").increment(1);
                metrics::gauge!("edgetun_udp_sessions_active").increment(1.0);
                tokio::spawn(self.clone().run_session(sess.clone(), rx));
                sess
            }
        }
    }

    async fn run_session(self: Arc<Self>, sess: Arc<Session>, rx: mpsc::Receiver<Inbound>) {
        tracing::debug!(sid = %sess.id, client = %sess.source, dest = %self.dest.destination, "udp: session opened");

        match self.pool.dial().await {
            Ok(transport) => {
                let (reader, mut writer) = tokio::io::split(transport);
                let header = self.dest.encode();
                let wrote = async {
                    writer.write_all(&header).await?;
                    writer.flush().await
                }
                .await;
                match wrote {
                    Ok(()) => {
                        tokio::join!(
                            pump_inbound(&sess, rx, DatagramWriter::new(writer)),
                            pump_remote(&sess, reader, &self.buffers, &self.outbound),
                            watch_idle(&sess, self.opts.idle_timeout),
                        );
                    }
                    Err(err) => {
                        tracing::debug!(sid = %sess.id, err = %err, "udp: header write failed");
                        sess.close(SessionEnd::TransportError);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(sid = %sess.id, client = %sess.source, err = %err, "udp: transport dial failed");
                sess.close(SessionEnd::TransportError);
            }
        }

        self.sessions
            .remove_if(&sess.source, |_, s| Arc::ptr_eq(s, &sess));
        metrics::gauge!("edgetun_udp_sessions_active").decrement(1.0);
        tracing::debug!(
            sid = %sess.id,
            client = %sess.source,
            reason = %sess.end_reason().unwrap_or(SessionEnd::Closed),
            "udp: session ended"
        );
    }

    /// Closes every session and stops the outbound workers.
    pub fn close(&self) {
        for s in self.sessions.iter() {
            s.value().close(SessionEnd::Closed);
        }
        self.sessions.clear();
        for w in self.workers.lock().drain(..) {
            w.abort();
        }
    }
}

/// Writes queued client datagrams to the transport in arrival order.
async fn pump_inbound(
    sess: &Session,
    mut rx: mpsc::Receiver<Inbound>,
    mut w: DatagramWriter<WriteHalf<BoxedStream>>,
) {
    loop {
        let item = tokio::select! {
            _ = sess.wait_closed() => break,
            item = rx.recv() => item,
        };
        let Some(Inbound { buf, len }) = item else {
            break;
        };
        if let Err(err) = w.write_datagram(&buf[..len]).await {
            tracing::debug!(sid = %sess.id, err = %err, "udp: transport write failed");
            sess.close(SessionEnd::TransportError);
            break;
        }
    }
    rx.close();
    w.shutdown().await;
}

/// Reads remote datagrams and hands them to the outbound workers.
async fn pump_remote(
    sess: &Session,
    reader: ReadHalf<BoxedStream>,
    buffers: &Arc<BufferPool>,
    outbound: &mpsc::Sender<Outbound>,
) {
    let mut reader = DatagramReader::new(reader);
    loop {
        let mut buf = buffers.get();
        let res = tokio::select! {
            _ = sess.wait_closed() => break,
            r = reader.read_datagram(&mut buf) => r,
        };
        match res {
            Ok(len) => {
                sess.touch();
                let item = Outbound {
                    dest: sess.source,
                    buf,
                    len,
                };
                if outbound.send(item).await.is_err() {
                    sess.close(SessionEnd::Closed);
                    break;
                }
            }
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidInput => {
                // Oversized for the buffer; already drained.
                continue;
            }
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                sess.close(SessionEnd::TransportClosed);
                break;
            }
            Err(err) => {
                tracing::debug!(sid = %sess.id, err = %err, "udp: transport read failed");
                sess.close(SessionEnd::TransportError);
                break;
            }
        }
    }
}

/// Evicts the session once the transport has been quiet for `idle`.
async fn watch_idle(sess: &Session, idle: Duration) {
    let mut tick = tokio::time::interval_at(Instant::now() + idle, idle);
    loop {
        tokio::select! {
            _ = sess.wait_closed() => return,
            _ = tick.tick() => {}
        }
        if sess.idle_for() > idle {
            sess.close(SessionEnd::IdleTimeout);
            return;
        }
    }
}

async fn outbound_worker(sock: Arc<UdpSocket>, rx: Arc<Mutex<mpsc::Receiver<Outbound>>>) {
    loop {
        let item = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(Outbound { dest, buf, len }) = item else {
            return;
        };
        if let Err(err) = sock.send_to(&buf[..len], dest).await {
            tracing::debug!(client = %dest, err = %err, "udp: reply send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;
    use crate::edgetun::telemetry::FlowRegistry;
    use crate::edgetun::tunnel::{
        buffer::UDP_BUFFER_SIZE,
        flow::{IPV4_HEADER_LEN, Network},
        pool::{PoolOptions, testutil::DuplexEstablisher},
    };

    struct Harness {
        table: Arc<SessionTable>,
        est: Arc<DuplexEstablisher>,
        peers: mpsc::UnboundedReceiver<DuplexStream>,
        listener: Arc<UdpSocket>,
    }

    async fn harness(idle: Duration) -> Harness {
        let (est, peers) = DuplexEstablisher::new(0);
        let pool = Pool::new(
            est.clone(),
            PoolOptions {
                capacity: 0,
                ..PoolOptions::default()
            },
        );
        let listener = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let table = SessionTable::new(
            listener.clone(),
            pool,
            BufferPool::new(UDP_BUFFER_SIZE),
            FlowMetadata::new(Network::Udp, "1.1.1.1:53".parse().unwrap()),
            SessionTableOptions {
                idle_timeout: idle,
                workers: 2,
                ..SessionTableOptions::default()
            },
            Arc::new(FlowRegistry::new()),
        );
        Harness {
            table,
            est,
            peers,
            listener,
        }
    }

    fn datagram(table: &SessionTable, payload: &[u8]) -> (PooledBuf, usize) {
        let mut buf = table.buffers().get();
        buf[..payload.len()].copy_from_slice(payload);
        (buf, payload.len())
    }

    async fn read_header(peer: &mut DuplexStream) -> FlowMetadata {
        let mut h = [0u8; IPV4_HEADER_LEN];
        peer.read_exact(&mut h).await.unwrap();
        FlowMetadata::decode(&h).unwrap().0
    }

    #[tokio::test]
    async fn concurrent_datagrams_share_one_session() {
        let h = harness(Duration::from_secs(30)).await;
        let src: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        let mut tasks = Vec::new();
        for i in 0..16u8 {
            let table = h.table.clone();
            let (buf, len) = datagram(&table, &[i]);
            tasks.push(tokio::spawn(async move { table.dispatch(src, buf, len).await }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(h.table.len(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.est.attempts(), 1);
    }

    #[tokio::test]
    async fn datagrams_reach_the_transport_in_order() {
        let mut h = harness(Duration::from_secs(30)).await;
        let src: SocketAddr = "127.0.0.1:40001".parse().unwrap();

        for i in 0..10u8 {
            let (buf, len) = datagram(&h.table, &[i, i, i]);
            h.table.dispatch(src, buf, len).await;
        }

        let mut peer = h.peers.recv().await.unwrap();
        let meta = read_header(&mut peer).await;
        assert_eq!(meta.network, Network::Udp);
        assert_eq!(meta.destination.port(), 53);

        let mut r = DatagramReader::new(peer);
        let mut buf = [0u8; 16];
        for i in 0..10u8 {
            let n = r.read_datagram(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[i, i, i]);
        }
    }

    #[tokio::test]
    async fn replies_go_back_to_the_source_address() {
        let mut h = harness(Duration::from_secs(30)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let src = client.local_addr().unwrap();

        let (buf, len) = datagram(&h.table, b"query");
        h.table.dispatch(src, buf, len).await;

        let peer = h.peers.recv().await.unwrap();
        let (mut rd, wr) = tokio::io::split(peer);
        let mut hdr = [0u8; IPV4_HEADER_LEN];
        rd.read_exact(&mut hdr).await.unwrap();
        let mut w = DatagramWriter::new(wr);
        w.write_datagram(b"answer").await.unwrap();

        let mut got = [0u8; 16];
        let (n, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..n], b"answer");
        assert_eq!(from, h.listener.local_addr().unwrap());
    }

    #[tokio::test]
    async fn quiet_session_is_evicted_and_replaced() {
        let mut h = harness(Duration::from_millis(100)).await;
        let src: SocketAddr = "127.0.0.1:40002".parse().unwrap();

        let (buf, len) = datagram(&h.table, b"a");
        h.table.dispatch(src, buf, len).await;
        let first = h.table.get(&src).unwrap();
        let mut peer = h.peers.recv().await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while h.table.get(&src).is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(first.end_reason(), Some(SessionEnd::IdleTimeout));

        // The evicted session's transport is closed.
        let mut sink = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), peer.read_to_end(&mut sink))
            .await
            .unwrap();

        let (buf, len) = datagram(&h.table, b"b");
        h.table.dispatch(src, buf, len).await;
        let second = h.table.get(&src).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.id(), second.id());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.est.attempts(), 2);
    }

    #[tokio::test]
    async fn remote_traffic_keeps_a_session_alive() {
        let mut h = harness(Duration::from_millis(150)).await;
        let src: SocketAddr = "127.0.0.1:40003".parse().unwrap();

        let (buf, len) = datagram(&h.table, b"a");
        h.table.dispatch(src, buf, len).await;
        let peer = h.peers.recv().await.unwrap();
        let (_rd, wr) = tokio::io::split(peer);
        let mut w = DatagramWriter::new(wr);

        for _ in 0..6 {
            w.write_datagram(b"tick").await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(h.table.get(&src).is_some());
    }

    #[tokio::test]
    async fn close_ends_every_session() {
        let h = harness(Duration::from_secs(30)).await;
        let src: SocketAddr = "127.0.0.1:40004".parse().unwrap();
        let (buf, len) = datagram(&h.table, b"a");
        h.table.dispatch(src, buf, len).await;
        let sess = h.table.get(&src).unwrap();

        h.table.close();
        assert_eq!(h.table.len(), 0);
        assert!(sess.is_closed());
        assert_eq!(sess.end_reason(), Some(SessionEnd::Closed));
    }
}
