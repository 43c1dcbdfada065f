//! Client-side TCP relay.
//!
//! One connector per accepted local connection. The flow header goes out as
//! the first bytes of every transport connection the connector uses, then
//! two copy loops run until either side stops. A failed transport write is
//! answered with exactly one re-dial: the header and the chunk that failed
//! go out on the fresh connection, and the read side switches over to it.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex, Notify},
};

use crate::edgetun::tunnel::{
    buffer::BufferPool,
    flow::{FlowMetadata, HeaderError},
    pool::{Pool, PoolError},
    transport::BoxedStream,
};

const RECONNECT_SETTLE: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("short write of {0}-byte chunk")]
    ShortWrite(usize),
    #[error("transport: {0}")]
    Transport(io::Error),
    #[error("local: {0}")]
    Local(io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

const ACTIVE: u8 = 0;
const RECONNECTING: u8 = 1;
const CLOSED: u8 = 2;

/// ACTIVE -> (RECONNECTING -> ACTIVE)* -> CLOSED
#[derive(Debug, Default)]
pub struct ConnState {
    state: AtomicU8,
    closed: Notify,
}

impl ConnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == CLOSED
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state.load(Ordering::Acquire) == RECONNECTING
    }

    pub fn begin_reconnect(&self) -> bool {
        self.state
            .compare_exchange(ACTIVE, RECONNECTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_reconnect(&self) -> bool {
        self.state
            .compare_exchange(RECONNECTING, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns true for the call that actually closed it.
    pub fn close(&self) -> bool {
        let prev = self.state.swap(CLOSED, Ordering::AcqRel);
        self.closed.notify_waiters();
        prev != CLOSED
    }

    pub async fn closed(&self) {
        loop {
            let notified = self.closed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub ingress: u64,
    pub egress: u64,
    pub reconnects: u32,
}

struct Shared {
    pool: Arc<Pool>,
    header: Vec<u8>,
    state: ConnState,
    writer: Mutex<WriteHalf<BoxedStream>>,
    pending_reader: parking_lot::Mutex<Option<ReadHalf<BoxedStream>>>,
    swapped: Notify,
}

async fn write_chunk<W>(w: &mut W, chunk: &[u8]) -> Result<(), FlowError>
where
    W: AsyncWrite + Unpin,
{
    w.write_all(chunk).await.map_err(|e| {
        if e.kind() == io::ErrorKind::WriteZero {
            FlowError::ShortWrite(chunk.len())
        } else {
            FlowError::Transport(e)
        }
    })?;
    w.flush().await.map_err(FlowError::Transport)
}

/// Pairs a local stream with a pooled transport connection and relays until
/// either side ends.
pub struct TcpConnector {
    pool: Arc<Pool>,
    buffers: Arc<BufferPool>,
}

impl TcpConnector {
    pub fn new(pool: Arc<Pool>, buffers: Arc<BufferPool>) -> Self {
        Self { pool, buffers }
    }

    pub async fn relay<L>(&self, local: L, meta: FlowMetadata) -> Result<RelayStats, FlowError>
    where
        L: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let header = meta.encode();
        let transport = self.pool.dial().await?;
        let (reader, mut writer) = tokio::io::split(transport);
        write_chunk(&mut writer, &header).await?;

        let shared = Shared {
            pool: self.pool.clone(),
            header,
            state: ConnState::new(),
            writer: Mutex::new(writer),
            pending_reader: parking_lot::Mutex::new(None),
            swapped: Notify::new(),
        };

        let (mut local_r, mut local_w) = tokio::io::split(local);
        let (up, down) = tokio::join!(
            upstream(&shared, &mut local_r, &self.buffers),
            downstream(&shared, reader, &mut local_w, &self.buffers),
        );

        let _ = local_w.shutdown().await;
        let _ = shared.writer.lock().await.shutdown().await;

        let (ingress, reconnects) = up?;
        let egress = down?;
        metrics::counter!("edgetun_bytes_ingress_total").increment(ingress);
        metrics::counter!("edgetun_bytes_egress_total").increment(egress);
        Ok(RelayStats {
            ingress,
            egress,
            reconnects,
        })
    }
}

async fn upstream<R>(
    shared: &Shared,
    local: &mut R,
    buffers: &Arc<BufferPool>,
) -> Result<(u64, u32), FlowError>
where
    R: AsyncRead + Unpin,
{
    let res = copy_up(shared, local, buffers).await;
    shared.state.close();
    res
}

async fn copy_up<R>(
    shared: &Shared,
    local: &mut R,
    buffers: &Arc<BufferPool>,
) -> Result<(u64, u32), FlowError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = buffers.get();
    let mut total = 0u64;
    let mut reconnects = 0u32;

    loop {
        if shared.state.is_closed() {
            return Ok((total, reconnects));
        }
        let n = tokio::select! {
            _ = shared.state.closed() => return Ok((total, reconnects)),
            r = local.read(&mut buf) => r.map_err(FlowError::Local)?,
        };
        if n == 0 {
            return Ok((total, reconnects));
        }

        let mut w = shared.writer.lock().await;
        if let Err(err) = write_chunk(&mut *w, &buf[..n]).await {
            if shared.state.is_closed() {
                return Err(err);
            }
            tracing::debug!(err = %err, "relay: transport write failed; reconnecting");
            shared.state.begin_reconnect();

            let fresh = shared.pool.dial().await?;
            let (r, mut nw) = tokio::io::split(fresh);
            write_chunk(&mut nw, &shared.header).await?;
            write_chunk(&mut nw, &buf[..n]).await?;

            let _old = std::mem::replace(&mut *w, nw);
            *shared.pending_reader.lock() = Some(r);
            shared.swapped.notify_one();
            reconnects += 1;
        }
        total += n as u64;
    }
}

async fn downstream<W>(
    shared: &Shared,
    reader: ReadHalf<BoxedStream>,
    local: &mut W,
    buffers: &Arc<BufferPool>,
) -> Result<u64, FlowError>
where
    W: AsyncWrite + Unpin,
{
    let res = copy_down(shared, reader, local, buffers).await;
    shared.state.close();
    res
}

async fn copy_down<W>(
    shared: &Shared,
    mut reader: ReadHalf<BoxedStream>,
    local: &mut W,
    buffers: &Arc<BufferPool>,
) -> Result<u64, FlowError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = buffers.get();
    let mut total = 0u64;

    loop {
        if shared.state.is_closed() {
            return Ok(total);
        }
        let res = tokio::select! {
            biased;
            _ = shared.state.closed() => return Ok(total),
            _ = shared.swapped.notified() => {
                if let Some(r) = shared.pending_reader.lock().take() {
                    reader = r;
                }
                shared.state.finish_reconnect();
                continue;
            }
            r = reader.read(&mut buf) => r,
        };

        match res {
            Ok(n) if n > 0 => {
                local.write_all(&buf[..n]).await.map_err(FlowError::Local)?;
                local.flush().await.map_err(FlowError::Local)?;
                total += n as u64;
            }
            Ok(_) | Err(_) if shared.state.is_reconnecting() => {
                // The old connection dying mid-reconnect is expected.
                tokio::time::sleep(RECONNECT_SETTLE).await;
                if let Some(r) = shared.pending_reader.lock().take() {
                    reader = r;
                    shared.state.finish_reconnect();
                }
            }
            Ok(_) => return Ok(total),
            Err(err) => return Err(FlowError::Transport(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        pin::Pin,
        sync::atomic::{AtomicUsize, Ordering},
        task::{Context, Poll, Waker},
    };

    use async_trait::async_trait;
    use tokio::{io::DuplexStream, sync::mpsc};

    use super::*;
    use crate::edgetun::tunnel::{
        buffer::TCP_BUFFER_SIZE,
        flow::{IPV4_HEADER_LEN, Network},
        pool::{PoolOptions, testutil::DuplexEstablisher},
        transport::Establisher,
    };

    /// A duplex end whose writes start failing after `writes_left` calls.
    /// With `reset_reads`, a failed write also breaks the read side.
    struct FailAfter {
        inner: DuplexStream,
        writes_left: usize,
        reset_reads: bool,
        broken: bool,
        read_waker: Option<Waker>,
    }

    impl AsyncRead for FailAfter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.broken {
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            let res = Pin::new(&mut self.inner).poll_read(cx, buf);
            if res.is_pending() {
                self.read_waker = Some(cx.waker().clone());
            }
            res
        }
    }

    impl AsyncWrite for FailAfter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.writes_left == 0 {
                if self.reset_reads && !self.broken {
                    self.broken = true;
                    if let Some(w) = self.read_waker.take() {
                        w.wake();
                    }
                }
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            let res = Pin::new(&mut self.inner).poll_write(cx, data);
            if let Poll::Ready(Ok(_)) = res {
                self.writes_left -= 1;
            }
            res
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    /// Each establish takes the next write budget from the script.
    struct ScriptedEstablisher {
        script: parking_lot::Mutex<VecDeque<usize>>,
        attempts: AtomicUsize,
        peers: mpsc::UnboundedSender<DuplexStream>,
        reset_reads: bool,
        redial_delay: Duration,
    }

    #[async_trait]
    impl Establisher for ScriptedEstablisher {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn establish(&self) -> anyhow::Result<BoxedStream> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) > 0 && !self.redial_delay.is_zero() {
                tokio::time::sleep(self.redial_delay).await;
            }
            let writes_left = self.script.lock().pop_front().unwrap_or(usize::MAX);
            let (a, b) = tokio::io::duplex(64 * 1024);
            let _ = self.peers.send(b);
            Ok(Box::new(FailAfter {
                inner: a,
                writes_left,
                reset_reads: self.reset_reads,
                broken: false,
                read_waker: None,
            }))
        }
    }

    type Scripted = (
        Arc<ScriptedEstablisher>,
        Arc<Pool>,
        mpsc::UnboundedReceiver<DuplexStream>,
    );

    fn scripted(script: &[usize]) -> Scripted {
        scripted_with(script, false, Duration::ZERO)
    }

    fn scripted_with(script: &[usize], reset_reads: bool, redial_delay: Duration) -> Scripted {
        let (tx, rx) = mpsc::unbounded_channel();
        let est = Arc::new(ScriptedEstablisher {
            script: parking_lot::Mutex::new(script.iter().copied().collect()),
            attempts: AtomicUsize::new(0),
            peers: tx,
            reset_reads,
            redial_delay,
        });
        let pool = Pool::new(
            est.clone(),
            PoolOptions {
                capacity: 0,
                ..PoolOptions::default()
            },
        );
        (est, pool, rx)
    }

    fn meta() -> FlowMetadata {
        FlowMetadata::new(Network::Tcp, "93.184.216.34:443".parse().unwrap())
    }

    #[tokio::test]
    async fn conn_state_transitions() {
        let s = ConnState::new();
        assert!(!s.finish_reconnect());
        assert!(s.begin_reconnect());
        assert!(s.is_reconnecting());
        assert!(!s.begin_reconnect());
        assert!(s.finish_reconnect());
        assert!(s.close());
        assert!(!s.close());
        assert!(!s.begin_reconnect());
        assert!(s.is_closed());
        s.closed().await;
    }

    #[tokio::test]
    async fn header_then_exact_payload_reaches_the_edge() {
        let (est, mut peers) = DuplexEstablisher::new(0);
        let pool = Pool::new(
            est,
            PoolOptions {
                capacity: 0,
                ..PoolOptions::default()
            },
        );
        let connector = TcpConnector::new(pool, BufferPool::new(TCP_BUFFER_SIZE));

        let (mut client, local) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn(async move { connector.relay(local, meta()).await });

        let payload: Vec<u8> = (0..100u8).collect();
        client.write_all(&payload).await.unwrap();

        let mut edge = peers.recv().await.unwrap();
        let mut header = [0u8; IPV4_HEADER_LEN];
        edge.read_exact(&mut header).await.unwrap();
        let (m, rest) = FlowMetadata::decode(&header).unwrap();
        assert!(rest.is_empty());
        assert_eq!(m.network, Network::Tcp);
        assert_eq!(m.destination.port(), 443);

        let mut got = vec![0u8; 100];
        edge.read_exact(&mut got).await.unwrap();
        assert_eq!(got, payload);

        edge.write_all(b"pong").await.unwrap();
        let mut back = [0u8; 4];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"pong");

        drop(client);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.ingress, 100);
        assert_eq!(stats.egress, 4);
        assert_eq!(stats.reconnects, 0);
    }

    #[tokio::test]
    async fn failed_write_redials_once_and_resends_the_chunk() {
        // First connection takes the header, then breaks.
        let (est, pool, mut peers) = scripted(&[1, usize::MAX]);
        let connector = TcpConnector::new(pool, BufferPool::new(TCP_BUFFER_SIZE));

        let (mut client, local) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn(async move { connector.relay(local, meta()).await });

        client.write_all(b"chunk").await.unwrap();

        let _first = peers.recv().await.unwrap();
        let mut second = peers.recv().await.unwrap();
        let mut header = [0u8; IPV4_HEADER_LEN];
        second.read_exact(&mut header).await.unwrap();
        assert_eq!(header.to_vec(), meta().encode());
        let mut chunk = [0u8; 5];
        second.read_exact(&mut chunk).await.unwrap();
        assert_eq!(&chunk, b"chunk");
        assert_eq!(est.attempts.load(Ordering::SeqCst), 2);

        // Replies now come from the fresh connection.
        second.write_all(b"back").await.unwrap();
        let mut back = [0u8; 4];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"back");

        drop(client);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.reconnects, 1);
    }

    #[tokio::test]
    async fn read_errors_on_the_dying_connection_do_not_end_the_flow() {
        // The first connection's read side resets as soon as its write fails,
        // and the redial is slow enough for downstream to see that error.
        let (est, pool, mut peers) =
            scripted_with(&[1, usize::MAX], true, Duration::from_millis(50));
        let connector = TcpConnector::new(pool, BufferPool::new(TCP_BUFFER_SIZE));

        let (mut client, local) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn(async move { connector.relay(local, meta()).await });

        let _first = peers.recv().await.unwrap();
        client.write_all(b"chunk").await.unwrap();

        let mut second = peers.recv().await.unwrap();
        let mut header = [0u8; IPV4_HEADER_LEN];
        second.read_exact(&mut header).await.unwrap();
        assert_eq!(header.to_vec(), meta().encode());
        let mut chunk = [0u8; 5];
        second.read_exact(&mut chunk).await.unwrap();
        assert_eq!(&chunk, b"chunk");

        second.write_all(b"back").await.unwrap();
        let mut back = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut back))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&back, b"back");
        assert_eq!(est.attempts.load(Ordering::SeqCst), 2);

        drop(client);
        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.egress, 4);
    }

    #[tokio::test]
    async fn second_consecutive_failure_ends_the_flow() {
        let (est, pool, _peers) = scripted(&[1, 1, usize::MAX]);
        let connector = TcpConnector::new(pool, BufferPool::new(TCP_BUFFER_SIZE));

        let (mut client, local) = tokio::io::duplex(64 * 1024);
        let relay = tokio::spawn(async move { connector.relay(local, meta()).await });
        client.write_all(b"chunk").await.unwrap();

        let err = relay.await.unwrap().unwrap_err();
        assert!(matches!(err, FlowError::Transport(_)));
        assert_eq!(est.attempts.load(Ordering::SeqCst), 2);

        // The local side is closed once the flow ends.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pool_failure_surfaces_as_pool_error() {
        let (est, _peers) = DuplexEstablisher::new(usize::MAX);
        let pool = Pool::new(
            est,
            PoolOptions {
                capacity: 0,
                ..PoolOptions::default()
            },
        );
        let connector = TcpConnector::new(pool, BufferPool::new(TCP_BUFFER_SIZE));
        let (_client, local) = tokio::io::duplex(1024);
        let err = connector.relay(local, meta()).await.unwrap_err();
        assert!(matches!(err, FlowError::Pool(PoolError::TransportDial(_))));
    }
}
