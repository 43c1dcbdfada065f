//! Entry point for flows produced by a userspace network stack.
//!
//! The stack itself (TUN device, packet parsing) lives elsewhere; it hands
//! finished TCP connections and UDP conversations to a [`FlowHandler`].

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::edgetun::telemetry::{FlowGuard, FlowKind, SharedFlows};
use crate::edgetun::tunnel::{
    buffer::BufferPool,
    datagram::{DatagramReader, DatagramWriter},
    flow::{FlowMetadata, Network},
    pool::Pool,
    relay::{ConnState, FlowError, TcpConnector},
    udp::DEFAULT_IDLE_TIMEOUT,
};

/// A TCP connection terminated by the stack. `local_addr` is the address the
/// application dialled.
pub trait TcpFlow: AsyncRead + AsyncWrite {
    fn local_addr(&self) -> SocketAddr;
    fn remote_addr(&self) -> SocketAddr;
}

pub type BoxedTcpFlow = Box<dyn TcpFlow + Unpin + Send>;

/// One UDP conversation between an application socket and a destination.
#[async_trait]
pub trait UdpFlow: Send + Sync {
    fn local_addr(&self) -> SocketAddr;
    fn remote_addr(&self) -> SocketAddr;
    /// Next datagram from the application, `None` once the conversation is over.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
    async fn close(&self);
}

#[async_trait]
pub trait FlowHandler: Send + Sync {
    async fn handle_tcp(&self, flow: BoxedTcpFlow);
    async fn handle_udp(&self, flow: Box<dyn UdpFlow>);
}

/// Relays stack flows through the transport pool.
pub struct Tunnel {
    pool: Arc<Pool>,
    tcp_buffers: Arc<BufferPool>,
    udp_buffers: Arc<BufferPool>,
    udp_idle: Duration,
    flows: SharedFlows,
}

impl Tunnel {
    pub fn new(
        pool: Arc<Pool>,
        tcp_buffers: Arc<BufferPool>,
        udp_buffers: Arc<BufferPool>,
        udp_idle: Duration,
        flows: SharedFlows,
    ) -> Self {
        Self {
            pool,
            tcp_buffers,
            udp_buffers,
            udp_idle: if udp_idle.is_zero() {
                DEFAULT_IDLE_TIMEOUT
            } else {
                udp_idle
            },
            flows,
        }
    }

    async fn relay_udp(&self, flow: &dyn UdpFlow, meta: FlowMetadata) -> Result<(), FlowError> {
        let transport = self.pool.dial().await?;
        let (r, mut w) = tokio::io::split(transport);
        w.write_all(&meta.encode()).await.map_err(FlowError::Transport)?;
        w.flush().await.map_err(FlowError::Transport)?;

        let mut reader = DatagramReader::new(r);
        let mut writer = DatagramWriter::new(w);
        let cancel = ConnState::new();

        let up = async {
            let mut buf = self.udp_buffers.get();
            let res = loop {
                let n = tokio::select! {
                    _ = cancel.closed() => break Ok(()),
                    r = flow.recv(&mut buf) => r,
                };
                let n = match n {
                    Ok(Some(n)) => n,
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(FlowError::Local(err)),
                };
                if let Err(err) = writer.write_datagram(&buf[..n]).await {
                    break Err(FlowError::Transport(io::Error::other(err)));
                }
            };
            cancel.close();
            writer.shutdown().await;
            res
        };

        let down = async {
            let mut buf = self.udp_buffers.get();
            let res = loop {
                let read = tokio::select! {
                    _ = cancel.closed() => break Ok(()),
                    r = tokio::time::timeout(self.udp_idle, reader.read_datagram(&mut buf)) => r,
                };
                let n = match read {
                    Ok(Ok(n)) => n,
                    Ok(Err(err)) => break Err(FlowError::Transport(io::Error::other(err))),
                    Err(_) => {
                        tracing::debug!(dest = %meta.destination, "netstack: udp flow idle");
                        break Ok(());
                    }
                };
                if let Err(err) = flow.send(&buf[..n]).await {
                    break Err(FlowError::Local(err));
                }
            };
            cancel.close();
            res
        };

        let (up, down) = tokio::join!(up, down);
        up.and(down)
    }
}

#[async_trait]
impl FlowHandler for Tunnel {
    async fn handle_tcp(&self, flow: BoxedTcpFlow) {
        let meta = FlowMetadata::new(Network::Tcp, flow.local_addr()).with_source(flow.remote_addr());
        let _guard = FlowGuard::register(
            &self.flows,
            FlowKind::Tcp,
            flow.remote_addr().to_string(),
            meta.dest_address(),
        );
        metrics::counter!("edgetun_tcp_flows_total").increment(1);

        let connector = TcpConnector::new(self.pool.clone(), self.tcp_buffers.clone());
        if let Err(err) = connector.relay(flow, meta).await {
            tracing::debug!(dest = %meta.destination, err = %err, "netstack: tcp flow ended with error");
        }
    }

    async fn handle_udp(&self, flow: Box<dyn UdpFlow>) {
        let meta = FlowMetadata::new(Network::Udp, flow.local_addr()).with_source(flow.remote_addr());
        let _guard = FlowGuard::register(
            &self.flows,
            FlowKind::Udp,
            flow.remote_addr().to_string(),
            meta.dest_address(),
        );
        metrics::counter!("edgetun_udp_sessions_total").increment(1);

        if let Err(err) = self.relay_udp(flow.as_ref(), meta).await {
            tracing::debug!(dest = %meta.destination, err = %err, "netstack: udp flow ended with error");
        }
        flow.close().await;
    }
}
