use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

use crate::edgetun::net;
use crate::edgetun::tunnel::flow::Network;

#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial {network} {addr}: timed out after {attempts} attempts: {last}")]
    Exhausted {
        network: Network,
        addr: String,
        attempts: usize,
        last: io::Error,
    },
    #[error("dial {network} {addr}: {source}")]
    NonRetryable {
        network: Network,
        addr: String,
        source: io::Error,
    },
    #[error("unsupported network {0}")]
    Unsupported(Network),
}

/// Only transport timeouts are worth another attempt.
pub fn is_retryable(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}

/// A dialled destination socket.
#[derive(Debug)]
pub enum Destination {
    Tcp(TcpStream),
    /// Connected to the destination.
    Udp(UdpSocket),
}

#[async_trait]
pub trait DestinationDialer: Send + Sync {
    async fn dial(&self, network: Network, addr: &str) -> io::Result<Destination>;
}

/// Dials with OS sockets, optionally from fixed source addresses.
#[derive(Debug, Clone)]
pub struct SocketDialer {
    bind_v4: Option<Ipv4Addr>,
    bind_v6: Option<Ipv6Addr>,
    timeout: Duration,
}

impl SocketDialer {
    pub fn direct(timeout: Duration) -> Self {
        Self {
            bind_v4: None,
            bind_v6: None,
            timeout,
        }
    }

    pub fn bound(bind_v4: Option<Ipv4Addr>, bind_v6: Option<Ipv6Addr>, timeout: Duration) -> Self {
        Self {
            bind_v4,
            bind_v6,
            timeout,
        }
    }

    fn local_for(&self, remote: &SocketAddr) -> SocketAddr {
        match remote {
            SocketAddr::V4(_) => SocketAddr::new(
                IpAddr::V4(self.bind_v4.unwrap_or(Ipv4Addr::UNSPECIFIED)),
                0,
            ),
            SocketAddr::V6(_) => SocketAddr::new(
                IpAddr::V6(self.bind_v6.unwrap_or(Ipv6Addr::UNSPECIFIED)),
                0,
            ),
        }
    }

    fn is_bound_for(&self, remote: &SocketAddr) -> bool {
        match remote {
            SocketAddr::V4(_) => self.bind_v4.is_some(),
            SocketAddr::V6(_) => self.bind_v6.is_some(),
        }
    }

    async fn connect(&self, network: Network, addr: &str) -> io::Result<Destination> {
        let remote = tokio::net::lookup_host(addr.trim())
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address for {addr}"))
            })?;

        match network {
            Network::Tcp => {
                let sock = match remote {
                    SocketAddr::V4(_) => TcpSocket::new_v4()?,
                    SocketAddr::V6(_) => TcpSocket::new_v6()?,
                };
                if self.is_bound_for(&remote) {
                    sock.bind(self.local_for(&remote))?;
                }
                let st = sock.connect(remote).await?;
                let _ = st.set_nodelay(true);
                Ok(Destination::Tcp(st))
            }
            Network::Udp => {
                let sock = UdpSocket::bind(self.local_for(&remote)).await?;
                sock.connect(remote).await?;
                Ok(Destination::Udp(sock))
            }
            Network::Icmp => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "icmp destinations are not dialable",
            )),
        }
    }
}

#[async_trait]
impl DestinationDialer for SocketDialer {
    async fn dial(&self, network: Network, addr: &str) -> io::Result<Destination> {
        if self.timeout.is_zero() {
            return self.connect(network, addr).await;
        }
        match tokio::time::timeout(self.timeout, self.connect(network, addr)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial timeout after {}", humantime::format_duration(self.timeout)),
            )),
        }
    }
}

/// Split egress: IPv4 and IPv6 destinations can each be forced over the
/// designated dialer. Hostnames count as IPv4.
pub struct EgressPolicy {
    direct: Arc<dyn DestinationDialer>,
    designated: Option<Arc<dyn DestinationDialer>>,
    proxy4: bool,
    proxy6: bool,
}

impl EgressPolicy {
    pub fn direct(direct: Arc<dyn DestinationDialer>) -> Self {
        Self {
            direct,
            designated: None,
            proxy4: false,
            proxy6: false,
        }
    }

    pub fn split(
        direct: Arc<dyn DestinationDialer>,
        designated: Arc<dyn DestinationDialer>,
        proxy4: bool,
        proxy6: bool,
    ) -> Self {
        Self {
            direct,
            designated: Some(designated),
            proxy4,
            proxy6,
        }
    }

    fn select(&self, addr: &str) -> &Arc<dyn DestinationDialer> {
        let forced = if net::is_ipv6_target(addr) {
            self.proxy6
        } else {
            self.proxy4
        };
        match (&self.designated, forced) {
            (Some(d), true) => d,
            _ => &self.direct,
        }
    }
}

#[async_trait]
impl DestinationDialer for EgressPolicy {
    async fn dial(&self, network: Network, addr: &str) -> io::Result<Destination> {
        self.select(addr).dial(network, addr).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

/// Dials `addr`, retrying timeouts up to `policy.max_attempts` times with a
/// fixed delay. Any other error ends the dial at once.
pub async fn dial_with_retry(
    dialer: &dyn DestinationDialer,
    network: Network,
    addr: &str,
    policy: RetryPolicy,
) -> Result<Destination, DialError> {
    if network == Network::Icmp {
        return Err(DialError::Unsupported(network));
    }

    let attempts = policy.max_attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        metrics::counter!("edgetun_edge_dial_attempts_total").increment(1);
        match dialer.dial(network, addr).await {
            Ok(dest) => return Ok(dest),
            Err(err) if is_retryable(&err) => {
                tracing::debug!(
                    network = %network,
                    dest = %addr,
                    attempt,
                    err = %err,
                    "edge: dial timed out"
                );
                last = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
            Err(err) => {
                return Err(DialError::NonRetryable {
                    network,
                    addr: addr.to_string(),
                    source: err,
                });
            }
        }
    }

    Err(DialError::Exhausted {
        network,
        addr: addr.to_string(),
        attempts,
        last: last.unwrap_or_else(|| io::Error::from(io::ErrorKind::TimedOut)),
    })
}
