//! Flow header codec.
//!
//! Wire layout, written once as the first bytes of a fresh transport
//! connection:
//!
//! ```text
//! offset 0       ip_version  (4 or 6)
//! offset 1       network_id  (1=ICMP, 6=TCP, 17=UDP)
//! offset 2       dest_addr   (4 or 16 bytes)
//! offset 2+len   dest_port   (u16 big-endian)
//! ```

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use thiserror::Error;

pub const IPV4_HEADER_LEN: usize = 2 + 4 + 2;
pub const IPV6_HEADER_LEN: usize = 2 + 16 + 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("flow header truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("unsupported ip version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown network id {0}")]
    UnknownNetwork(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Network {
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
}

impl Network {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Icmp => "icmp",
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }

    /// Parses the textual names used in connect metadata and config.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "icmp" => Some(Network::Icmp),
            "tcp" | "tcp4" | "tcp6" => Some(Network::Tcp),
            "udp" | "udp4" | "udp6" => Some(Network::Udp),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Network {
    type Error = HeaderError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(Network::Icmp),
            6 => Ok(Network::Tcp),
            17 => Ok(Network::Udp),
            other => Err(HeaderError::UnknownNetwork(other)),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a flow goes. The source address is informational and never
/// serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowMetadata {
    pub network: Network,
    pub destination: SocketAddr,
    pub source: Option<SocketAddr>,
}

impl FlowMetadata {
    pub fn new(network: Network, destination: SocketAddr) -> Self {
        Self {
            network,
            destination,
            source: None,
        }
    }

    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn ip_version(&self) -> u8 {
        match self.destination {
            SocketAddr::V4(_) => 4,
            SocketAddr::V6(_) => 6,
        }
    }

    pub fn header_len(&self) -> usize {
        match self.destination {
            SocketAddr::V4(_) => IPV4_HEADER_LEN,
            SocketAddr::V6(_) => IPV6_HEADER_LEN,
        }
    }

    /// Dial target in `ip:port` / `[ip]:port` form.
    pub fn dest_address(&self) -> String {
        self.destination.to_string()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len());
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.ip_version());
        out.push(self.network.id());
        match self.destination.ip() {
            IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
        out.extend_from_slice(&self.destination.port().to_be_bytes());
    }

    /// Decodes a header from the front of `buf` and returns it together with
    /// the bytes that follow it (the start of the flow payload).
    pub fn decode(buf: &[u8]) -> Result<(FlowMetadata, &[u8]), HeaderError> {
        let need = required_len(buf)?;
        if buf.len() < need {
            return Err(HeaderError::Truncated {
                need,
                got: buf.len(),
            });
        }

        let network = Network::try_from(buf[1])?;
        let addr_end = need - 2;
        let ip = match buf[0] {
            4 => {
                let mut o = [0u8; 4];
                o.copy_from_slice(&buf[2..addr_end]);
                IpAddr::V4(Ipv4Addr::from(o))
            }
            _ => {
                let mut o = [0u8; 16];
                o.copy_from_slice(&buf[2..addr_end]);
                IpAddr::V6(Ipv6Addr::from(o))
            }
        };
        let port = u16::from_be_bytes([buf[addr_end], buf[addr_end + 1]]);

        Ok((
            FlowMetadata::new(network, SocketAddr::new(ip, port)),
            &buf[need..],
        ))
    }
}

/// Total header length implied by the first bytes of `buf`.
pub fn required_len(buf: &[u8]) -> Result<usize, HeaderError> {
    if buf.len() < 2 {
        return Err(HeaderError::Truncated {
            need: 2,
            got: buf.len(),
        });
    }
    match buf[0] {
        4 => Ok(IPV4_HEADER_LEN),
        6 => Ok(IPV6_HEADER_LEN),
        v => Err(HeaderError::UnsupportedVersion(v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_tcp_layout_is_bit_exact() {
        let m = FlowMetadata::new(Network::Tcp, "93.184.216.34:443".parse().unwrap());
        let b = m.encode();
        assert_eq!(b, vec![4, 6, 93, 184, 216, 34, 0x01, 0xBB]);
        assert_eq!(b.len(), IPV4_HEADER_LEN);
    }

    #[test]
    fn roundtrip_all_networks_and_families() {
        let dests: [SocketAddr; 3] = [
            "10.1.2.3:53".parse().unwrap(),
            "[2001:db8::7]:8443".parse().unwrap(),
            "0.0.0.0:0".parse().unwrap(),
        ];
        for dest in dests {
            for net in [Network::Icmp, Network::Tcp, Network::Udp] {
                let m = FlowMetadata::new(net, dest);
                let enc = m.encode();
                assert_eq!(enc.len(), m.header_len());
                let (got, rest) = FlowMetadata::decode(&enc).unwrap();
                assert_eq!(got, m);
                assert!(rest.is_empty());
            }
        }
    }

    #[test]
    fn trailing_bytes_are_returned_as_payload() {
        let m = FlowMetadata::new(Network::Udp, "[::1]:53".parse().unwrap());
        let mut b = m.encode();
        b.extend_from_slice(b"hello");
        let (got, rest) = FlowMetadata::decode(&b).unwrap();
        assert_eq!(got.network, Network::Udp);
        assert_eq!(got.ip_version(), 6);
        assert_eq!(rest, b"hello");
    }

    #[test]
    fn every_short_prefix_is_rejected() {
        for m in [
            FlowMetadata::new(Network::Tcp, "1.2.3.4:80".parse().unwrap()),
            FlowMetadata::new(Network::Tcp, "[fe80::1]:80".parse().unwrap()),
        ] {
            let enc = m.encode();
            for n in 0..enc.len() {
                match FlowMetadata::decode(&enc[..n]) {
                    Err(HeaderError::Truncated { need, got }) => {
                        assert_eq!(got, n);
                        assert!(need > n);
                    }
                    other => panic!("prefix {n}: unexpected {other:?}"),
                }
            }
        }
    }

    #[test]
    fn unsupported_version_and_unknown_network() {
        assert_eq!(
            FlowMetadata::decode(&[5, 6, 0, 0, 0, 0, 0, 0]).unwrap_err(),
            HeaderError::UnsupportedVersion(5)
        );
        assert_eq!(
            FlowMetadata::decode(&[4, 2, 1, 1, 1, 1, 0, 80]).unwrap_err(),
            HeaderError::UnknownNetwork(2)
        );
    }

    #[test]
    fn network_names() {
        assert_eq!(Network::from_name(" TCP "), Some(Network::Tcp));
        assert_eq!(Network::from_name("udp6"), Some(Network::Udp));
        assert_eq!(Network::from_name("sctp"), None);
        assert_eq!(Network::Udp.to_string(), "udp");
        assert_eq!(Network::try_from(17).unwrap(), Network::Udp);
    }
}
