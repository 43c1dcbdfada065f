//! Tunnel data plane.
//!
//! The client side pools transport connections and frames each flow with a
//! flow header; the edge side demultiplexes inbound streams back into real
//! destination sockets.

pub mod buffer;
pub mod datagram;
pub mod dialer;
pub mod edge;
pub mod flow;
pub mod netstack;
pub mod pool;
pub mod protocol;
pub mod relay;
pub mod transport;
pub mod udp;
