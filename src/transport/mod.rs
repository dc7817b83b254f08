//! Network transport for channel streams
//!
//! Sources receive RTP over UDP and send RTCP control packets back to
//! the unicast servers. The trait seam keeps sources testable against
//! in-process fakes.

mod udp;

pub use udp::UdpRtpTransport;

use std::net::SocketAddr;
use async_trait::async_trait;

use crate::Result;

/// Transport used by a channel source
#[async_trait]
pub trait RtpTransport: Send + Sync {
    /// Get the local address the transport is bound to
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Receive one datagram into `buf`, returning its length
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send an RTCP packet to the connected server
    async fn send_rtcp(&self, data: &[u8]) -> Result<()>;

    /// Close the transport
    async fn close(&self) -> Result<()>;
}

/// Configuration for a UDP transport
#[derive(Debug, Clone)]
pub struct RtpTransportConfig {
    /// Address to bind; a multicast address means "join that group"
    pub local_addr: SocketAddr,

    /// Unicast server to connect to, for sources that exchange RTCP
    pub remote_addr: Option<SocketAddr>,
}

impl Default for RtpTransportConfig {
    fn default() -> Self {
        Self {
            local_addr: "0.0.0.0:0".parse().unwrap(),
            remote_addr: None,
        }
    }
}
