//! UDP transport for channel streams
//!
//! Handles the two socket shapes the sources need: a listener bound to
//! the live address (joining the group when it is multicast) and a
//! connected unicast socket for the FCC and recovery servers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::Error;
use crate::Result;
use super::{RtpTransport, RtpTransportConfig};

/// UDP transport for RTP/RTCP
pub struct UdpRtpTransport {
    /// Underlying socket
    socket: Arc<UdpSocket>,

    /// Whether the socket was connected to a unicast server
    connected: bool,

    /// Multicast group joined at bind time, if any
    group: Option<Ipv4Addr>,

    /// Whether the transport has been closed
    closed: AtomicBool,
}

impl UdpRtpTransport {
    /// Create a new UDP transport
    ///
    /// A multicast `local_addr` binds the wildcard address on its port
    /// and joins the group; anything else binds directly. When
    /// `remote_addr` is set the socket is also connected so RTCP sends
    /// reach the server and only its datagrams are received.
    pub async fn new(config: RtpTransportConfig) -> Result<Self> {
        let (socket, group) = match config.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_multicast() => {
                let bind_addr = SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    config.local_addr.port(),
                );
                let socket = UdpSocket::bind(bind_addr).await
                    .map_err(|e| Error::Transport(format!("Failed to bind UDP socket: {}", e)))?;
                socket.join_multicast_v4(ip, Ipv4Addr::UNSPECIFIED)
                    .map_err(|e| Error::Transport(format!("Failed to join group {}: {}", ip, e)))?;
                debug!("Joined multicast group {} on port {}", ip, config.local_addr.port());
                (socket, Some(ip))
            }
            IpAddr::V6(ip) if ip.is_multicast() => {
                return Err(Error::Transport(
                    "IPv6 multicast is not supported".to_string(),
                ));
            }
            _ => {
                let socket = UdpSocket::bind(config.local_addr).await
                    .map_err(|e| Error::Transport(format!("Failed to bind UDP socket: {}", e)))?;
                (socket, None)
            }
        };

        let connected = if let Some(remote) = config.remote_addr {
            socket.connect(remote).await
                .map_err(|e| Error::Transport(format!("Failed to connect to {}: {}", remote, e)))?;
            true
        } else {
            false
        };

        Ok(Self {
            socket: Arc::new(socket),
            connected,
            group,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl RtpTransport for UdpRtpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
            .map_err(|e| Error::Transport(format!("Failed to get local address: {}", e)))
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("Transport is closed".to_string()));
        }
        if self.connected {
            self.socket.recv(buf).await
                .map_err(|e| Error::Transport(format!("Failed to receive packet: {}", e)))
        } else {
            let (size, _addr) = self.socket.recv_from(buf).await
                .map_err(|e| Error::Transport(format!("Failed to receive packet: {}", e)))?;
            Ok(size)
        }
    }

    async fn send_rtcp(&self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::Transport(
                "No remote address to send RTCP to".to_string(),
            ));
        }
        self.socket.send(data).await
            .map_err(|e| Error::Transport(format!("Failed to send RTCP packet: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(group) = self.group {
            let _ = self.socket.leave_multicast_v4(group, Ipv4Addr::UNSPECIFIED);
        }
        // UDP sockets need no explicit shutdown beyond dropping
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_local_addr() {
        let transport = UdpRtpTransport::new(RtpTransportConfig {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            remote_addr: None,
        })
        .await
        .unwrap();

        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_connected_send_and_recv() {
        // Listener stands in for a channel server
        let server = UdpRtpTransport::new(RtpTransportConfig {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            remote_addr: None,
        })
        .await
        .unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = UdpRtpTransport::new(RtpTransportConfig {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            remote_addr: Some(server_addr),
        })
        .await
        .unwrap();

        client.send_rtcp(b"control bytes").await.unwrap();

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(
            std::time::Duration::from_millis(500),
            server.recv(&mut buf),
        )
        .await
        .expect("timed out")
        .unwrap();
        assert_eq!(&buf[..n], b"control bytes");
    }

    #[tokio::test]
    async fn test_unconnected_rtcp_send_fails() {
        let transport = UdpRtpTransport::new(RtpTransportConfig {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            remote_addr: None,
        })
        .await
        .unwrap();

        assert!(matches!(
            transport.send_rtcp(b"x").await,
            Err(Error::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_recv_after_close_fails() {
        let transport = UdpRtpTransport::new(RtpTransportConfig {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            remote_addr: None,
        })
        .await
        .unwrap();

        transport.close().await.unwrap();
        // Close is idempotent
        transport.close().await.unwrap();

        let mut buf = [0u8; 16];
        assert!(transport.recv(&mut buf).await.is_err());
    }
}
