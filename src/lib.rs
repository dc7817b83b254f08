//! IPTV fast channel change and lost packet recovery core
//!
//! This crate provides the client-side core of a vendor-style IPTV
//! fast-channel-change (FCC) and lost-packet-recovery service layered
//! over RTP/RTCP: joining a multicast channel through a unicast burst
//! and repairing transient loss through NACK-driven retransmission.
//!
//! The library is organized into several modules:
//!
//! - `packet`: MPEG-restricted RTP decoding and RTCP packet building
//! - `buffer`: fixed-capacity segment ring buffer for stream payload
//! - `transport`: UDP transport for multicast and unicast RTP
//! - `source`: live, fast-change, and recovery channel sources
//! - `recovery`: loss-run detection and recovery admission control
//! - `session`: the channel session orchestrating the three sources

mod error;

// Main modules
pub mod packet;
pub mod buffer;
pub mod transport;
pub mod source;
pub mod recovery;
pub mod session;

// Re-export core types
pub use error::Error;

// Re-export common types from packet module
pub use packet::{RtpPacket, MpegPayloadType, StreamType};
pub use packet::rtcp::{RtcpPacketType, RtcpCompoundBuilder, SessionIdentity};

// Re-export session types
pub use session::{
    ChannelSession, ChannelSessionConfig, ChannelEvent, ChannelSessionStats,
};
pub use session::address::{ChannelAddress, Vendor};

/// The default maximum size for RTP packets in bytes
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1500;

/// Typedef for RTP timestamp values
pub type RtpTimestamp = u32;

/// Typedef for RTP sequence numbers
pub type RtpSequenceNumber = u16;

/// Typedef for RTP synchronization source identifier
pub type RtpSsrc = u32;

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        RtpPacket, MpegPayloadType, StreamType,
        ChannelSession, ChannelSessionConfig, ChannelEvent,
        ChannelAddress, Vendor,
        RtpTimestamp, RtpSequenceNumber, RtpSsrc,
        Error, Result,
    };

    pub use crate::packet::rtcp::{
        RtcpPacketType, RtcpCompoundBuilder, SessionIdentity,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use packet::hex_dump;
    use tracing::debug;

    // Set up a simple test logger
    fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    #[test]
    fn test_transport_stream_packet_roundtrip() {
        init_test_logging();

        // Build an MPEG2-TS packet and push it through encode/decode
        let payload = Bytes::from_static(b"ts payload data");
        let original = RtpPacket::new(
            MpegPayloadType::Mpeg2Ts,
            1000,
            0x12345678,
            0xabcdef01,
            Bytes::new(),
            payload.clone(),
        );

        let wire = original.encode().unwrap();
        debug!("Encoded packet bytes: [{}]", hex_dump(&wire));

        let decoded = RtpPacket::decode(&wire).unwrap();
        debug!("Decoded packet: {:?}", decoded);

        assert_eq!(decoded.payload_type, MpegPayloadType::Mpeg2Ts);
        assert_eq!(decoded.sequence_number, 1000);
        assert_eq!(decoded.timestamp, 0x12345678);
        assert_eq!(decoded.ssrc, 0xabcdef01);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_dynamic_stream_packet_roundtrip() {
        init_test_logging();

        // Dynamic-TS packets carry the real sequence prepended to the payload
        let payload = Bytes::from_static(b"dynamic payload");
        let original = RtpPacket::new(
            MpegPayloadType::DynamicTs,
            0xfd70,
            0x01020304,
            0x55667788,
            Bytes::new(),
            payload.clone(),
        );

        let wire = original.encode().unwrap();
        debug!("Encoded packet bytes: [{}]", hex_dump(&wire));

        let decoded = RtpPacket::decode(&wire).unwrap();
        assert_eq!(decoded.payload_type, MpegPayloadType::DynamicTs);
        assert_eq!(decoded.sequence_number, 0xfd70);
        assert_eq!(decoded.timestamp, 0x01020304);
        assert_eq!(decoded.ssrc, 0x55667788);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_channel_address_from_prelude() {
        use crate::prelude::*;

        let addr: ChannelAddress =
            "iptv://239.0.0.1:1111?vendor=nokia&fcc_server_addr=10.0.0.1:6000"
                .parse()
                .unwrap();
        assert_eq!(addr.vendor, Vendor::Nokia);
        assert!(addr.fast_channel_server.is_some());
        assert!(addr.recovery_server.is_none());
    }
}
