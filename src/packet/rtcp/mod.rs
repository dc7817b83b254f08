//! RTCP packet building for the channel-change and recovery protocol
//!
//! This module assembles the compound RTCP packets the channel servers
//! expect: every control message is RR + SDES followed by one terminal
//! packet (APP for the FCC request, BYE for teardown, generic NACK for
//! retransmission requests). The byte layouts reproduce the deployed
//! server protocol exactly, including its quirks, so nothing here should
//! be "corrected" against RFC 3550 without a server-side change.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use std::net::SocketAddr;

use crate::error::Error;
use crate::{Result, RtpSsrc};

mod nack;

pub use nack::{build_nack_entries, NackEntry};

/// RTCP version (same as RTP, always 2)
pub const RTCP_VERSION: u8 = 2;

/// SDES item type for the canonical name
pub const SDES_CNAME: u8 = 1;

/// Feedback message type for a generic NACK (RFC 4585)
pub const NACK_FORMAT: u8 = 1;

/// APP packet name carrying a fast-channel-change request
pub const FCC_REQUEST_NAME: &[u8; 4] = b"FCCR";

/// Protocol marker leading the FCC request data
pub const FCC_PROTOCOL_MARKER: u16 = 300;

/// Size of the FCC request data block
pub const FCC_REQUEST_DATA_LEN: usize = 16;

/// RTCP packet types used by the channel protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RtcpPacketType {
    /// Receiver Report (RR)
    ReceiverReport = 201,

    /// Source Description (SDES)
    SourceDescription = 202,

    /// Goodbye (BYE)
    Goodbye = 203,

    /// Application-Defined (APP)
    ApplicationDefined = 204,

    /// Transport-layer feedback (RTPFB), carrier of the generic NACK
    TransportFeedback = 205,
}

impl TryFrom<u8> for RtcpPacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            201 => Ok(RtcpPacketType::ReceiverReport),
            202 => Ok(RtcpPacketType::SourceDescription),
            203 => Ok(RtcpPacketType::Goodbye),
            204 => Ok(RtcpPacketType::ApplicationDefined),
            205 => Ok(RtcpPacketType::TransportFeedback),
            _ => Err(Error::RtcpError(format!("Unknown RTCP packet type: {}", value))),
        }
    }
}

/// Zero bytes needed to extend `len` to a 32-bit word boundary
pub fn pad_to_word(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Local identity used across all RTCP packets of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Locally generated synchronization source id
    pub ssrc: RtpSsrc,

    /// Canonical name carried in SDES
    pub cname: String,
}

impl SessionIdentity {
    /// Generate a fresh identity with a random SSRC and a
    /// hostname-derived CNAME
    pub fn generate() -> Self {
        let ssrc = rand::thread_rng().gen::<u32>();
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            ssrc,
            cname: format!("iptv@{}", host),
        }
    }

    /// Create an identity from explicit parts
    pub fn new(ssrc: RtpSsrc, cname: String) -> Self {
        Self { ssrc, cname }
    }
}

/// Builds the compound RTCP packets sent to the FCC and recovery servers
///
/// Every compound is RR + SDES + one terminal packet. The same identity
/// is reused for the whole session.
#[derive(Debug, Clone)]
pub struct RtcpCompoundBuilder {
    identity: SessionIdentity,
}

impl RtcpCompoundBuilder {
    /// Create a builder around an existing identity
    pub fn new(identity: SessionIdentity) -> Self {
        Self { identity }
    }

    /// Create a builder with a freshly generated identity
    pub fn with_generated_identity() -> Self {
        Self::new(SessionIdentity::generate())
    }

    /// The identity used in every packet from this builder
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Append a Receiver Report carrying zero report blocks
    ///
    /// The servers ignore reception statistics, so the report count is
    /// always zero and the packet is exactly 8 bytes.
    pub fn append_receiver_report(&self, buf: &mut BytesMut) {
        buf.put_u8(RTCP_VERSION << 6);
        buf.put_u8(RtcpPacketType::ReceiverReport as u8);
        buf.put_u16(1);
        buf.put_u32(self.identity.ssrc);
    }

    /// Append an SDES packet with a single CNAME chunk
    pub fn append_source_description(&self, buf: &mut BytesMut) {
        let cname = self.identity.cname.as_bytes();
        let cname = &cname[..cname.len().min(255)];
        let item_len = 2 + cname.len();
        let pad_len = pad_to_word(item_len);
        let length = ((4 + 4 + item_len + pad_len + 4) / 4) - 1;

        buf.put_u8(RTCP_VERSION << 6 | 1);
        buf.put_u8(RtcpPacketType::SourceDescription as u8);
        buf.put_u16(length as u16);
        buf.put_u32(self.identity.ssrc);
        buf.put_u8(SDES_CNAME);
        buf.put_u8(cname.len() as u8);
        buf.put_slice(cname);
        for _ in 0..pad_len {
            buf.put_u8(0);
        }
        // Chunk terminator
        buf.put_u32(0);
    }

    /// Append a BYE packet
    ///
    /// The deployed servers receive one extra zero byte after the SSRC
    /// (9 bytes on the wire against a length field covering 8); keep it.
    pub fn append_goodbye(&self, buf: &mut BytesMut) {
        buf.put_u8(RTCP_VERSION << 6 | 1);
        buf.put_u8(RtcpPacketType::Goodbye as u8);
        buf.put_u16(1);
        buf.put_u32(self.identity.ssrc);
        buf.put_u8(0);
    }

    /// Append an APP packet with a 4-byte name and opaque data
    pub fn append_app(&self, buf: &mut BytesMut, name: &[u8; 4], data: &[u8]) {
        let length = ((8 + name.len() + data.len() + 2) / 4) - 1;

        buf.put_u8(RTCP_VERSION << 6);
        buf.put_u8(RtcpPacketType::ApplicationDefined as u8);
        buf.put_u16(length as u16);
        buf.put_u32(self.identity.ssrc);
        buf.put_slice(name);
        buf.put_slice(data);
    }

    /// Append a generic NACK with the given (PID, BLP) pairs
    pub fn append_nack(&self, buf: &mut BytesMut, media_ssrc: RtpSsrc, entries: &[NackEntry]) {
        let length = ((12 + 4 * entries.len() + 2) / 4) - 1;

        buf.put_u8(RTCP_VERSION << 6 | NACK_FORMAT);
        buf.put_u8(RtcpPacketType::TransportFeedback as u8);
        buf.put_u16(length as u16);
        buf.put_u32(self.identity.ssrc);
        buf.put_u32(media_ssrc);
        for entry in entries {
            buf.put_u16(entry.pid);
            buf.put_u16(entry.blp);
        }
    }

    /// Build the RR + SDES + APP compound
    pub fn build_app_packet(&self, name: &[u8; 4], data: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        self.append_receiver_report(&mut buf);
        self.append_source_description(&mut buf);
        self.append_app(&mut buf, name, data);
        buf.freeze()
    }

    /// Build the RR + SDES + BYE compound
    pub fn build_bye_packet(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.append_receiver_report(&mut buf);
        self.append_source_description(&mut buf);
        self.append_goodbye(&mut buf);
        buf.freeze()
    }

    /// Build the RR + SDES + NACK compound
    pub fn build_nack_packet(&self, media_ssrc: RtpSsrc, entries: &[NackEntry]) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + 4 * entries.len());
        self.append_receiver_report(&mut buf);
        self.append_source_description(&mut buf);
        self.append_nack(&mut buf, media_ssrc, entries);
        buf.freeze()
    }
}

/// Build the 16-byte FCC request data block
///
/// Layout: protocol marker, requested source port/address, two reserved
/// bytes, then the local endpoint with both fields byte-swapped to
/// little-endian (the server reads them that way).
pub fn fcc_request_data(live: &SocketAddr, local: &SocketAddr) -> Result<[u8; FCC_REQUEST_DATA_LEN]> {
    let live_ip = match live {
        SocketAddr::V4(v4) => v4.ip().octets(),
        SocketAddr::V6(_) => {
            return Err(Error::InvalidParameter(
                "FCC request requires an IPv4 live address".to_string(),
            ))
        }
    };
    let local_ip = match local {
        SocketAddr::V4(v4) => v4.ip().octets(),
        SocketAddr::V6(_) => {
            return Err(Error::InvalidParameter(
                "FCC request requires an IPv4 local address".to_string(),
            ))
        }
    };

    let mut data = [0u8; FCC_REQUEST_DATA_LEN];
    data[0..2].copy_from_slice(&FCC_PROTOCOL_MARKER.to_be_bytes());
    data[2..4].copy_from_slice(&live.port().to_be_bytes());
    data[4..8].copy_from_slice(&live_ip);
    // data[8..10] reserved, left zero
    data[10..12].copy_from_slice(&local.port().to_le_bytes());
    data[12] = local_ip[3];
    data[13] = local_ip[2];
    data[14] = local_ip[1];
    data[15] = local_ip[0];
    Ok(data)
}
