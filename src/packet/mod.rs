//! RTP packet handling for IPTV channel streams
//!
//! This module decodes the restricted MPEG profile of RFC 3550 used by the
//! channel servers: only the four MPEG payload types are accepted, the
//! extension length word sits at a fixed offset, and every payload type
//! except MPEG2-TS carries its true sequence number as a 2-byte field
//! prepended to the payload.

pub mod rtcp;
pub mod seq;

use bytes::{BufMut, Bytes, BytesMut};
use bitvec::prelude::*;
use std::fmt;

use crate::error::Error;
use crate::{Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP protocol version (always 2 in practice)
pub const RTP_VERSION: u8 = 2;

/// Extension flag bit in the first header byte
pub const RTP_EXTENSION_FLAG: u8 = 0x10;

/// Padding flag bit in the first header byte
pub const RTP_PADDING_FLAG: u8 = 0x20;

/// Minimum header size (without CSRC or extensions)
pub const RTP_MIN_HEADER_SIZE: usize = 12;

/// Profile-specific bytes skipped after the fixed header for
/// MPEG audio/video payloads
pub const MPEG_AV_HEADER_EXTRA: usize = 4;

/// The extension length word always sits at this offset, whatever the
/// payload type (vendor profile rule, not RFC 3550)
pub const EXTENSION_LENGTH_OFFSET: usize = 14;

/// Minimum packet length required before the extension length word is read
const MIN_EXTENSION_PACKET_SIZE: usize = 18;

/// Payload types accepted from the channel servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MpegPayloadType {
    /// MPEG elementary audio (RFC 2250 "MPA")
    MpegAudio = 0x0E,
    /// MPEG elementary video (RFC 2250 "MPV")
    MpegVideo = 0x20,
    /// MPEG-2 transport stream (RFC 2250 "MP2T")
    Mpeg2Ts = 0x21,
    /// Dynamically assigned transport stream used by the FCC and
    /// retransmission servers
    DynamicTs = 0x63,
}

impl MpegPayloadType {
    /// Profile-specific header bytes following the fixed 12-byte header
    pub fn profile_header_len(&self) -> usize {
        match self {
            MpegPayloadType::MpegAudio | MpegPayloadType::MpegVideo => MPEG_AV_HEADER_EXTRA,
            _ => 0,
        }
    }

    /// Whether the true sequence number is a 2-byte field prepended to
    /// the payload rather than the standard header field
    pub fn carries_prefixed_sequence(&self) -> bool {
        !matches!(self, MpegPayloadType::Mpeg2Ts)
    }
}

impl TryFrom<u8> for MpegPayloadType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0E => Ok(MpegPayloadType::MpegAudio),
            0x20 => Ok(MpegPayloadType::MpegVideo),
            0x21 => Ok(MpegPayloadType::Mpeg2Ts),
            0x63 => Ok(MpegPayloadType::DynamicTs),
            other => Err(Error::UnsupportedPayloadType(other)),
        }
    }
}

/// Elementary stream type carried by a packet, derived from the
/// extension bit fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Audio,
    Video,
}

/// A decoded RTP packet from one of the channel servers
///
/// Immutable once decoded. The `extension` field holds the whole
/// extension block including its 4-byte header word, exactly as it
/// appeared on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Payload type
    pub payload_type: MpegPayloadType,

    /// True sequence number (header field or prefixed field,
    /// depending on payload type)
    pub sequence_number: RtpSequenceNumber,

    /// RTP timestamp
    pub timestamp: RtpTimestamp,

    /// Synchronization source identifier
    pub ssrc: RtpSsrc,

    /// Raw extension block (empty when the extension bit was clear)
    pub extension: Bytes,

    /// Media payload with padding and any prefixed sequence removed
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a new packet from its parts
    pub fn new(
        payload_type: MpegPayloadType,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
        extension: Bytes,
        payload: Bytes,
    ) -> Self {
        Self {
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            extension,
            payload,
        }
    }

    /// Build a well-formed extension block from a profile identifier and
    /// data bytes (data is zero-padded up to a 32-bit word boundary)
    pub fn extension_block(profile: u16, data: &[u8]) -> Bytes {
        let words = (data.len() + 3) / 4;
        let mut block = BytesMut::with_capacity(4 + words * 4);
        block.put_u16(profile);
        block.put_u16(words as u16);
        block.put_slice(data);
        block.resize(4 + words * 4, 0);
        block.freeze()
    }

    /// Decode a packet from raw bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RTP_MIN_HEADER_SIZE {
            return Err(Error::PacketTooShort {
                required: RTP_MIN_HEADER_SIZE,
                available: buf.len(),
            });
        }

        // First byte: version (2 bits), padding (1 bit), extension (1 bit),
        // CSRC count (4 bits)
        let first_byte = buf[0];
        let bits = first_byte.view_bits::<Msb0>();
        let version = bits[0..2].load::<u8>();
        if version != RTP_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let has_padding = bits[2];
        let has_extension = bits[3];
        let csrc_count = bits[4..8].load::<u8>();

        // Second byte: marker (ignored), payload type (7 bits)
        let payload_type = MpegPayloadType::try_from(buf[1] & 0x7F)?;

        let mut header_len = RTP_MIN_HEADER_SIZE + 4 * csrc_count as usize;
        header_len += payload_type.profile_header_len();

        // The extension length word is at byte 14 regardless of payload
        // type; for MPEG audio/video that lands inside the profile bytes
        let mut extension = Bytes::new();
        let mut front_skip = header_len;
        if has_extension {
            if buf.len() < MIN_EXTENSION_PACKET_SIZE {
                return Err(Error::TruncatedExtension {
                    required: MIN_EXTENSION_PACKET_SIZE,
                    available: buf.len(),
                });
            }
            let words = u16::from_be_bytes([
                buf[EXTENSION_LENGTH_OFFSET],
                buf[EXTENSION_LENGTH_OFFSET + 1],
            ]) as usize;
            let extension_len = 4 + 4 * words;
            if buf.len() < header_len + extension_len {
                return Err(Error::TruncatedExtension {
                    required: header_len + extension_len,
                    available: buf.len(),
                });
            }
            extension = Bytes::copy_from_slice(&buf[header_len..header_len + extension_len]);
            front_skip += extension_len;
        }

        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        // MPEG2-TS uses the standard sequence field; the other types
        // prepend the true sequence to the payload
        let sequence_number = if payload_type.carries_prefixed_sequence() {
            if buf.len() < front_skip + 2 {
                return Err(Error::PacketTooShort {
                    required: front_skip + 2,
                    available: buf.len(),
                });
            }
            let seq = u16::from_be_bytes([buf[front_skip], buf[front_skip + 1]]);
            front_skip += 2;
            seq
        } else {
            u16::from_be_bytes([buf[2], buf[3]])
        };

        let back_skip = if has_padding {
            buf[buf.len() - 1] as usize
        } else {
            0
        };
        if buf.len() < front_skip + back_skip {
            return Err(Error::PacketTooShort {
                required: front_skip + back_skip,
                available: buf.len(),
            });
        }

        let payload = Bytes::copy_from_slice(&buf[front_skip..buf.len() - back_skip]);

        Ok(Self {
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            extension,
            payload,
        })
    }

    /// Encode the packet into the wire layout `decode` accepts
    ///
    /// The extension block must be empty or well formed (at least the
    /// 4-byte header word, whole 32-bit words, internal length word
    /// matching the block size).
    pub fn encode(&self) -> Result<Bytes> {
        if !self.extension.is_empty() {
            if self.extension.len() < 4 || self.extension.len() % 4 != 0 {
                return Err(Error::EncodeError(format!(
                    "extension block length {} is not whole 32-bit words",
                    self.extension.len()
                )));
            }
            let words = u16::from_be_bytes([self.extension[2], self.extension[3]]) as usize;
            if 4 + 4 * words != self.extension.len() {
                return Err(Error::EncodeError(format!(
                    "extension length word {} does not match block size {}",
                    words,
                    self.extension.len()
                )));
            }
        }

        let profile_extra = self.payload_type.profile_header_len();
        let prefixed = self.payload_type.carries_prefixed_sequence();
        let size = RTP_MIN_HEADER_SIZE
            + profile_extra
            + self.extension.len()
            + if prefixed { 2 } else { 0 }
            + self.payload.len();
        let mut buf = BytesMut::with_capacity(size);

        let mut first_byte = RTP_VERSION << 6;
        if !self.extension.is_empty() {
            first_byte |= RTP_EXTENSION_FLAG;
        }
        buf.put_u8(first_byte);
        buf.put_u8(self.payload_type as u8);
        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        // For MPEG audio/video the profile bytes carry a mirror of the
        // extension word count at byte 14 so the fixed-offset rule holds
        if profile_extra > 0 {
            let words = if self.extension.is_empty() {
                0
            } else {
                (self.extension.len() - 4) / 4
            };
            buf.put_u16(0);
            buf.put_u16(words as u16);
        }

        buf.put_slice(&self.extension);
        if prefixed {
            buf.put_u16(self.sequence_number);
        }
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Elementary stream type signaled in the extension bits; packets
    /// without a long enough extension classify as video
    pub fn stream_type(&self) -> StreamType {
        if self.extension.len() >= 6 && (self.extension[5] & 0x3F) >> 4 == 1 {
            StreamType::Audio
        } else {
            StreamType::Video
        }
    }

    /// Whether the FCC server set the switch-ready bit on this packet
    pub fn is_switch_ready(&self) -> bool {
        self.extension.len() >= 6 && (self.extension[5] & 0x0F) >> 3 == 1
    }
}

impl fmt::Debug for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpPacket")
            .field("payload_type", &self.payload_type)
            .field("sequence_number", &self.sequence_number)
            .field("timestamp", &self.timestamp)
            .field("ssrc", &format_args!("{:#010x}", self.ssrc))
            .field("extension_len", &self.extension.len())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Format bytes as a spaced hex string for debug logging
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
