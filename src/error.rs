use thiserror::Error;
use std::io;

/// Error type for IPTV channel operations
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Error when encoding an RTP or RTCP packet
    #[error("Failed to encode packet: {0}")]
    EncodeError(String),

    /// Error when decoding an RTP packet
    #[error("Failed to decode RTP packet: {0}")]
    DecodeError(String),

    /// Packet shorter than its header requires
    #[error("RTP packet too short: need {required} bytes but have {available}")]
    PacketTooShort {
        required: usize,
        available: usize,
    },

    /// RTP version field is not 2
    #[error("Unsupported RTP version: {0}")]
    UnsupportedVersion(u8),

    /// Payload type outside the supported MPEG set
    #[error("Unsupported RTP payload type: {0:#04x}")]
    UnsupportedPayloadType(u8),

    /// Extension header runs past the end of the packet
    #[error("Truncated RTP extension: need {required} bytes but have {available}")]
    TruncatedExtension {
        required: usize,
        available: usize,
    },

    /// Segment ring buffer cannot accept a write
    #[error("Segment buffer full: {0}")]
    BufferFull(String),

    /// Invalid parameter for a channel operation
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Malformed channel address URI
    #[error("Invalid channel address: {0}")]
    InvalidAddress(String),

    /// Vendor discriminator not recognized
    #[error("Unknown IPTV vendor: {0}")]
    UnknownVendor(String),

    /// IO error when sending/receiving packets
    #[error("IO error: {0}")]
    IoError(String),

    /// RTCP error
    #[error("RTCP error: {0}")]
    RtcpError(String),

    /// Session error
    #[error("Channel session error: {0}")]
    SessionError(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let short_err = Error::PacketTooShort { required: 12, available: 7 };
        assert_eq!(short_err.to_string(), "RTP packet too short: need 12 bytes but have 7");

        let pt_err = Error::UnsupportedPayloadType(0x7F);
        assert_eq!(pt_err.to_string(), "Unsupported RTP payload type: 0x7f");

        let io_err = Error::from(io::Error::new(io::ErrorKind::NotFound, "socket gone"));
        assert!(io_err.to_string().contains("IO error"));
    }
}
