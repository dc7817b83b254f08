//! Channel address parsing
//!
//! Channels are named by a composite URI carrying the live stream
//! address plus optional query parameters for the fast channel change
//! and lost packet recovery servers, e.g.
//! `iptv://239.0.0.1:1111?vendor=nokia&fcc_server_addr=10.0.0.1:6000&lpr_server_addr=10.0.0.2:7000`.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::Error;

/// URI scheme for channel addresses
pub const CHANNEL_URI_SCHEME: &str = "iptv://";

/// Query parameter naming the protocol vendor
const VENDOR_PARAM: &str = "vendor";

/// Query parameter naming the fast channel change server
const FCC_SERVER_PARAM: &str = "fcc_server_addr";

/// Query parameter naming the lost packet recovery server
const RECOVERY_SERVER_PARAM: &str = "lpr_server_addr";

/// Protocol vendor variant selected by the address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Nokia,
}

impl FromStr for Vendor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nokia" => Ok(Vendor::Nokia),
            other => Err(Error::UnknownVendor(other.to_string())),
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vendor::Nokia => write!(f, "nokia"),
        }
    }
}

/// Parsed channel address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAddress {
    /// Live multicast/unicast stream address
    pub live: SocketAddr,

    /// Protocol vendor variant
    pub vendor: Vendor,

    /// Fast channel change server, None disables the mechanism
    pub fast_channel_server: Option<SocketAddr>,

    /// Lost packet recovery server, None disables the mechanism
    pub recovery_server: Option<SocketAddr>,
}

impl ChannelAddress {
    /// Create an address with no auxiliary servers
    pub fn live_only(live: SocketAddr, vendor: Vendor) -> Self {
        Self {
            live,
            vendor,
            fast_channel_server: None,
            recovery_server: None,
        }
    }
}

impl FromStr for ChannelAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(CHANNEL_URI_SCHEME)
            .ok_or_else(|| Error::InvalidAddress(format!("expected {} scheme: {}", CHANNEL_URI_SCHEME, s)))?;

        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };

        let live: SocketAddr = authority
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("invalid live address: {}", authority)))?;

        let mut vendor = None;
        let mut fast_channel_server = None;
        let mut recovery_server = None;

        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| Error::InvalidAddress(format!("malformed query parameter: {}", pair)))?;

                match key {
                    VENDOR_PARAM => vendor = Some(value.parse::<Vendor>()?),
                    FCC_SERVER_PARAM => {
                        fast_channel_server = Some(value.parse().map_err(|_| {
                            Error::InvalidAddress(format!("invalid {}: {}", FCC_SERVER_PARAM, value))
                        })?);
                    }
                    RECOVERY_SERVER_PARAM => {
                        recovery_server = Some(value.parse().map_err(|_| {
                            Error::InvalidAddress(format!("invalid {}: {}", RECOVERY_SERVER_PARAM, value))
                        })?);
                    }
                    // Unrecognized parameters are ignored
                    _ => {}
                }
            }
        }

        let vendor = vendor
            .ok_or_else(|| Error::InvalidAddress(format!("missing {} parameter: {}", VENDOR_PARAM, s)))?;

        Ok(Self {
            live,
            vendor,
            fast_channel_server,
            recovery_server,
        })
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}?{}={}", CHANNEL_URI_SCHEME, self.live, VENDOR_PARAM, self.vendor)?;
        if let Some(server) = self.fast_channel_server {
            write!(f, "&{}={}", FCC_SERVER_PARAM, server)?;
        }
        if let Some(server) = self.recovery_server {
            write!(f, "&{}={}", RECOVERY_SERVER_PARAM, server)?;
        }
        Ok(())
    }
}
