//! Port selector grammar accepted from frontends.
//!
//! Accepted forms: `udp:443`, `tcp:80`, `443`, `tcp`, `udp` (case-insensitive).

use crate::error::{VpnError, VpnResult};
use crate::types::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Port used when only a protocol is given.
pub const DEFAULT_PORT: u16 = 2049;

/// Transport used when only a port number is given.
pub const DEFAULT_TRANSPORT: Transport = Transport::Udp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub transport: Transport,
    pub port: u16,
}

impl Default for PortSpec {
    fn default() -> Self {
        Self {
            transport: DEFAULT_TRANSPORT,
            port: DEFAULT_PORT,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport, self.port)
    }
}

fn parse_transport(s: &str) -> VpnResult<Transport> {
    match s {
        "udp" => Ok(Transport::Udp),
        "tcp" => Ok(Transport::Tcp),
        _ => Err(VpnError::bad_parameter("port")),
    }
}

fn parse_number(s: &str) -> VpnResult<u16> {
    match s.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(VpnError::bad_parameter("port")),
    }
}

impl FromStr for PortSpec {
    type Err = VpnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let fields: Vec<&str> = lower.split(':').collect();
        match fields.as_slice() {
            [proto, port] => Ok(PortSpec {
                transport: parse_transport(proto)?,
                port: parse_number(port)?,
            }),
            [single] if !single.is_empty() && single.bytes().all(|b| b.is_ascii_digit()) => {
                Ok(PortSpec {
                    transport: DEFAULT_TRANSPORT,
                    port: parse_number(single)?,
                })
            }
            [single] => Ok(PortSpec {
                transport: parse_transport(single)?,
                port: DEFAULT_PORT,
            }),
            _ => Err(VpnError::bad_parameter("port")),
        }
    }
}
