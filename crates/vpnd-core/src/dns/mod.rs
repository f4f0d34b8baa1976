//! DNS isolation.
//!
//! - [`DnsSettings`]: resolver selected by the user or implied by the tunnel
//! - [`DnsController`]: applies and reverts system resolvers, journaling the
//!   prior state so a crashed daemon can finish the revert
//! - [`backend`]: per-platform resolver configuration
//! - [`proxy`]: local DoH/DoT forwarder for encrypted resolvers
//! - [`stamp`]: DNS stamps understood by the forwarder

pub mod backend;
mod controller;
pub mod journal;
pub mod proxy;
pub mod stamp;

pub use controller::DnsController;

use crate::error::{VpnError, VpnResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Local address encrypted resolvers listen on.
pub const LOCAL_RESOLVER: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DnsEncryption {
    #[default]
    None,
    DoH,
    DoT,
}

impl fmt::Display for DnsEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DnsEncryption::None => "None",
            DnsEncryption::DoH => "DoH",
            DnsEncryption::DoT => "DoT",
        })
    }
}

/// A resolver: address, transport encryption and, for DoH/DoT, the URL
/// template or TLS hostname.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsSettings {
    #[serde(default)]
    pub host: Option<IpAddr>,
    #[serde(default)]
    pub encryption: DnsEncryption,
    #[serde(default, alias = "hostname")]
    pub template: String,
}

impl DnsSettings {
    /// Unencrypted resolver at `ip`.
    pub fn plain(ip: IpAddr) -> Self {
        Self {
            host: Some(ip),
            ..Default::default()
        }
    }

    /// True when no usable resolver address is set.
    ///
    /// `0.0.0.0`, `255.255.255.255` and `::` count as unset.
    pub fn is_empty(&self) -> bool {
        match self.host {
            None => true,
            Some(IpAddr::V4(ip)) => ip == Ipv4Addr::UNSPECIFIED || ip == Ipv4Addr::BROADCAST,
            Some(IpAddr::V6(ip)) => ip == Ipv6Addr::UNSPECIFIED,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !self.is_empty() && self.encryption != DnsEncryption::None
    }

    /// Resolver address if the settings are not empty.
    pub fn address(&self) -> Option<IpAddr> {
        if self.is_empty() {
            None
        } else {
            self.host
        }
    }

    pub fn validate(&self) -> VpnResult<()> {
        if self.is_empty() {
            return Ok(());
        }
        let template = self.template.trim();
        match self.encryption {
            DnsEncryption::None if !template.is_empty() => Err(VpnError::bad_parameter("dns.template")),
            DnsEncryption::DoH if !template.starts_with("https://") || template.len() <= "https://".len() => {
                Err(VpnError::bad_parameter("dns.template"))
            }
            DnsEncryption::DoT if template.is_empty() => Err(VpnError::bad_parameter("dns.template")),
            _ => Ok(()),
        }
    }

    /// Human-readable form used in logs and status output.
    pub fn info_string(&self) -> String {
        match self.address() {
            None => "<none>".to_string(),
            Some(ip) => match self.encryption {
                DnsEncryption::None => ip.to_string(),
                enc => format!("{} ({} {})", ip, enc, self.template.trim()),
            },
        }
    }
}

impl fmt::Display for DnsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.info_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doh() -> DnsSettings {
        DnsSettings {
            host: Some("1.1.1.1".parse().unwrap()),
            encryption: DnsEncryption::DoH,
            template: "https://cloudflare-dns.com/dns-query".into(),
        }
    }

    #[test]
    fn test_empty_addresses() {
        assert!(DnsSettings::default().is_empty());
        for ip in ["0.0.0.0", "255.255.255.255", "::"] {
            assert!(DnsSettings::plain(ip.parse().unwrap()).is_empty(), "{}", ip);
        }
        assert!(!DnsSettings::plain("10.0.0.1".parse().unwrap()).is_empty());
    }

    #[test]
    fn test_validation() {
        assert!(doh().validate().is_ok());

        let mut bad = doh();
        bad.template = "http://plain.example/dns-query".into();
        assert!(matches!(bad.validate(), Err(VpnError::BadParameter { .. })));

        let mut plain_with_template = DnsSettings::plain("9.9.9.9".parse().unwrap());
        plain_with_template.template = "dns.quad9.net".into();
        assert!(plain_with_template.validate().is_err());

        let dot = DnsSettings {
            host: Some("9.9.9.9".parse().unwrap()),
            encryption: DnsEncryption::DoT,
            template: String::new(),
        };
        assert!(dot.validate().is_err());

        // Nothing to check on an empty resolver.
        let empty = DnsSettings {
            encryption: DnsEncryption::DoH,
            ..Default::default()
        };
        assert!(empty.validate().is_ok());
    }

    #[test]
    fn test_info_string() {
        assert_eq!(DnsSettings::default().info_string(), "<none>");
        assert_eq!(DnsSettings::plain("1.1.1.1".parse().unwrap()).info_string(), "1.1.1.1");
        assert_eq!(doh().info_string(), "1.1.1.1 (DoH https://cloudflare-dns.com/dns-query)");
    }

    #[test]
    fn test_hostname_alias_deserializes() {
        let s: DnsSettings =
            serde_json::from_str(r#"{"host":"9.9.9.9","encryption":"DoT","hostname":"dns.quad9.net"}"#).unwrap();
        assert_eq!(s.template, "dns.quad9.net");
        assert!(s.is_encrypted());
    }
}
