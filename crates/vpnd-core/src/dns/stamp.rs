//! `sdns://` server stamps for DoH and DoT resolvers.
//!
//! Layout (all strings length-prefixed with one byte):
//!
//! ```text
//! DoH: 0x02 | props:u64le | addr | hashes(vlp) | hostname | path
//! DoT: 0x03 | props:u64le | addr | hashes(vlp) | hostname
//! ```
//!
//! No certificate hashes are pinned, so the hash set is a single empty entry.

use super::{DnsEncryption, DnsSettings};
use crate::error::{VpnError, VpnResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::net::IpAddr;

const PROTO_DOH: u8 = 0x02;
const PROTO_DOT: u8 = 0x03;

/// Server properties: DNSSEC, no-logs, no-filter. Unknown for user resolvers.
const PROPS: u64 = 0;

fn push_lp(out: &mut Vec<u8>, value: &str) -> VpnResult<()> {
    let len = u8::try_from(value.len()).map_err(|_| VpnError::bad_parameter("dns.template"))?;
    out.push(len);
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn stamp_addr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{}]", v6),
    }
}

/// Split an `https://host[:port]/path` template.
fn split_doh_template(template: &str) -> VpnResult<(&str, &str)> {
    let rest = template
        .trim()
        .strip_prefix("https://")
        .ok_or_else(|| VpnError::bad_parameter("dns.template"))?;
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/dns-query"),
    };
    if host.is_empty() {
        return Err(VpnError::bad_parameter("dns.template"));
    }
    Ok((host, path))
}

/// Build the stamp for an encrypted resolver.
pub fn server_stamp(settings: &DnsSettings) -> VpnResult<String> {
    let ip = settings
        .address()
        .ok_or_else(|| VpnError::bad_parameter("dns.host"))?;

    let mut raw = Vec::with_capacity(64);
    match settings.encryption {
        DnsEncryption::DoH => {
            let (host, path) = split_doh_template(&settings.template)?;
            raw.push(PROTO_DOH);
            raw.extend_from_slice(&PROPS.to_le_bytes());
            push_lp(&mut raw, &stamp_addr(ip))?;
            raw.push(0);
            push_lp(&mut raw, host)?;
            push_lp(&mut raw, path)?;
        }
        DnsEncryption::DoT => {
            let host = settings.template.trim();
            if host.is_empty() {
                return Err(VpnError::bad_parameter("dns.template"));
            }
            raw.push(PROTO_DOT);
            raw.extend_from_slice(&PROPS.to_le_bytes());
            push_lp(&mut raw, &stamp_addr(ip))?;
            raw.push(0);
            push_lp(&mut raw, host)?;
        }
        DnsEncryption::None => return Err(VpnError::bad_parameter("dns.encryption")),
    }
    Ok(format!("sdns://{}", URL_SAFE_NO_PAD.encode(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(stamp: &str) -> Vec<u8> {
        URL_SAFE_NO_PAD
            .decode(stamp.strip_prefix("sdns://").unwrap())
            .unwrap()
    }

    #[test]
    fn test_doh_stamp_layout() {
        let settings = DnsSettings {
            host: Some("1.1.1.1".parse().unwrap()),
            encryption: DnsEncryption::DoH,
            template: "https://cloudflare-dns.com/dns-query".into(),
        };
        let stamp = server_stamp(&settings).unwrap();
        assert!(!stamp.contains('='));
        let raw = decode(&stamp);
        assert_eq!(raw[0], PROTO_DOH);
        assert_eq!(&raw[1..9], &[0u8; 8]);
        assert_eq!(raw[9] as usize, "1.1.1.1".len());
        assert_eq!(&raw[10..17], b"1.1.1.1");
        assert_eq!(raw[17], 0);
        assert_eq!(raw[18] as usize, "cloudflare-dns.com".len());
        assert!(raw.ends_with(b"\x0a/dns-query"));
    }

    #[test]
    fn test_dot_stamp_uses_bracketed_v6() {
        let settings = DnsSettings {
            host: Some("2620:fe::fe".parse().unwrap()),
            encryption: DnsEncryption::DoT,
            template: "dns.quad9.net".into(),
        };
        let raw = decode(&server_stamp(&settings).unwrap());
        assert_eq!(raw[0], PROTO_DOT);
        let addr_len = raw[9] as usize;
        assert_eq!(&raw[10..10 + addr_len], b"[2620:fe::fe]");
        assert!(raw.ends_with(b"\x0ddns.quad9.net"));
    }

    #[test]
    fn test_plain_resolver_has_no_stamp() {
        let settings = DnsSettings::plain("9.9.9.9".parse().unwrap());
        assert!(server_stamp(&settings).is_err());
    }
}
