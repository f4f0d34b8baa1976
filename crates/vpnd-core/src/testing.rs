//! Fixtures shared by unit tests.

use crate::dns::DnsSettings;
use crate::preferences::SessionData;
use crate::types::{ConnectionRequest, HostEndpoint, Transport, VpnType, WireGuardHost};
use std::net::Ipv4Addr;

pub const WG_HOST_PUBLIC_KEY: &str = "oX/+u0tLhV8+S1SdhqbtGKyLq+Mh7k4wxNbeQ5k4b0Q=";

fn entry() -> HostEndpoint {
    HostEndpoint {
        hostname: "us-ca1.gw.example.net".into(),
        ip: "185.253.97.12".parse().unwrap(),
        port: 2049,
        transport: Transport::Udp,
    }
}

/// Single-hop WireGuard to 185.253.97.12:2049/udp.
pub fn wg_request() -> ConnectionRequest {
    ConnectionRequest {
        vpn_type: VpnType::WireGuard,
        entry: entry(),
        exit: None,
        wireguard: Some(WireGuardHost {
            public_key: WG_HOST_PUBLIC_KEY.into(),
            local_ip: Ipv4Addr::new(172, 21, 0, 1),
            ipv6_prefix: Some("fd00:4956:504e:ffff::".into()),
        }),
        ipv6: false,
        mtu: 0,
        obfuscation: None,
        proxy: None,
        manual_dns: DnsSettings::default(),
        firewall_on_during_connection: true,
    }
}

/// Single-hop OpenVPN to the same entry server.
pub fn ovpn_request() -> ConnectionRequest {
    ConnectionRequest {
        vpn_type: VpnType::OpenVpn,
        wireguard: None,
        ..wg_request()
    }
}

/// Logged-in session with complete WireGuard and OpenVPN credentials.
pub fn test_session() -> SessionData {
    SessionData {
        account_id: "i-ABCD-EFGH-IJKL".into(),
        session: "c8f1a3e2b7d94f60".into(),
        openvpn_user: "ivpnABCDEFGH".into(),
        openvpn_pass: "s3cr3t-pass".into(),
        wg_public_key: "Yf6mMhKQ0kKIb0tvS2dJBKgQ5k2GUT7xCGfUZ8Hq6xs=".into(),
        wg_private_key: "6KpUNCFhbLOmPdGiZz7Vm5yqZqLGBY5R3nbcn8TPYW4=".into(),
        wg_local_ip: Some(Ipv4Addr::new(172, 21, 0, 5)),
        wg_keys_generated: 1_700_000_000,
        ..Default::default()
    }
}
