//! Network information helpers shared by the daemon components.
//!
//! Address classification, well-known CIDR constants, egress address
//! discovery and local interface enumeration. Default-gateway discovery
//! lives in `vpnd_core::netinfo` because it shells out to platform tools.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, UdpSocket};

// ============================================================================
// Well-known ranges
// ============================================================================

/// Local non-routable IPv4 ranges (RFC 1918 + link-local).
pub const LOCAL_NON_ROUTABLE_V4: [(Ipv4Addr, u8); 4] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
];

/// Local non-routable IPv6 ranges (ULA + link-local).
pub const LOCAL_NON_ROUTABLE_V6: [(Ipv6Addr, u8); 2] = [
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
];

/// IPv4 multicast.
pub const MULTICAST_V4: (Ipv4Addr, u8) = (Ipv4Addr::new(224, 0, 0, 0), 4);

/// IPv6 multicast.
pub const MULTICAST_V6: (Ipv6Addr, u8) = (Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 0), 8);

/// Probe used to find the interface carrying IPv4 traffic.
pub const PROBE_V4: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

/// Probe used to find the interface carrying IPv6 traffic.
pub const PROBE_V6: Ipv6Addr = Ipv6Addr::new(0x2a00, 0x1450, 0x400d, 0x080a, 0, 0, 0, 0x200e);

/// Address family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// Local non-routable CIDRs for a family.
pub fn local_non_routable(family: Family) -> Vec<IpNet> {
    match family {
        Family::V4 => LOCAL_NON_ROUTABLE_V4
            .iter()
            .filter_map(|(a, p)| Ipv4Net::new(*a, *p).ok().map(IpNet::V4))
            .collect(),
        Family::V6 => LOCAL_NON_ROUTABLE_V6
            .iter()
            .filter_map(|(a, p)| Ipv6Net::new(*a, *p).ok().map(IpNet::V6))
            .collect(),
    }
}

/// Multicast CIDR for a family.
pub fn multicast(family: Family) -> Vec<IpNet> {
    let net = match family {
        Family::V4 => Ipv4Net::new(MULTICAST_V4.0, MULTICAST_V4.1)
            .ok()
            .map(IpNet::V4),
        Family::V6 => Ipv6Net::new(MULTICAST_V6.0, MULTICAST_V6.1)
            .ok()
            .map(IpNet::V6),
    };
    net.into_iter().collect()
}

// ============================================================================
// Classification
// ============================================================================

/// Coarse address class used by firewall and LAN decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Loopback,
    LinkLocal,
    Private,
    Multicast,
    Unspecified,
    Public,
}

pub fn classify(ip: IpAddr) -> AddressClass {
    if ip.is_unspecified() {
        return AddressClass::Unspecified;
    }
    if ip.is_loopback() {
        return AddressClass::Loopback;
    }
    if ip.is_multicast() {
        return AddressClass::Multicast;
    }
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_link_local() {
                AddressClass::LinkLocal
            } else if v4.is_private() {
                AddressClass::Private
            } else {
                AddressClass::Public
            }
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            if first & 0xffc0 == 0xfe80 {
                AddressClass::LinkLocal
            } else if first & 0xfe00 == 0xfc00 {
                AddressClass::Private
            } else {
                AddressClass::Public
            }
        }
    }
}

/// True for addresses inside the local non-routable ranges.
pub fn is_local_non_routable(ip: IpAddr) -> bool {
    matches!(
        classify(ip),
        AddressClass::LinkLocal | AddressClass::Private
    )
}

/// An address that must be treated as "no address" in configuration input.
pub fn is_empty_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified() || *v4 == Ipv4Addr::BROADCAST,
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}

/// Host-sized network for an address (/32 or /128).
pub fn host_net(ip: IpAddr) -> IpNet {
    IpNet::from(ip)
}

// ============================================================================
// Egress discovery and ports
// ============================================================================

/// Local address a connectionless UDP socket would use to reach `dest`.
///
/// No packet is sent; `connect` on UDP only consults the routing table.
pub fn outbound_ip_for(dest: IpAddr) -> io::Result<IpAddr> {
    let bind: SocketAddr = match dest {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind)?;
    socket.connect(SocketAddr::new(dest, 80))?;
    Ok(socket.local_addr()?.ip())
}

/// Outbound address for the default probe of a family.
pub fn outbound_ip(family: Family) -> io::Result<IpAddr> {
    match family {
        Family::V4 => outbound_ip_for(IpAddr::V4(PROBE_V4)),
        Family::V6 => outbound_ip_for(IpAddr::V6(PROBE_V6)),
    }
}

/// Open and close a UDP socket on an ephemeral port; return the number.
pub fn get_free_udp_port() -> io::Result<u16> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    Ok(socket.local_addr()?.port())
}

/// Open and close a TCP listener on an ephemeral port; return the number.
pub fn get_free_tcp_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    Ok(listener.local_addr()?.port())
}

// ============================================================================
// Interfaces
// ============================================================================

/// A configured address on a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub name: String,
    pub ip: IpAddr,
    pub prefix_len: u8,
    pub is_loopback: bool,
}

impl InterfaceAddr {
    pub fn network(&self) -> Option<IpNet> {
        IpNet::new(self.ip, self.prefix_len).ok().map(|n| n.trunc())
    }
}

/// Enumerate addresses on up interfaces.
pub fn interface_addrs() -> io::Result<Vec<InterfaceAddr>> {
    let ifaces = get_if_addrs::get_if_addrs()?;
    Ok(ifaces
        .into_iter()
        .map(|iface| {
            let is_loopback = iface.is_loopback();
            let (ip, prefix_len) = match &iface.addr {
                get_if_addrs::IfAddr::V4(v4) => (
                    IpAddr::V4(v4.ip),
                    u32::from(v4.netmask).count_ones() as u8,
                ),
                get_if_addrs::IfAddr::V6(v6) => (
                    IpAddr::V6(v6.ip),
                    u128::from(v6.netmask).count_ones() as u8,
                ),
            };
            InterfaceAddr {
                name: iface.name,
                ip,
                prefix_len,
                is_loopback,
            }
        })
        .collect())
}

/// Name of the interface that owns `ip`.
pub fn interface_by_ip(ip: IpAddr) -> io::Result<Option<String>> {
    Ok(interface_addrs()?
        .into_iter()
        .find(|a| a.ip == ip)
        .map(|a| a.name))
}

/// Name of the interface with the given OS index.
#[cfg(unix)]
pub fn interface_by_index(index: u32) -> io::Result<Option<String>> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    // SAFETY: buf is IF_NAMESIZE bytes as required by if_indextoname.
    let ptr = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if ptr.is_null() {
        return Ok(None);
    }
    // SAFETY: on success the buffer holds a NUL-terminated name.
    let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
    Ok(Some(name.to_string_lossy().into_owned()))
}

/// Name of the interface with the given OS index.
#[cfg(not(unix))]
pub fn interface_by_index(_index: u32) -> io::Result<Option<String>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interface lookup by index is not supported on this platform",
    ))
}

/// Networks of local interfaces, intersected with the non-routable ranges.
///
/// Only non-routable networks are returned so a routable address injected
/// into an interface can never widen a LAN allow rule.
pub fn all_local_non_routable(family: Family) -> io::Result<Vec<IpNet>> {
    Ok(filter_non_routable(&interface_addrs()?, family))
}

/// Pure part of [`all_local_non_routable`].
pub fn filter_non_routable(addrs: &[InterfaceAddr], family: Family) -> Vec<IpNet> {
    let ranges = local_non_routable(family);
    let mut out: Vec<IpNet> = Vec::new();
    for addr in addrs {
        if addr.is_loopback || Family::of(&addr.ip) != family {
            continue;
        }
        let Some(net) = addr.network() else {
            continue;
        };
        for range in &ranges {
            let clipped = if range.contains(&net) {
                Some(net)
            } else if net.contains(range) {
                Some(*range)
            } else {
                None
            };
            if let Some(clipped) = clipped {
                if !out.contains(&clipped) {
                    out.push(clipped);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(name: &str, ip: &str, prefix: u8) -> InterfaceAddr {
        InterfaceAddr {
            name: name.into(),
            ip: ip.parse().unwrap(),
            prefix_len: prefix,
            is_loopback: name == "lo",
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("127.0.0.1".parse().unwrap()), AddressClass::Loopback);
        assert_eq!(classify("192.168.1.10".parse().unwrap()), AddressClass::Private);
        assert_eq!(classify("169.254.3.3".parse().unwrap()), AddressClass::LinkLocal);
        assert_eq!(classify("224.0.0.251".parse().unwrap()), AddressClass::Multicast);
        assert_eq!(classify("8.8.8.8".parse().unwrap()), AddressClass::Public);
        assert_eq!(classify("fe80::1".parse().unwrap()), AddressClass::LinkLocal);
        assert_eq!(classify("fd00::5".parse().unwrap()), AddressClass::Private);
        assert_eq!(classify("2001:db8::1".parse().unwrap()), AddressClass::Public);
        assert_eq!(classify("::".parse().unwrap()), AddressClass::Unspecified);
    }

    #[test]
    fn test_empty_address() {
        assert!(is_empty_address(&"0.0.0.0".parse().unwrap()));
        assert!(is_empty_address(&"255.255.255.255".parse().unwrap()));
        assert!(is_empty_address(&"::".parse().unwrap()));
        assert!(!is_empty_address(&"1.1.1.1".parse().unwrap()));
    }

    #[test]
    fn test_filter_non_routable_drops_public_and_loopback() {
        let addrs = vec![
            addr("lo", "127.0.0.1", 8),
            addr("eth0", "192.168.1.10", 24),
            addr("eth1", "85.10.1.2", 24),
            addr("wlan0", "fe80::1234", 64),
        ];
        assert_eq!(
            filter_non_routable(&addrs, Family::V4),
            vec!["192.168.1.0/24".parse::<IpNet>().unwrap()]
        );
        assert_eq!(
            filter_non_routable(&addrs, Family::V6),
            vec!["fe80::/64".parse::<IpNet>().unwrap()]
        );
    }

    #[test]
    fn test_filter_non_routable_clips_oversized_prefix() {
        // A /4 covering 10/8 must not widen the allow rule beyond 10/8.
        let addrs = vec![addr("eth0", "10.1.2.3", 4)];
        assert_eq!(
            filter_non_routable(&addrs, Family::V4),
            vec!["10.0.0.0/8".parse::<IpNet>().unwrap()]
        );
    }

    #[test]
    fn test_free_ports_are_nonzero() {
        assert_ne!(get_free_udp_port().unwrap(), 0);
        assert_ne!(get_free_tcp_port().unwrap(), 0);
    }

    #[test]
    fn test_outbound_ip_for_loopback() {
        let ip = outbound_ip_for("127.0.0.1".parse().unwrap()).unwrap();
        assert!(ip.is_loopback());
    }

    #[test]
    fn test_multicast_constants() {
        assert_eq!(multicast(Family::V4), vec!["224.0.0.0/4".parse::<IpNet>().unwrap()]);
        assert_eq!(multicast(Family::V6), vec!["ff00::/8".parse::<IpNet>().unwrap()]);
    }
}
