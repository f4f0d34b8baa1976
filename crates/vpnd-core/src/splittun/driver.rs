//! Windows backend on top of the split-tunnel callout driver.
//!
//! The driver rebinds sockets of the configured executables from the
//! tunnel address to the public one. Inverse mode hands it the addresses
//! swapped and adds `/2` routes through the physical gateway, which are
//! more specific than the tunnel's `/1` routes.

use super::{ConfigAddresses, SplitConfig, SplitTunnelBackend};
use crate::error::VpnResult;
use crate::route::{add_routes, remove_routes, RouteEntry, RoutingTable};
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::Mutex;
use vpnd_common::net::Family;

/// Control operations of the driver.
pub trait SplitDriver: Send + Sync {
    fn connect(&self) -> VpnResult<()>;
    fn disconnect(&self) -> VpnResult<()>;
    /// Stop splitting and drop the driver's configuration.
    fn stop_and_clean(&self) -> VpnResult<()>;
    fn set_addresses(&self, addrs: &ConfigAddresses) -> VpnResult<()>;
    fn set_apps(&self, paths: &[String]) -> VpnResult<()>;
    /// Start splitting; the driver tracks processes started from now on.
    fn start(&self) -> VpnResult<()>;
}

/// Address block layout: public v4, tunnel v4, public v6, tunnel v6.
/// Missing addresses are zero.
pub fn encode_addresses(addrs: &ConfigAddresses) -> [u8; 40] {
    let mut buf = [0u8; 40];
    buf[0..4].copy_from_slice(&addrs.public_v4.unwrap_or(Ipv4Addr::UNSPECIFIED).octets());
    buf[4..8].copy_from_slice(&addrs.tunnel_v4.unwrap_or(Ipv4Addr::UNSPECIFIED).octets());
    buf[8..24].copy_from_slice(&addrs.public_v6.unwrap_or(Ipv6Addr::UNSPECIFIED).octets());
    buf[24..40].copy_from_slice(&addrs.tunnel_v6.unwrap_or(Ipv6Addr::UNSPECIFIED).octets());
    buf
}

/// Application list layout, little endian:
/// `u32 total_size, u32 count, u32 len[count], utf16 chars...`
/// with lengths in UTF-16 units and no terminators.
pub fn encode_apps(paths: &[String]) -> Vec<u8> {
    let encoded: Vec<Vec<u16>> = paths.iter().map(|p| p.encode_utf16().collect()).collect();
    let chars: usize = encoded.iter().map(|e| e.len()).sum();
    let total = 8 + 4 * encoded.len() + 2 * chars;

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_le_bytes());
    buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    for e in &encoded {
        buf.extend_from_slice(&(e.len() as u32).to_le_bytes());
    }
    for unit in encoded.iter().flatten() {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
    buf
}

fn quarter_nets(family: Family) -> Vec<IpNet> {
    match family {
        Family::V4 => [0u8, 64, 128, 192]
            .into_iter()
            .map(|first| IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::new(first, 0, 0, 0), 2)))
            .collect(),
        Family::V6 => [0u16, 0x4000, 0x8000, 0xc000]
            .into_iter()
            .map(|first| IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::new(first, 0, 0, 0, 0, 0, 0, 0), 2)))
            .collect(),
    }
}

#[derive(Default)]
struct DriverState {
    connected: bool,
    routes: Vec<RouteEntry>,
}

pub struct DriverBackend {
    driver: Arc<dyn SplitDriver>,
    routes: Arc<dyn RoutingTable>,
    state: Mutex<DriverState>,
}

impl DriverBackend {
    pub fn new(driver: Arc<dyn SplitDriver>, routes: Arc<dyn RoutingTable>) -> Self {
        Self {
            driver,
            routes,
            state: Mutex::new(DriverState::default()),
        }
    }

    async fn inverse_routes(&self, config: &SplitConfig) -> Vec<RouteEntry> {
        let mut routes = Vec::new();
        if config.vpn_enabled {
            match self.routes.default_gateway(Family::V4).await {
                Ok(gw) => routes.extend(quarter_nets(Family::V4).into_iter().map(|n| RouteEntry::via_gateway(n, gw))),
                Err(e) => log::warn!("No default gateway for inverse split routes: {}", e),
            }
        } else if config.addrs.is_blackhole() {
            routes.extend(quarter_nets(Family::V6).into_iter().map(RouteEntry::blackhole));
        }
        routes
    }
}

#[async_trait]
impl SplitTunnelBackend for DriverBackend {
    fn name(&self) -> &'static str {
        "driver"
    }

    async fn apply(&self, config: &SplitConfig) -> VpnResult<()> {
        let mut state = self.state.lock().await;
        if state.connected {
            self.driver.stop_and_clean()?;
            if !config.active {
                state.connected = false;
                self.driver.disconnect()?;
            }
        }
        let stale = std::mem::take(&mut state.routes);
        remove_routes(self.routes.as_ref(), &stale).await;

        if !config.active || config.apps.is_empty() || !config.addrs.is_usable() {
            return Ok(());
        }
        if !state.connected {
            self.driver.connect()?;
            state.connected = true;
            self.driver.stop_and_clean()?;
        }

        let addrs = if config.inverse {
            config.addrs.swapped()
        } else {
            config.addrs
        };
        self.driver.set_addresses(&addrs)?;
        self.driver.set_apps(&config.apps)?;
        self.driver.start()?;
        log::info!(
            "Split tunnel started: {:?} => {:?}, {:?} => {:?}",
            addrs.tunnel_v4,
            addrs.public_v4,
            addrs.tunnel_v6,
            addrs.public_v6
        );

        if config.inverse {
            let routes = self.inverse_routes(config).await;
            state.routes = add_routes(self.routes.as_ref(), &routes).await?;
        }
        Ok(())
    }

    async fn reset(&self) -> VpnResult<()> {
        let mut state = self.state.lock().await;
        let stale = std::mem::take(&mut state.routes);
        remove_routes(self.routes.as_ref(), &stale).await;
        if state.connected {
            state.connected = false;
            self.driver.stop_and_clean()?;
            self.driver.disconnect()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{MemoryRoutingTable, NextHop};
    use crate::splittun::{BLACKHOLE_V4, BLACKHOLE_V6};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeDriver {
        calls: StdMutex<Vec<String>>,
        addrs: StdMutex<Option<ConfigAddresses>>,
    }

    impl FakeDriver {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) -> VpnResult<()> {
            self.calls.lock().unwrap().push(call.to_string());
            Ok(())
        }
    }

    impl SplitDriver for FakeDriver {
        fn connect(&self) -> VpnResult<()> {
            self.record("connect")
        }
        fn disconnect(&self) -> VpnResult<()> {
            self.record("disconnect")
        }
        fn stop_and_clean(&self) -> VpnResult<()> {
            self.record("clean")
        }
        fn set_addresses(&self, addrs: &ConfigAddresses) -> VpnResult<()> {
            *self.addrs.lock().unwrap() = Some(*addrs);
            self.record("addresses")
        }
        fn set_apps(&self, _paths: &[String]) -> VpnResult<()> {
            self.record("apps")
        }
        fn start(&self) -> VpnResult<()> {
            self.record("start")
        }
    }

    fn setup() -> (Arc<FakeDriver>, MemoryRoutingTable, DriverBackend) {
        let driver = Arc::new(FakeDriver::default());
        let routes = MemoryRoutingTable::new();
        routes.set_default_gateway("192.168.1.1".parse().unwrap());
        let backend = DriverBackend::new(driver.clone(), Arc::new(routes.clone()));
        (driver, routes, backend)
    }

    fn config(inverse: bool, vpn_enabled: bool, tunnel: Ipv4Addr) -> SplitConfig {
        SplitConfig {
            active: true,
            inverse,
            vpn_enabled,
            addrs: ConfigAddresses {
                public_v4: Some("192.168.1.57".parse().unwrap()),
                tunnel_v4: Some(tunnel),
                ..Default::default()
            },
            apps: vec![r"C:\Program Files\Mozilla Firefox\firefox.exe".into()],
        }
    }

    #[test]
    fn test_encode_addresses() {
        let buf = encode_addresses(&ConfigAddresses {
            public_v4: Some("192.168.1.57".parse().unwrap()),
            tunnel_v4: Some("172.21.0.5".parse().unwrap()),
            public_v6: None,
            tunnel_v6: Some(BLACKHOLE_V6),
        });
        assert_eq!(&buf[0..8], &[192, 168, 1, 57, 172, 21, 0, 5]);
        assert!(buf[8..24].iter().all(|b| *b == 0));
        assert_eq!(buf[24], 0x01);
        assert_eq!(buf[39], 0x01);
    }

    #[test]
    fn test_encode_apps() {
        let buf = encode_apps(&["ab".to_string(), "é".to_string()]);
        assert_eq!(buf.len(), 8 + 8 + 6);
        assert_eq!(&buf[0..4], &22u32.to_le_bytes());
        assert_eq!(&buf[4..8], &2u32.to_le_bytes());
        assert_eq!(&buf[8..12], &2u32.to_le_bytes());
        assert_eq!(&buf[12..16], &1u32.to_le_bytes());
        assert_eq!(&buf[16..18], &[b'a', 0]);
        assert_eq!(&buf[20..22], &0x00e9u16.to_le_bytes());
        assert_eq!(encode_apps(&[]), [8, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_direct_mode_configures_driver() {
        let (driver, routes, backend) = setup();
        backend.apply(&config(false, true, "172.21.0.5".parse().unwrap())).await.unwrap();
        assert_eq!(driver.calls(), ["connect", "clean", "addresses", "apps", "start"]);
        let addrs = driver.addrs.lock().unwrap().unwrap();
        assert_eq!(addrs.tunnel_v4, Some("172.21.0.5".parse().unwrap()));
        assert!(routes.routes().is_empty());
    }

    #[tokio::test]
    async fn test_inverse_mode_swaps_and_adds_quarter_routes() {
        let (driver, routes, backend) = setup();
        backend.apply(&config(true, true, "172.21.0.5".parse().unwrap())).await.unwrap();
        let addrs = driver.addrs.lock().unwrap().unwrap();
        assert_eq!(addrs.public_v4, Some("172.21.0.5".parse().unwrap()));
        assert_eq!(addrs.tunnel_v4, Some("192.168.1.57".parse().unwrap()));

        let installed = routes.routes();
        assert_eq!(installed.len(), 4);
        assert!(installed.iter().all(|r| r.next_hop == NextHop::Gateway("192.168.1.1".parse().unwrap())));
        assert_eq!(installed[3].destination, "192.0.0.0/2".parse::<IpNet>().unwrap());

        backend.apply(&SplitConfig::default()).await.unwrap();
        assert!(routes.routes().is_empty());
        assert_eq!(driver.calls().last().map(String::as_str), Some("disconnect"));
    }

    #[tokio::test]
    async fn test_inverse_without_vpn_blackholes_ipv6() {
        let (_, routes, backend) = setup();
        let mut cfg = config(true, false, BLACKHOLE_V4);
        cfg.addrs.tunnel_v6 = Some(BLACKHOLE_V6);
        backend.apply(&cfg).await.unwrap();
        let installed = routes.routes();
        assert_eq!(installed.len(), 4);
        assert!(installed.iter().all(|r| r.next_hop == NextHop::Blackhole && r.family() == Family::V6));
    }

    #[tokio::test]
    async fn test_nothing_to_split_keeps_driver_closed() {
        let (driver, _, backend) = setup();
        let mut cfg = config(false, true, "172.21.0.5".parse().unwrap());
        cfg.apps.clear();
        backend.apply(&cfg).await.unwrap();
        assert!(driver.calls().is_empty());
    }
}
