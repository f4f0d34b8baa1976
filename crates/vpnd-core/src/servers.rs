//! Server catalogue as consumed by the core, plus its on-disk cache.
//!
//! Fetching the list from the account API is out of this crate's hands; a
//! [`ServersFetcher`] can be plugged in by the embedding daemon.

use crate::error::{VpnError, VpnResult};
use crate::types::{ObfuscationSpec, V2RayTransport, VpnType, WireGuardHost};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use vpnd_common::config::write_private_file;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostIpv6 {
    pub host: Option<IpAddr>,
    pub local_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHost {
    pub hostname: String,
    pub host: IpAddr,
    #[serde(default)]
    pub dns_name: String,
    #[serde(default)]
    pub multihop_port: u16,
    #[serde(default)]
    pub load: f32,
    /// WireGuard only.
    #[serde(default)]
    pub public_key: Option<String>,
    /// WireGuard only: host address inside the tunnel.
    #[serde(default)]
    pub local_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub ipv6: Option<HostIpv6>,
    /// Obfuscation server in front of this host.
    #[serde(default)]
    pub v2ray: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub gateway: String,
    #[serde(default)]
    pub country_code: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub isp: String,
    pub hosts: Vec<ServerHost>,
}

impl Server {
    /// Gateway id without the domain, e.g. `nl4` for `nl4.gw.example.net`.
    pub fn gateway_id(&self) -> &str {
        self.gateway.split('.').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsInfo {
    pub ip: Option<IpAddr>,
    #[serde(rename = "multihop-ip")]
    pub multihop_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AntitrackerInfo {
    pub default: DnsInfo,
    pub hardcore: DnsInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiInfo {
    pub ips: Vec<IpAddr>,
    pub ipv6s: Vec<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct V2RayInfo {
    /// VMESS user id.
    pub id: String,
    pub quic_port: u16,
    pub tcp_port: u16,
    pub tls_server_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServersConfig {
    pub antitracker: AntitrackerInfo,
    pub api: ApiInfo,
    pub v2ray: Option<V2RayInfo>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerCatalogue {
    pub wireguard: Vec<Server>,
    pub openvpn: Vec<Server>,
    pub config: ServersConfig,
}

impl ServerCatalogue {
    pub fn servers(&self, vpn_type: VpnType) -> &[Server] {
        match vpn_type {
            VpnType::WireGuard => &self.wireguard,
            VpnType::OpenVpn => &self.openvpn,
        }
    }

    /// Provider resolver that filters trackers.
    pub fn antitracker_dns(&self, hardcore: bool, multihop: bool) -> Option<IpAddr> {
        let info = if hardcore {
            &self.config.antitracker.hardcore
        } else {
            &self.config.antitracker.default
        };
        if multihop {
            info.multihop_ip
        } else {
            info.ip
        }
    }

    pub fn api_ips(&self) -> Vec<IpAddr> {
        self.config.api.ips.iter().chain(&self.config.api.ipv6s).copied().collect()
    }

    pub fn find_server(&self, vpn_type: VpnType, gateway: &str) -> Option<&Server> {
        self.servers(vpn_type)
            .iter()
            .find(|s| s.gateway == gateway || s.gateway_id() == gateway)
    }

    pub fn find_host(&self, ip: IpAddr) -> Option<(&Server, &ServerHost)> {
        self.wireguard
            .iter()
            .chain(&self.openvpn)
            .find_map(|s| s.hosts.iter().find(|h| h.host == ip).map(|h| (s, h)))
    }

    /// Random host of `server`.
    pub fn pick_host<'a, R: Rng + ?Sized>(server: &'a Server, rng: &mut R) -> Option<&'a ServerHost> {
        if server.hosts.is_empty() {
            return None;
        }
        server.hosts.get(rng.random_range(0..server.hosts.len()))
    }

    /// WireGuard peer data of a host.
    pub fn wireguard_host(host: &ServerHost) -> VpnResult<WireGuardHost> {
        let public_key = host.public_key.clone().ok_or_else(|| VpnError::bad_parameter("public_key"))?;
        let local_ip = host.local_ip.ok_or_else(|| VpnError::bad_parameter("local_ip"))?;
        Ok(WireGuardHost {
            public_key,
            local_ip,
            ipv6_prefix: host.ipv6.as_ref().and_then(|v6| match v6.local_ip {
                // The client address is the /64 of the host plus the IPv4 text.
                Some(IpAddr::V6(ip)) => {
                    let s = ip.segments();
                    Some(format!("{:x}:{:x}:{:x}:{:x}::", s[0], s[1], s[2], s[3]))
                }
                _ => None,
            }),
        })
    }

    /// Obfuscation endpoint in front of `host`, if the list has one.
    pub fn obfuscation_for(&self, host: &ServerHost, transport: V2RayTransport) -> Option<ObfuscationSpec> {
        let v2ray = self.config.v2ray.as_ref()?;
        let port = match transport {
            V2RayTransport::Quic => v2ray.quic_port,
            V2RayTransport::Tcp => v2ray.tcp_port,
        };
        if port == 0 || v2ray.id.is_empty() {
            return None;
        }
        Some(ObfuscationSpec {
            transport,
            host: host.v2ray?,
            port,
            id: v2ray.id.clone(),
            tls_server_name: v2ray.tls_server_name.clone(),
        })
    }
}

// ============================================================================
// Store
// ============================================================================

/// Downloads the server list.
#[async_trait]
pub trait ServersFetcher: Send + Sync {
    async fn fetch(&self) -> VpnResult<ServerCatalogue>;
}

/// Server list with a JSON cache in the state directory.
pub struct ServersStore {
    cache: PathBuf,
    fetcher: Option<Arc<dyn ServersFetcher>>,
    current: Mutex<Option<ServerCatalogue>>,
}

impl ServersStore {
    pub fn new(cache: PathBuf, fetcher: Option<Arc<dyn ServersFetcher>>) -> Self {
        Self {
            cache,
            fetcher,
            current: Mutex::new(None),
        }
    }

    /// Catalogue from memory, the cache or the fetcher, in that order.
    /// `force` skips straight to the fetcher.
    pub async fn get(&self, force: bool) -> VpnResult<ServerCatalogue> {
        let mut current = self.current.lock().await;
        if !force {
            if let Some(catalogue) = current.as_ref() {
                return Ok(catalogue.clone());
            }
            if let Some(catalogue) = self.read_cache() {
                *current = Some(catalogue.clone());
                return Ok(catalogue);
            }
        }

        let fetcher = self
            .fetcher
            .as_ref()
            .ok_or_else(|| VpnError::not_available("servers API"))?;
        let catalogue = fetcher.fetch().await?;
        log::info!(
            "Servers updated ({} WireGuard, {} OpenVPN)",
            catalogue.wireguard.len(),
            catalogue.openvpn.len()
        );
        if let Err(e) = self.write_cache(&catalogue) {
            log::warn!("Failed to cache servers: {}", e);
        }
        *current = Some(catalogue.clone());
        Ok(catalogue)
    }

    /// Cached catalogue without touching the network.
    pub async fn cached(&self) -> Option<ServerCatalogue> {
        let mut current = self.current.lock().await;
        if current.is_none() {
            *current = self.read_cache();
        }
        current.clone()
    }

    fn read_cache(&self) -> Option<ServerCatalogue> {
        let data = std::fs::read(&self.cache).ok()?;
        match serde_json::from_slice(&data) {
            Ok(catalogue) => Some(catalogue),
            Err(e) => {
                log::warn!("Ignoring unreadable servers cache: {}", e);
                None
            }
        }
    }

    fn write_cache(&self, catalogue: &ServerCatalogue) -> VpnResult<()> {
        let data = serde_json::to_vec(catalogue)
            .map_err(|e| VpnError::internal(format!("failed to serialize servers: {}", e)))?;
        write_private_file(&self.cache, &data)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const CATALOGUE: &str = r#"{
        "wireguard": [{
            "gateway": "us-ca.wg.example.net", "country_code": "US", "country": "United States",
            "city": "Los Angeles", "isp": "Datapacket",
            "hosts": [
                {"hostname": "us-ca1.wg.example.net", "host": "185.253.97.12", "multihop_port": 2049,
                 "load": 12.5, "public_key": "oX/+u0tLhV8+S1SdhqbtGKyLq+Mh7k4wxNbeQ5k4b0Q=",
                 "local_ip": "172.21.0.1", "ipv6": {"local_ip": "fd00:4956:504e:ffff::ac15:1"},
                 "v2ray": "185.253.97.100"},
                {"hostname": "us-ca2.wg.example.net", "host": "185.253.97.13", "load": 40.0,
                 "public_key": "oX/+u0tLhV8+S1SdhqbtGKyLq+Mh7k4wxNbeQ5k4b0Q=", "local_ip": "172.21.0.1"}
            ]
        }],
        "openvpn": [{
            "gateway": "nl4.gw.example.net", "country_code": "NL", "city": "Amsterdam",
            "hosts": [{"hostname": "nl4.gw.example.net", "host": "95.211.172.68", "multihop_port": 23001}]
        }],
        "config": {
            "antitracker": {
                "default": {"ip": "10.0.254.2", "multihop-ip": "10.0.254.102"},
                "hardcore": {"ip": "10.0.254.3", "multihop-ip": "10.0.254.103"}
            },
            "api": {"ips": ["198.50.177.220"], "ipv6s": ["2607:5300:203:1735::8888"]},
            "v2ray": {"id": "27de860d-5601-412d-8b71-baa048a94b98", "quic_port": 443, "tcp_port": 80}
        }
    }"#;

    pub(crate) fn catalogue() -> ServerCatalogue {
        serde_json::from_str(CATALOGUE).unwrap()
    }

    #[test]
    fn test_antitracker_lookup() {
        let c = catalogue();
        assert_eq!(c.antitracker_dns(false, false), Some("10.0.254.2".parse().unwrap()));
        assert_eq!(c.antitracker_dns(true, false), Some("10.0.254.3".parse().unwrap()));
        assert_eq!(c.antitracker_dns(true, true), Some("10.0.254.103".parse().unwrap()));
        assert_eq!(ServerCatalogue::default().antitracker_dns(false, false), None);
    }

    #[test]
    fn test_api_ips_and_lookup() {
        let c = catalogue();
        assert_eq!(c.api_ips().len(), 2);
        let (server, host) = c.find_host("95.211.172.68".parse().unwrap()).unwrap();
        assert_eq!(server.gateway_id(), "nl4");
        assert_eq!(host.multihop_port, 23001);
        assert!(c.find_server(VpnType::OpenVpn, "nl4").is_some());
        assert!(c.find_server(VpnType::WireGuard, "nl4").is_none());
    }

    #[test]
    fn test_wireguard_host_and_obfuscation() {
        let c = catalogue();
        let host = &c.wireguard[0].hosts[0];
        let wg = ServerCatalogue::wireguard_host(host).unwrap();
        assert_eq!(wg.local_ip, Ipv4Addr::new(172, 21, 0, 1));
        assert_eq!(wg.ipv6_prefix.as_deref(), Some("fd00:4956:504e:ffff::"));

        let obfs = c.obfuscation_for(host, V2RayTransport::Quic).unwrap();
        assert_eq!(obfs.port, 443);
        assert_eq!(obfs.host, "185.253.97.100".parse::<IpAddr>().unwrap());
        assert!(c.obfuscation_for(&c.wireguard[0].hosts[1], V2RayTransport::Tcp).is_none());
    }

    #[test]
    fn test_pick_host_is_seeded() {
        let c = catalogue();
        let server = &c.wireguard[0];
        let mut a = ChaCha8Rng::seed_from_u64(7);
        let mut b = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..8 {
            assert_eq!(
                ServerCatalogue::pick_host(server, &mut a).map(|h| h.host),
                ServerCatalogue::pick_host(server, &mut b).map(|h| h.host)
            );
        }
    }

    struct CountingFetcher(AtomicUsize);

    #[async_trait]
    impl ServersFetcher for CountingFetcher {
        async fn fetch(&self) -> VpnResult<ServerCatalogue> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(catalogue())
        }
    }

    #[tokio::test]
    async fn test_store_uses_cache_unless_forced() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("servers.json");
        let fetcher = Arc::new(CountingFetcher(AtomicUsize::new(0)));
        let store = ServersStore::new(cache.clone(), Some(fetcher.clone()));

        store.get(false).await.unwrap();
        store.get(false).await.unwrap();
        assert_eq!(fetcher.0.load(Ordering::SeqCst), 1);
        store.get(true).await.unwrap();
        assert_eq!(fetcher.0.load(Ordering::SeqCst), 2);

        // A fresh store without a fetcher serves the cache.
        let offline = ServersStore::new(cache, None);
        assert_eq!(offline.get(false).await.unwrap(), catalogue());
        assert!(matches!(offline.get(true).await, Err(VpnError::NotAvailable { .. })));
    }
}
