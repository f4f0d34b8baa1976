use super::backend::DnsBackend;
use super::journal::DnsJournal;
use super::proxy::EncryptedDnsProxy;
use super::DnsSettings;
use crate::error::{VpnError, VpnResult};
use crate::route::RoutingTable;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use vpnd_common::net::Family;

#[derive(Debug, Clone)]
struct Applied {
    settings: DnsSettings,
    local_ip: IpAddr,
}

/// Applies tunnel resolvers and guarantees the previous ones come back.
///
/// Before the first change the backend's view of the prior configuration is
/// written to the journal; every later change within the same override
/// leaves the journal untouched, so a revert always returns to the state
/// before the tunnel came up.
pub struct DnsController {
    backend: Arc<dyn DnsBackend>,
    proxy: Arc<dyn EncryptedDnsProxy>,
    journal: DnsJournal,
    routes: Arc<dyn RoutingTable>,
    applied: Mutex<Option<Applied>>,
}

impl DnsController {
    pub fn new(
        backend: Arc<dyn DnsBackend>,
        proxy: Arc<dyn EncryptedDnsProxy>,
        journal: DnsJournal,
        routes: Arc<dyn RoutingTable>,
    ) -> Self {
        Self {
            backend,
            proxy,
            journal,
            routes,
            applied: Mutex::new(None),
        }
    }

    /// Resolver currently forced by the daemon.
    pub async fn current(&self) -> Option<DnsSettings> {
        self.applied.lock().await.as_ref().map(|a| a.settings.clone())
    }

    /// Forwarder executable, for the firewall's application allow-list.
    pub fn proxy_binary(&self) -> Option<PathBuf> {
        self.proxy.binary()
    }

    /// Use the tunnel's own resolver.
    pub async fn set_default(&self, ip: IpAddr, local_ip: IpAddr) -> VpnResult<()> {
        self.set_manual(&DnsSettings::plain(ip), local_ip).await
    }

    /// Use a user-selected resolver; DoH/DoT goes through the local forwarder.
    pub async fn set_manual(&self, settings: &DnsSettings, local_ip: IpAddr) -> VpnResult<()> {
        settings.validate()?;
        let target = settings
            .address()
            .ok_or_else(|| VpnError::bad_parameter("dns.host"))?;

        let mut applied = self.applied.lock().await;

        let effective = if settings.is_encrypted() {
            self.proxy.start(settings).await?
        } else {
            self.proxy.stop().await;
            target
        };

        if let Err(e) = self.apply_locked(effective, local_ip).await {
            log::error!("Failed to set DNS {}: {}", settings.info_string(), e);
            self.proxy.stop().await;
            self.revert_locked(&mut applied).await;
            return Err(e);
        }

        log::info!("DNS set to {}", settings.info_string());
        *applied = Some(Applied {
            settings: settings.clone(),
            local_ip,
        });
        Ok(())
    }

    /// Drop the manual resolver and fall back to `previous_default`, or to
    /// the system configuration if there is none.
    pub async fn delete_manual(&self, previous_default: Option<IpAddr>, local_ip: IpAddr) -> VpnResult<()> {
        match previous_default {
            Some(ip) => self.set_default(ip, local_ip).await,
            None => {
                self.revert().await;
                Ok(())
            }
        }
    }

    /// Restore the resolvers recorded in the journal and stop the forwarder.
    pub async fn revert(&self) {
        let mut applied = self.applied.lock().await;
        self.revert_locked(&mut applied).await;
    }

    /// Finish a revert left behind by a previous daemon instance.
    ///
    /// Returns true if a journal was found.
    pub async fn recover(&self) -> VpnResult<bool> {
        let Some(entries) = self.journal.load(self.backend.name())? else {
            return Ok(false);
        };
        log::warn!("Found DNS journal from an unclean shutdown, restoring resolvers");
        self.backend.restore(&entries).await?;
        self.journal.clear()?;
        Ok(true)
    }

    /// True once the OS has a default route to send traffic through.
    pub async fn is_primary_interface_found(&self) -> bool {
        self.routes.default_gateway(Family::V4).await.is_ok()
    }

    /// Local address the current override is bound to.
    pub async fn local_ip(&self) -> Option<IpAddr> {
        self.applied.lock().await.as_ref().map(|a| a.local_ip)
    }

    async fn apply_locked(&self, dns: IpAddr, local_ip: IpAddr) -> VpnResult<()> {
        if !self.journal.exists() {
            let entries = self.backend.snapshot(local_ip).await?;
            self.journal.save(self.backend.name(), &entries)?;
        }
        self.backend.apply(dns, local_ip).await
    }

    async fn revert_locked(&self, applied: &mut Option<Applied>) {
        self.proxy.stop().await;
        match self.journal.load(self.backend.name()) {
            Ok(Some(entries)) => {
                if let Err(e) = self.backend.restore(&entries).await {
                    log::error!("Failed to restore DNS: {}", e);
                    return;
                }
                if let Err(e) = self.journal.clear() {
                    log::warn!("Failed to remove DNS journal: {}", e);
                }
                log::info!("DNS restored");
            }
            Ok(None) => {}
            Err(e) => log::error!("Failed to read DNS journal: {}", e),
        }
        *applied = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::backend::MemoryDnsBackend;
    use crate::dns::proxy::NoEncryptedDns;
    use crate::dns::DnsEncryption;
    use crate::route::MemoryRoutingTable;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn controller(dir: &std::path::Path, backend: &MemoryDnsBackend) -> DnsController {
        DnsController::new(
            Arc::new(backend.clone()),
            Arc::new(NoEncryptedDns),
            DnsJournal::new(&dir.join("dns_journal.json")),
            Arc::new(MemoryRoutingTable::new()),
        )
    }

    #[tokio::test]
    async fn test_revert_returns_to_pre_tunnel_state() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryDnsBackend::with_system(vec![ip("192.168.1.1")]);
        let dns = controller(dir.path(), &backend);

        dns.set_default(ip("172.21.0.1"), ip("172.21.0.5")).await.unwrap();
        dns.set_manual(&DnsSettings::plain(ip("9.9.9.9")), ip("172.21.0.5")).await.unwrap();
        assert_eq!(backend.system(), vec![ip("9.9.9.9")]);
        assert_eq!(dns.current().await, Some(DnsSettings::plain(ip("9.9.9.9"))));

        dns.revert().await;
        assert_eq!(backend.system(), vec![ip("192.168.1.1")]);
        assert!(dns.current().await.is_none());
        assert!(!dir.path().join("dns_journal.json").exists());
    }

    #[tokio::test]
    async fn test_failed_apply_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryDnsBackend::with_system(vec![ip("192.168.1.1")]);
        let dns = controller(dir.path(), &backend);
        backend.fail_apply(true);

        assert!(dns.set_default(ip("10.0.0.1"), ip("10.0.0.2")).await.is_err());
        assert_eq!(backend.system(), vec![ip("192.168.1.1")]);
        assert!(!dir.path().join("dns_journal.json").exists());
    }

    #[tokio::test]
    async fn test_recover_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryDnsBackend::with_system(vec![ip("192.168.1.1")]);
        {
            let dns = controller(dir.path(), &backend);
            dns.set_default(ip("10.0.0.1"), ip("10.0.0.2")).await.unwrap();
            // Dropped without revert.
        }
        assert_eq!(backend.system(), vec![ip("10.0.0.1")]);

        let dns = controller(dir.path(), &backend);
        assert!(dns.recover().await.unwrap());
        assert_eq!(backend.system(), vec![ip("192.168.1.1")]);
        assert!(!dns.recover().await.unwrap());
    }

    #[tokio::test]
    async fn test_encrypted_without_forwarder_is_not_available() {
        let dir = tempfile::tempdir().unwrap();
        let backend = MemoryDnsBackend::default();
        let dns = controller(dir.path(), &backend);
        let settings = DnsSettings {
            host: Some(ip("1.1.1.1")),
            encryption: DnsEncryption::DoH,
            template: "https://cloudflare-dns.com/dns-query".into(),
        };
        let err = dns.set_manual(&settings, ip("10.0.0.2")).await.unwrap_err();
        assert!(matches!(err, VpnError::NotAvailable { .. }));
        assert_eq!(backend.applies(), 0);
    }

    #[tokio::test]
    async fn test_primary_interface_probe() {
        let dir = tempfile::tempdir().unwrap();
        let routes = MemoryRoutingTable::new();
        let dns = DnsController::new(
            Arc::new(MemoryDnsBackend::default()),
            Arc::new(NoEncryptedDns),
            DnsJournal::new(&dir.path().join("j.json")),
            Arc::new(routes.clone()),
        );
        assert!(!dns.is_primary_interface_found().await);
        routes.set_default_gateway(ip("192.168.1.1"));
        assert!(dns.is_primary_interface_found().await);
    }
}
