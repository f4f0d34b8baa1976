//! Split tunnelling.
//!
//! In direct mode the selected applications bypass the tunnel; in inverse
//! mode only they use it. [`SplitTunnel`] keeps the user's settings and the
//! current tunnel addresses, derives the effective [`SplitConfig`] and hands
//! it to the platform backend.
//!
//! Inverse mode without a VPN either lets the selected applications use the
//! normal route (`allow_when_no_vpn`) or binds them to black-hole addresses
//! so that their connections fail instead of leaking.

mod driver;
#[cfg(windows)]
mod ioctl;
mod linux;
mod procfs;

pub use driver::{encode_addresses, encode_apps, DriverBackend, SplitDriver};
#[cfg(windows)]
pub use ioctl::IoctlDriver;
pub use linux::CgroupBackend;
pub use procfs::RunningApp;

use crate::error::{VpnError, VpnResult};
use crate::netchange::NetChangeEvent;
use crate::route::RoutingTable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use vpnd_common::config::BinaryPaths;
use vpnd_common::net::{outbound_ip, Family};
use vpnd_common::CommandRunner;

/// Tunnel address given to included applications when there is no tunnel
/// (TEST-NET-1, never routed).
pub const BLACKHOLE_V4: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 255);

/// Discard-only prefix `0100::/64`.
pub const BLACKHOLE_V6: Ipv6Addr = Ipv6Addr::new(0x0100, 0, 0, 0, 0, 0, 0, 1);

/// Quiet period before split routes are re-installed after routing events.
pub const ROUTE_REAPPLY_DEBOUNCE: Duration = Duration::from_secs(2);

// ============================================================================
// Configuration
// ============================================================================

/// Addresses the backend binds split traffic to.
///
/// `public_*` is the address of the physical interface, `tunnel_*` the
/// client address inside the tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigAddresses {
    pub public_v4: Option<Ipv4Addr>,
    pub tunnel_v4: Option<Ipv4Addr>,
    pub public_v6: Option<Ipv6Addr>,
    pub tunnel_v6: Option<Ipv6Addr>,
}

impl ConfigAddresses {
    /// At least one family has both addresses.
    pub fn is_usable(&self) -> bool {
        (self.public_v4.is_some() && self.tunnel_v4.is_some())
            || (self.public_v6.is_some() && self.tunnel_v6.is_some())
    }

    pub fn is_blackhole(&self) -> bool {
        self.tunnel_v4 == Some(BLACKHOLE_V4) || self.tunnel_v6 == Some(BLACKHOLE_V6)
    }

    /// Public and tunnel addresses exchanged, as inverse mode needs.
    pub fn swapped(self) -> Self {
        Self {
            public_v4: self.tunnel_v4,
            tunnel_v4: self.public_v4,
            public_v6: self.tunnel_v6,
            tunnel_v6: self.public_v6,
        }
    }
}

/// User-facing split-tunnel settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SplitTunnelState {
    pub enabled: bool,
    pub inverse: bool,
    pub allow_when_no_vpn: bool,
    /// Executable paths (Windows) or launcher commands (Linux).
    pub apps: Vec<String>,
    pub running_pids: BTreeSet<u32>,
}

/// What the backend is asked to enforce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitConfig {
    /// Splitting is in effect at all.
    pub active: bool,
    pub inverse: bool,
    pub vpn_enabled: bool,
    pub addrs: ConfigAddresses,
    pub apps: Vec<String>,
}

/// Derive the backend configuration from settings and tunnel status.
pub fn effective_config(state: &SplitTunnelState, vpn_enabled: bool, mut addrs: ConfigAddresses) -> SplitConfig {
    let fail_closed = state.inverse && !state.allow_when_no_vpn;
    if !vpn_enabled {
        addrs.tunnel_v4 = None;
        addrs.tunnel_v6 = None;
        if state.enabled && fail_closed {
            addrs.tunnel_v4 = Some(BLACKHOLE_V4);
            addrs.tunnel_v6 = Some(BLACKHOLE_V6);
        }
    }
    SplitConfig {
        active: state.enabled && (vpn_enabled || fail_closed),
        inverse: state.inverse,
        vpn_enabled,
        addrs,
        apps: state.apps.clone(),
    }
}

// ============================================================================
// Backend contract
// ============================================================================

#[async_trait]
pub trait SplitTunnelBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// `NotAvailable` when this system cannot split traffic at all.
    fn availability(&self) -> VpnResult<()> {
        Ok(())
    }

    /// Replace whatever is enforced with `config`.
    async fn apply(&self, config: &SplitConfig) -> VpnResult<()>;

    async fn add_pid(&self, _pid: u32, _command: &str) -> VpnResult<()> {
        Err(VpnError::not_available("split tunnel by process"))
    }

    async fn remove_pid(&self, _pid: u32) -> VpnResult<()> {
        Err(VpnError::not_available("split tunnel by process"))
    }

    async fn running_apps(&self) -> VpnResult<Vec<RunningApp>> {
        Err(VpnError::not_available("split tunnel by process"))
    }

    /// Re-install routes the OS may have dropped.
    async fn reapply_routes(&self) -> VpnResult<()> {
        Ok(())
    }

    /// Remove everything, including leftovers of a previous run.
    async fn reset(&self) -> VpnResult<()>;
}

/// Backend for platforms without split tunnelling.
pub struct UnsupportedBackend;

#[async_trait]
impl SplitTunnelBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn availability(&self) -> VpnResult<()> {
        Err(VpnError::not_available("split tunnel"))
    }

    async fn apply(&self, config: &SplitConfig) -> VpnResult<()> {
        if config.active {
            return Err(VpnError::not_available("split tunnel"));
        }
        Ok(())
    }

    async fn reset(&self) -> VpnResult<()> {
        Ok(())
    }
}

pub fn platform_backend(
    runner: Arc<dyn CommandRunner>,
    binaries: &BinaryPaths,
    routes: Arc<dyn RoutingTable>,
) -> Arc<dyn SplitTunnelBackend> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(CgroupBackend::new(runner, binaries, routes))
    }
    #[cfg(windows)]
    {
        let _ = (runner, binaries);
        Arc::new(DriverBackend::new(Arc::new(IoctlDriver::new()), routes))
    }
    #[cfg(not(any(target_os = "linux", windows)))]
    {
        let _ = (runner, binaries, routes);
        Arc::new(UnsupportedBackend)
    }
}

/// Source of the physical interface address per family.
pub type PublicAddressSource = Arc<dyn Fn(Family) -> Option<IpAddr> + Send + Sync>;

pub fn system_public_address_source() -> PublicAddressSource {
    Arc::new(|family| outbound_ip(family).ok())
}

// ============================================================================
// Service
// ============================================================================

#[derive(Default)]
struct Inner {
    state: SplitTunnelState,
    vpn_enabled: bool,
    addrs: ConfigAddresses,
    applied: Option<SplitConfig>,
}

pub struct SplitTunnel {
    backend: Arc<dyn SplitTunnelBackend>,
    public_source: PublicAddressSource,
    inner: Mutex<Inner>,
}

impl SplitTunnel {
    pub fn new(backend: Arc<dyn SplitTunnelBackend>, public_source: PublicAddressSource) -> Self {
        Self {
            backend,
            public_source,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn availability(&self) -> VpnResult<()> {
        self.backend.availability()
    }

    /// Settings plus the processes currently split, where tracked.
    pub async fn state(&self) -> SplitTunnelState {
        let mut state = self.inner.lock().await.state.clone();
        if state.enabled {
            if let Ok(apps) = self.backend.running_apps().await {
                state.running_pids = apps.iter().map(|a| a.pid).collect();
            }
        }
        state
    }

    /// Set every input at once and enforce the result.
    pub async fn apply_config(
        &self,
        enabled: bool,
        inverse: bool,
        allow_when_no_vpn: bool,
        vpn_enabled: bool,
        addrs: ConfigAddresses,
        apps: Vec<String>,
    ) -> VpnResult<SplitConfig> {
        let mut inner = self.inner.lock().await;
        let mut state = inner.state.clone();
        state.enabled = enabled;
        state.inverse = inverse;
        state.allow_when_no_vpn = allow_when_no_vpn;
        state.apps = apps;
        self.commit(&mut inner, state, vpn_enabled, addrs).await
    }

    /// Change the user settings, keeping the tunnel status.
    pub async fn set_settings(
        &self,
        enabled: bool,
        inverse: bool,
        allow_when_no_vpn: bool,
        apps: Vec<String>,
    ) -> VpnResult<SplitConfig> {
        let mut inner = self.inner.lock().await;
        let (vpn_enabled, addrs) = (inner.vpn_enabled, inner.addrs);
        let mut state = inner.state.clone();
        state.enabled = enabled;
        state.inverse = inverse;
        state.allow_when_no_vpn = allow_when_no_vpn;
        state.apps = apps;
        self.commit(&mut inner, state, vpn_enabled, addrs).await
    }

    /// Tunnel came up or went down.
    pub async fn set_vpn(&self, vpn_enabled: bool, addrs: ConfigAddresses) -> VpnResult<SplitConfig> {
        let mut inner = self.inner.lock().await;
        let state = inner.state.clone();
        self.commit(&mut inner, state, vpn_enabled, addrs).await
    }

    pub async fn add_app(&self, app: &str) -> VpnResult<SplitConfig> {
        let app = app.trim();
        if app.is_empty() {
            return Err(VpnError::bad_parameter("app"));
        }
        let mut inner = self.inner.lock().await;
        let mut state = inner.state.clone();
        if !state.apps.iter().any(|a| a.eq_ignore_ascii_case(app)) {
            state.apps.push(app.to_string());
        }
        let (vpn_enabled, addrs) = (inner.vpn_enabled, inner.addrs);
        self.commit(&mut inner, state, vpn_enabled, addrs).await
    }

    pub async fn remove_app(&self, app: &str) -> VpnResult<SplitConfig> {
        let mut inner = self.inner.lock().await;
        let mut state = inner.state.clone();
        state.apps.retain(|a| !a.eq_ignore_ascii_case(app.trim()));
        let (vpn_enabled, addrs) = (inner.vpn_enabled, inner.addrs);
        self.commit(&mut inner, state, vpn_enabled, addrs).await
    }

    pub async fn add_pid(&self, pid: u32, command: &str) -> VpnResult<()> {
        if pid == 0 {
            return Err(VpnError::bad_parameter("pid"));
        }
        let inner = self.inner.lock().await;
        if !inner.applied.as_ref().is_some_and(|c| c.active) {
            return Err(VpnError::conflict("split tunnel is not enabled"));
        }
        log::info!("Adding PID {} to split tunnel", pid);
        self.backend.add_pid(pid, command).await
    }

    pub async fn remove_pid(&self, pid: u32) -> VpnResult<()> {
        if pid == 0 {
            return Err(VpnError::bad_parameter("pid"));
        }
        let _inner = self.inner.lock().await;
        self.backend.remove_pid(pid).await
    }

    pub async fn running_apps(&self) -> VpnResult<Vec<RunningApp>> {
        self.backend.running_apps().await
    }

    pub async fn reapply_routes(&self) -> VpnResult<()> {
        let inner = self.inner.lock().await;
        if inner.applied.as_ref().is_some_and(|c| c.active) {
            self.backend.reapply_routes().await?;
        }
        Ok(())
    }

    /// Remove all split-tunnel state from the system.
    pub async fn reset(&self) -> VpnResult<()> {
        let mut inner = self.inner.lock().await;
        inner.applied = None;
        self.backend.reset().await
    }

    /// Re-install split routes after routing events, debounced.
    pub async fn watch_routing(
        self: Arc<Self>,
        mut events: broadcast::Receiver<NetChangeEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
            // Collapse the burst that follows a link change.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(ROUTE_REAPPLY_DEBOUNCE) => break,
                    event = events.recv() => {
                        if let Err(broadcast::error::RecvError::Closed) = event {
                            break;
                        }
                    }
                }
            }
            if let Err(e) = self.reapply_routes().await {
                log::warn!("Failed to re-apply split-tunnel routes: {}", e);
            }
        }
    }

    async fn commit(
        &self,
        inner: &mut Inner,
        state: SplitTunnelState,
        vpn_enabled: bool,
        mut addrs: ConfigAddresses,
    ) -> VpnResult<SplitConfig> {
        if state.enabled {
            self.backend.availability()?;
        }
        if addrs.public_v4.is_none() {
            if let Some(IpAddr::V4(ip)) = (self.public_source)(Family::V4) {
                addrs.public_v4 = Some(ip);
            }
        }
        if addrs.public_v6.is_none() {
            if let Some(IpAddr::V6(ip)) = (self.public_source)(Family::V6) {
                addrs.public_v6 = Some(ip);
            }
        }

        let config = effective_config(&state, vpn_enabled, addrs);
        if inner.applied.as_ref() != Some(&config) {
            self.backend.apply(&config).await?;
            log::info!(
                "Split tunnel {} (inverse: {}, vpn: {}, apps: {})",
                if config.active { "active" } else { "inactive" },
                config.inverse,
                config.vpn_enabled,
                config.apps.len()
            );
            inner.applied = Some(config.clone());
        }
        inner.state = state;
        inner.vpn_enabled = vpn_enabled;
        inner.addrs = addrs;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingBackend {
        applied: StdMutex<Vec<SplitConfig>>,
    }

    #[async_trait]
    impl SplitTunnelBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn apply(&self, config: &SplitConfig) -> VpnResult<()> {
            self.applied.lock().unwrap().push(config.clone());
            Ok(())
        }

        async fn reset(&self) -> VpnResult<()> {
            Ok(())
        }
    }

    fn host_addresses() -> PublicAddressSource {
        Arc::new(|family| match family {
            Family::V4 => Some("192.168.1.57".parse().unwrap()),
            Family::V6 => Some("2001:db8::57".parse().unwrap()),
        })
    }

    fn service() -> (Arc<RecordingBackend>, SplitTunnel) {
        let backend = Arc::new(RecordingBackend::default());
        let st = SplitTunnel::new(backend.clone(), host_addresses());
        (backend, st)
    }

    #[tokio::test]
    async fn test_inverse_without_vpn_uses_blackhole() {
        let (backend, st) = service();
        let given = ConfigAddresses {
            tunnel_v4: Some("172.21.0.5".parse().unwrap()),
            ..Default::default()
        };
        let config = st
            .apply_config(true, true, false, false, given, vec!["/usr/bin/curl".into()])
            .await
            .unwrap();

        assert!(config.active);
        assert_eq!(
            config.addrs,
            ConfigAddresses {
                public_v4: Some("192.168.1.57".parse().unwrap()),
                tunnel_v4: Some(BLACKHOLE_V4),
                public_v6: Some("2001:db8::57".parse().unwrap()),
                tunnel_v6: Some(BLACKHOLE_V6),
            }
        );
        assert_eq!(backend.applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_inverse_allowed_without_vpn_is_inactive() {
        let (_, st) = service();
        let config = st
            .apply_config(true, true, true, false, ConfigAddresses::default(), vec!["firefox".into()])
            .await
            .unwrap();
        assert!(!config.active);
        assert!(config.addrs.tunnel_v4.is_none());
    }

    #[tokio::test]
    async fn test_direct_mode_follows_vpn() {
        let (backend, st) = service();
        st.set_settings(true, false, false, vec!["firefox".into()]).await.unwrap();
        let tunnel = ConfigAddresses {
            tunnel_v4: Some("172.21.0.5".parse().unwrap()),
            ..Default::default()
        };
        let up = st.set_vpn(true, tunnel).await.unwrap();
        assert!(up.active);
        assert_eq!(up.addrs.tunnel_v4, Some("172.21.0.5".parse().unwrap()));

        // Same inputs again are not re-applied.
        st.set_vpn(true, tunnel).await.unwrap();
        let down = st.set_vpn(false, ConfigAddresses::default()).await.unwrap();
        assert!(!down.active);
        assert_eq!(backend.applied.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_apps_are_deduplicated() {
        let (_, st) = service();
        st.add_app("/usr/bin/curl").await.unwrap();
        st.add_app("/USR/BIN/CURL").await.unwrap();
        assert_eq!(st.state().await.apps, vec!["/usr/bin/curl".to_string()]);
        st.remove_app("/usr/bin/curl").await.unwrap();
        assert!(st.state().await.apps.is_empty());
        assert!(matches!(st.add_app("  ").await, Err(VpnError::BadParameter { .. })));
    }

    #[tokio::test]
    async fn test_unsupported_platform_reports_not_available() {
        let st = SplitTunnel::new(Arc::new(UnsupportedBackend), host_addresses());
        let err = st.set_settings(true, false, false, vec![]).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotAvailable);
        // Disabled settings are still accepted.
        st.set_settings(false, false, false, vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_pid_requires_active_split() {
        let (_, st) = service();
        assert!(matches!(st.add_pid(42, "curl").await, Err(VpnError::Conflict { .. })));
        assert!(matches!(st.add_pid(0, "curl").await, Err(VpnError::BadParameter { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_reapply_is_debounced() {
        #[derive(Default)]
        struct Counting {
            reapplied: StdMutex<usize>,
        }

        #[async_trait]
        impl SplitTunnelBackend for Counting {
            fn name(&self) -> &'static str {
                "counting"
            }
            async fn apply(&self, _: &SplitConfig) -> VpnResult<()> {
                Ok(())
            }
            async fn reapply_routes(&self) -> VpnResult<()> {
                *self.reapplied.lock().unwrap() += 1;
                Ok(())
            }
            async fn reset(&self) -> VpnResult<()> {
                Ok(())
            }
        }

        let backend = Arc::new(Counting::default());
        let st = Arc::new(SplitTunnel::new(backend.clone(), host_addresses()));
        st.apply_config(true, false, false, true, ConfigAddresses::default(), vec!["x".into()])
            .await
            .unwrap();

        let (tx, rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(st.clone().watch_routing(rx, cancel.clone()));

        for _ in 0..5 {
            tx.send(NetChangeEvent::RoutingUpdate).unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        tokio::time::sleep(ROUTE_REAPPLY_DEBOUNCE * 2).await;
        assert_eq!(*backend.reapplied.lock().unwrap(), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
