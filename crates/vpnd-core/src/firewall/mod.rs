//! Kill-switch firewall.
//!
//! [`Firewall`] owns the high-level [`FirewallState`] and serializes every
//! change under one mutex. Each operation computes the next state, renders
//! the complete rule list for it and hands the list to the native backend
//! as one atomic replacement; the new state is committed only after the
//! backend accepted it. Backends never see partial rule sets.

mod memory;
mod nft;
mod pf;
pub mod rules;
#[cfg(windows)]
mod wfp;

pub use memory::MemoryBackend;
pub use nft::NftBackend;
pub use pf::PfBackend;
#[cfg(windows)]
pub use wfp::WfpBackend;

use crate::error::{VpnError, VpnResult};
use async_trait::async_trait;
use ipnet::IpNet;
use rules::{build_rules, build_single_dns_rules, Packet, RuleContext, RuleSet, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use vpnd_common::config::BinaryPaths;
use vpnd_common::net::{all_local_non_routable, host_net, Family};
use vpnd_common::CommandRunner;

/// Interval between persistent-mode re-checks.
pub const REASSERT_INTERVAL: Duration = Duration::from_secs(5);

/// How long after start-up the persistent rules are re-checked.
pub const REASSERT_WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// State
// ============================================================================

/// Active tunnel as seen by the firewall.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEndpoint {
    /// Client address inside the tunnel.
    pub local_ip: Ipv4Addr,
    #[serde(default)]
    pub local_ip6: Option<Ipv6Addr>,
    pub local_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub tcp: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostException {
    /// Survives `client_disconnected`.
    pub persistent: bool,
    pub icmp_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FirewallState {
    pub enabled: bool,
    pub persistent: bool,
    pub allow_lan: bool,
    pub allow_lan_multicast: bool,
    pub allow_api_servers: bool,
    pub api_servers: Vec<IpAddr>,
    pub user_exceptions: Vec<IpNet>,
    pub dns_pin: Option<IpAddr>,
    pub client_endpoint: Option<ClientEndpoint>,
    pub host_exceptions: BTreeMap<IpAddr, HostException>,
    /// Resolver allowed by the stand-alone DNS rule (kill-switch off).
    pub single_dns_rule: Option<IpAddr>,
}

// ============================================================================
// Backend trait
// ============================================================================

/// Native packet filter.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Replace every kill-switch rule with `rules` in one transaction.
    async fn apply(&self, rules: &RuleSet) -> VpnResult<()>;

    /// Remove every kill-switch rule.
    async fn remove(&self) -> VpnResult<()>;

    /// True when the kill-switch rules are present in the kernel.
    async fn is_installed(&self) -> VpnResult<bool>;

    /// Install (`Some`) or remove (`None`) the stand-alone DNS rule set.
    async fn set_single_dns_rule(&self, rules: Option<&RuleSet>) -> VpnResult<()>;

    /// Whether per-executable rules can be expressed.
    fn supports_application_rules(&self) -> bool {
        false
    }
}

/// Native backend for the running platform.
pub fn platform_backend(runner: Arc<dyn CommandRunner>, binaries: &BinaryPaths) -> VpnResult<Arc<dyn FirewallBackend>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(NftBackend::new(runner, binaries)))
    }
    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(PfBackend::new(runner, binaries)))
    }
    #[cfg(windows)]
    {
        let _ = (runner, binaries);
        Ok(Arc::new(WfpBackend::open()?))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = (runner, binaries);
        Err(VpnError::not_available("firewall"))
    }
}

/// Source of LAN networks allowed when `allow_lan` is set.
pub type LanSource = Arc<dyn Fn() -> Vec<IpNet> + Send + Sync>;

/// Non-routable networks on up interfaces, both families.
pub fn system_lan_source() -> LanSource {
    Arc::new(|| {
        let mut nets = Vec::new();
        for family in [Family::V4, Family::V6] {
            match all_local_non_routable(family) {
                Ok(found) => nets.extend(found),
                Err(e) => log::warn!("Failed to enumerate local networks: {}", e),
            }
        }
        nets
    })
}

/// Parse a comma- or space-separated list of IPs and CIDRs.
///
/// Bare addresses become host networks.
pub fn parse_user_exceptions(text: &str) -> VpnResult<Vec<IpNet>> {
    let mut nets = Vec::new();
    for item in text.split(|c: char| c == ',' || c.is_whitespace()) {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let net = if item.contains('/') {
            item.parse::<IpNet>().ok().map(|n| n.trunc())
        } else {
            item.parse::<IpAddr>().ok().map(host_net)
        }
        .ok_or_else(|| VpnError::bad_parameter("userExceptions"))?;
        if !nets.contains(&net) {
            nets.push(net);
        }
    }
    Ok(nets)
}

// ============================================================================
// Firewall service
// ============================================================================

struct Inner {
    state: FirewallState,
    applications: Vec<PathBuf>,
}

/// Kill-switch service shared by the manager, IPC and policy engine.
pub struct Firewall {
    backend: Arc<dyn FirewallBackend>,
    lan: LanSource,
    inner: Mutex<Inner>,
}

impl Firewall {
    pub fn new(backend: Arc<dyn FirewallBackend>, lan: LanSource) -> Self {
        Self {
            backend,
            lan,
            inner: Mutex::new(Inner {
                state: FirewallState::default(),
                applications: Vec::new(),
            }),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Bring the native rules in line with a state restored from disk.
    ///
    /// Persistent state is re-installed; anything else left behind by a
    /// previous instance is removed.
    pub async fn init(&self, restored: FirewallState) -> VpnResult<()> {
        let mut inner = self.inner.lock().await;
        let mut state = FirewallState {
            client_endpoint: None,
            dns_pin: None,
            single_dns_rule: None,
            ..restored
        };
        state.host_exceptions.retain(|_, e| e.persistent);
        if state.persistent {
            state.enabled = true;
        }

        if state.enabled {
            self.backend.apply(&self.render(&state, &inner.applications)).await?;
            log::info!("Kill-switch restored (persistent: {})", state.persistent);
        } else if let Err(e) = self.backend.remove().await {
            log::debug!("No stale kill-switch rules removed: {}", e);
        }
        inner.state = state;
        Ok(())
    }

    pub async fn state(&self) -> FirewallState {
        self.inner.lock().await.state.clone()
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.lock().await.state.enabled
    }

    pub async fn set_enabled(&self, enable: bool) -> VpnResult<FirewallState> {
        let mut inner = self.inner.lock().await;
        if !enable && inner.state.persistent {
            return Err(VpnError::conflict("cannot disable firewall while always-on"));
        }
        if inner.state.enabled == enable {
            return Ok(inner.state.clone());
        }

        // The stand-alone DNS rule and the kill-switch never coexist.
        if inner.state.single_dns_rule.is_some() {
            self.backend.set_single_dns_rule(None).await?;
            inner.state.single_dns_rule = None;
        }

        let mut next = inner.state.clone();
        next.enabled = enable;
        if enable {
            let rules = self.render(&next, &inner.applications);
            if let Err(e) = self.backend.apply(&rules).await {
                log::error!("Failed to enable kill-switch: {}", e);
                if let Err(e) = self.backend.remove().await {
                    log::warn!("Kill-switch rollback failed: {}", e);
                }
                return Err(e);
            }
            log::info!("Kill-switch enabled ({} rules)", rules.rules.len());
        } else {
            self.backend.remove().await?;
            log::info!("Kill-switch disabled");
        }
        inner.state = next;
        Ok(inner.state.clone())
    }

    /// Always-on mode. Turning it on also enables the kill-switch.
    pub async fn set_persistent(&self, persistent: bool) -> VpnResult<FirewallState> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state.single_dns_rule.is_some() && persistent {
                self.backend.set_single_dns_rule(None).await?;
                inner.state.single_dns_rule = None;
            }
        }
        let state = self
            .update(|s| {
                s.persistent = persistent;
                if persistent {
                    s.enabled = true;
                }
                Ok(())
            })
            .await?;
        log::info!("Kill-switch persistent: {}", persistent);
        Ok(state)
    }

    /// Narrow the allow-list to the established tunnel.
    pub async fn client_connected(&self, endpoint: ClientEndpoint) -> VpnResult<()> {
        log::info!(
            "Kill-switch: tunnel {} -> {}:{}",
            endpoint.local_ip,
            endpoint.server_ip,
            endpoint.server_port
        );
        self.update(|s| {
            if let Some(e) = s.host_exceptions.get(&endpoint.server_ip) {
                if !e.persistent {
                    s.host_exceptions.remove(&endpoint.server_ip);
                }
            }
            s.client_endpoint = Some(endpoint);
            Ok(())
        })
        .await
        .map(|_| ())
    }

    /// Drop tunnel allows and every non-persistent exception.
    pub async fn client_disconnected(&self) -> VpnResult<()> {
        self.update(|s| {
            s.client_endpoint = None;
            s.dns_pin = None;
            s.host_exceptions.retain(|_, e| e.persistent);
            Ok(())
        })
        .await
        .map(|_| ())
    }

    pub async fn allow_lan(&self, lan: bool, multicast: bool) -> VpnResult<FirewallState> {
        if multicast && !lan {
            return Err(VpnError::conflict(
                "LAN communication and LAN multicast must agree",
            ));
        }
        self.update(|s| {
            s.allow_lan = lan;
            s.allow_lan_multicast = multicast;
            Ok(())
        })
        .await
    }

    pub async fn set_allow_api_servers(&self, allow: bool) -> VpnResult<FirewallState> {
        self.update(|s| {
            s.allow_api_servers = allow;
            Ok(())
        })
        .await
    }

    pub async fn set_api_servers(&self, ips: Vec<IpAddr>) -> VpnResult<()> {
        self.update(|s| {
            s.api_servers = ips;
            Ok(())
        })
        .await
        .map(|_| ())
    }

    pub async fn add_host_exceptions(&self, ips: &[IpAddr], icmp_only: bool, persistent: bool) -> VpnResult<()> {
        self.update(|s| {
            for ip in ips {
                let entry = s.host_exceptions.entry(*ip).or_insert(HostException {
                    persistent,
                    icmp_only,
                });
                entry.persistent |= persistent;
                // A full exception is never narrowed to ICMP.
                entry.icmp_only &= icmp_only;
            }
            Ok(())
        })
        .await
        .map(|_| ())
    }

    pub async fn remove_host_exceptions(&self, ips: &[IpAddr]) -> VpnResult<()> {
        self.update(|s| {
            for ip in ips {
                s.host_exceptions.remove(ip);
            }
            Ok(())
        })
        .await
        .map(|_| ())
    }

    /// Pin port 53 to `dns`; `None` (encrypted DNS) leaves no exemption.
    pub async fn on_dns_changed(&self, dns: Option<IpAddr>) -> VpnResult<()> {
        self.update(|s| {
            s.dns_pin = dns;
            Ok(())
        })
        .await
        .map(|_| ())
    }

    pub async fn set_user_exceptions(&self, nets: Vec<IpNet>) -> VpnResult<FirewallState> {
        self.update(|s| {
            s.user_exceptions = nets;
            Ok(())
        })
        .await
    }

    /// Executables allowed regardless of destination.
    pub async fn set_allowed_applications(&self, apps: Vec<PathBuf>) -> VpnResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.applications == apps {
            return Ok(());
        }
        if inner.state.enabled {
            self.backend.apply(&self.render(&inner.state, &apps)).await?;
        }
        inner.applications = apps;
        Ok(())
    }

    /// Block DNS to everything but `dns` while the kill-switch is off.
    pub async fn single_dns_rule_on(&self, dns: IpAddr) -> VpnResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state.enabled {
            return Err(VpnError::conflict(
                "single DNS rule is not allowed while the firewall is enabled",
            ));
        }
        self.backend
            .set_single_dns_rule(Some(&build_single_dns_rules(dns)))
            .await?;
        inner.state.single_dns_rule = Some(dns);
        log::info!("Single DNS rule on ({})", dns);
        Ok(())
    }

    pub async fn single_dns_rule_off(&self) -> VpnResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state.single_dns_rule.is_none() {
            return Ok(());
        }
        self.backend.set_single_dns_rule(None).await?;
        inner.state.single_dns_rule = None;
        log::info!("Single DNS rule off");
        Ok(())
    }

    /// Re-render with fresh LAN data; called on network changes.
    pub async fn refresh(&self) -> VpnResult<()> {
        let inner = self.inner.lock().await;
        if inner.state.enabled {
            self.backend.apply(&self.render(&inner.state, &inner.applications)).await?;
        }
        Ok(())
    }

    /// Verdict the current rules give `packet`.
    pub async fn classify(&self, packet: &Packet) -> Verdict {
        let inner = self.inner.lock().await;
        if inner.state.enabled {
            self.render(&inner.state, &inner.applications).classify(packet)
        } else if let Some(dns) = inner.state.single_dns_rule {
            build_single_dns_rules(dns).classify(packet)
        } else {
            Verdict::Allow
        }
    }

    /// Re-install persistent rules if something flushed them.
    ///
    /// Some distributions reset the packet filter during early boot after the
    /// daemon has started; the rules are checked every [`REASSERT_INTERVAL`]
    /// for [`REASSERT_WINDOW`].
    pub async fn reassert_persistent(self: Arc<Self>, cancel: CancellationToken) {
        let deadline = tokio::time::Instant::now() + REASSERT_WINDOW;
        let mut tick = tokio::time::interval(REASSERT_INTERVAL);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            if tokio::time::Instant::now() > deadline {
                return;
            }
            let inner = self.inner.lock().await;
            if !inner.state.persistent {
                return;
            }
            match self.backend.is_installed().await {
                Ok(true) => {}
                Ok(false) => {
                    log::warn!("Persistent kill-switch rules missing, re-applying");
                    let rules = self.render(&inner.state, &inner.applications);
                    if let Err(e) = self.backend.apply(&rules).await {
                        log::error!("Failed to re-apply kill-switch: {}", e);
                    }
                }
                Err(e) => log::warn!("Failed to check kill-switch rules: {}", e),
            }
        }
    }

    async fn update<F>(&self, change: F) -> VpnResult<FirewallState>
    where
        F: FnOnce(&mut FirewallState) -> VpnResult<()>,
    {
        let mut inner = self.inner.lock().await;
        let mut next = inner.state.clone();
        change(&mut next)?;
        if next == inner.state {
            return Ok(next);
        }
        if next.enabled {
            self.backend.apply(&self.render(&next, &inner.applications)).await?;
        }
        inner.state = next;
        Ok(inner.state.clone())
    }

    fn render(&self, state: &FirewallState, applications: &[PathBuf]) -> RuleSet {
        let applications = if self.backend.supports_application_rules() {
            applications.to_vec()
        } else {
            Vec::new()
        };
        let ctx = RuleContext {
            lan: if state.allow_lan { (self.lan)() } else { Vec::new() },
            applications,
        };
        build_rules(state, &ctx)
    }
}
