//! Trusted-network policy.
//!
//! A [`WifiSource`] reports the current SSID; [`WifiMonitor`] polls it and
//! forwards debounced changes; [`evaluate`] turns the policy and the new
//! network into the ordered list of actions the manager applies.

use crate::error::{VpnError, VpnResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vpnd_common::config::BinaryPaths;
use vpnd_common::{CommandRunner, ShellCommand};

pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEBOUNCE: Duration = Duration::from_secs(1);

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiNetwork {
    pub ssid: String,
    pub is_trusted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrustActions {
    pub un_trusted_connect_vpn: bool,
    pub un_trusted_enable_firewall: bool,
    pub un_trusted_block_lan: bool,
    pub trusted_disconnect_vpn: bool,
    pub trusted_disable_firewall: bool,
}

impl Default for TrustActions {
    fn default() -> Self {
        Self {
            un_trusted_connect_vpn: true,
            un_trusted_enable_firewall: true,
            un_trusted_block_lan: true,
            trusted_disconnect_vpn: true,
            trusted_disable_firewall: true,
        }
    }
}

/// Persisted trusted-network settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WifiPolicy {
    /// Run actions even when no frontend is connected.
    pub can_apply_in_background: bool,
    #[serde(rename = "connectVPNOnInsecureNetwork")]
    pub connect_vpn_on_insecure_network: bool,
    pub trusted_networks_control: bool,
    /// Trust of networks not listed in `networks`; `None` means no action.
    pub default_trust_status_trusted: Option<bool>,
    pub networks: Vec<WifiNetwork>,
    pub actions: TrustActions,
}

impl WifiPolicy {
    /// Trust of `ssid`: explicit entry first, then the default.
    pub fn trust_of(&self, ssid: &str) -> Option<bool> {
        self.networks
            .iter()
            .find(|n| n.ssid == ssid)
            .map(|n| n.is_trusted)
            .or(self.default_trust_status_trusted)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WifiInfo {
    pub ssid: String,
    pub is_insecure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyAction {
    DisconnectVpn,
    DisableFirewall,
    ConnectVpn,
    EnableFirewall,
    BlockLan,
}

/// Actions for joining `wifi`, in application order.
///
/// `can_apply` is false when actions may not run right now (no frontend
/// connected and background actions are off); nothing is returned then.
pub fn evaluate(policy: &WifiPolicy, wifi: &WifiInfo, can_apply: bool) -> Vec<PolicyAction> {
    let mut actions = Vec::new();
    if !can_apply {
        return actions;
    }

    if policy.trusted_networks_control && !wifi.ssid.is_empty() {
        let a = &policy.actions;
        match policy.trust_of(&wifi.ssid) {
            Some(true) => {
                if a.trusted_disconnect_vpn {
                    actions.push(PolicyAction::DisconnectVpn);
                }
                if a.trusted_disable_firewall {
                    actions.push(PolicyAction::DisableFirewall);
                }
            }
            Some(false) => {
                if a.un_trusted_connect_vpn {
                    actions.push(PolicyAction::ConnectVpn);
                }
                if a.un_trusted_enable_firewall || a.un_trusted_block_lan {
                    actions.push(PolicyAction::EnableFirewall);
                }
                if a.un_trusted_block_lan {
                    actions.push(PolicyAction::BlockLan);
                }
            }
            None => {}
        }
    }

    let has_vpn_action = actions
        .iter()
        .any(|a| matches!(a, PolicyAction::ConnectVpn | PolicyAction::DisconnectVpn));
    if !has_vpn_action && policy.connect_vpn_on_insecure_network && wifi.is_insecure {
        // Keep the declared order: connect goes before firewall actions.
        let pos = actions
            .iter()
            .position(|a| matches!(a, PolicyAction::EnableFirewall | PolicyAction::BlockLan))
            .unwrap_or(actions.len());
        actions.insert(pos, PolicyAction::ConnectVpn);
    }
    actions
}

// ============================================================================
// SSID sources
// ============================================================================

#[async_trait]
pub trait WifiSource: Send + Sync {
    async fn current(&self) -> VpnResult<WifiInfo>;
}

/// Split an `nmcli -t` line on unescaped colons.
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    fields.last_mut().map(|f| f.push(next));
                }
            }
            ':' => fields.push(String::new()),
            c => {
                fields.last_mut().map(|f| f.push(c));
            }
        }
    }
    fields
}

/// Parse `nmcli -t -f active,ssid,security dev wifi`.
pub fn parse_nmcli(text: &str) -> WifiInfo {
    text.lines()
        .map(split_terse)
        .find(|f| f.len() >= 3 && f[0] == "yes")
        .map(|f| WifiInfo {
            ssid: f[1].clone(),
            is_insecure: f[2].trim().is_empty() || f[2].trim() == "--",
        })
        .unwrap_or_default()
}

/// Parse `networksetup -getairportnetwork en0`.
pub fn parse_airport(text: &str) -> WifiInfo {
    let ssid = text
        .lines()
        .find_map(|l| l.strip_prefix("Current Wi-Fi Network: "))
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    WifiInfo {
        ssid,
        is_insecure: false,
    }
}

/// Parse `netsh wlan show interfaces`.
pub fn parse_netsh_wlan(text: &str) -> WifiInfo {
    let mut info = WifiInfo::default();
    let mut connected = false;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "State" => connected = value.eq_ignore_ascii_case("connected"),
            "SSID" => info.ssid = value.to_string(),
            "Authentication" => info.is_insecure = value.eq_ignore_ascii_case("open"),
            _ => {}
        }
    }
    if !connected {
        return WifiInfo::default();
    }
    info
}

enum CommandKind {
    Nmcli,
    Airport,
    NetshWlan,
}

/// SSID from the platform's command-line tool.
pub struct CommandWifiSource {
    runner: Arc<dyn CommandRunner>,
    program: PathBuf,
    kind: CommandKind,
}

impl CommandWifiSource {
    pub fn platform(runner: Arc<dyn CommandRunner>, binaries: &BinaryPaths) -> Self {
        #[cfg(target_os = "macos")]
        let (program, kind) = (binaries.networksetup.clone(), CommandKind::Airport);
        #[cfg(windows)]
        let (program, kind) = (binaries.netsh.clone(), CommandKind::NetshWlan);
        #[cfg(not(any(target_os = "macos", windows)))]
        let (program, kind) = (binaries.nmcli.clone(), CommandKind::Nmcli);
        Self { runner, program, kind }
    }
}

#[async_trait]
impl WifiSource for CommandWifiSource {
    async fn current(&self) -> VpnResult<WifiInfo> {
        let args: &[&str] = match self.kind {
            CommandKind::Nmcli => &["-t", "-f", "active,ssid,security", "dev", "wifi"],
            CommandKind::Airport => &["-getairportnetwork", "en0"],
            CommandKind::NetshWlan => &["wlan", "show", "interfaces"],
        };
        let out = self
            .runner
            .output(&ShellCommand::tool(&self.program).args(args.iter().copied()))
            .await?;
        if !out.success() {
            // No WiFi hardware or radio off.
            return Ok(WifiInfo::default());
        }
        Ok(match self.kind {
            CommandKind::Nmcli => parse_nmcli(&out.stdout),
            CommandKind::Airport => parse_airport(&out.stdout),
            CommandKind::NetshWlan => parse_netsh_wlan(&out.stdout),
        })
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Polls a [`WifiSource`] and reports changes.
pub struct WifiMonitor {
    source: Arc<dyn WifiSource>,
}

impl WifiMonitor {
    pub fn new(source: Arc<dyn WifiSource>) -> Self {
        Self { source }
    }

    pub async fn current(&self) -> VpnResult<WifiInfo> {
        self.source.current().await
    }

    /// Poll until `cancel`; every settled change is sent on `changes`.
    pub fn spawn(self, changes: mpsc::UnboundedSender<WifiInfo>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last = match self.source.current().await {
                Ok(info) => Some(info),
                Err(e) => {
                    log::warn!("Unable to read WiFi state: {}", e);
                    None
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                let Ok(seen) = self.source.current().await else {
                    continue;
                };
                if Some(&seen) == last.as_ref() {
                    continue;
                }
                // Let the association settle before reacting.
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(DEBOUNCE) => {}
                }
                let Ok(settled) = self.source.current().await else {
                    continue;
                };
                if settled != seen || Some(&settled) == last.as_ref() {
                    continue;
                }
                log::info!("WiFi changed: '{}' (insecure: {})", settled.ssid, settled.is_insecure);
                last = Some(settled.clone());
                if changes.send(settled).is_err() {
                    return;
                }
            }
        })
    }
}

/// Refuse background auto-actions while app authentication is enabled.
pub fn check_background_allowed(policy: &WifiPolicy, eaa_enabled: bool) -> VpnResult<()> {
    if eaa_enabled && policy.can_apply_in_background {
        return Err(VpnError::conflict("EAA enabled"));
    }
    Ok(())
}
