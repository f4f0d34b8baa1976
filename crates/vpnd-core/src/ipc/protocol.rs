//! Frontend wire protocol.
//!
//! Every message is a big-endian `u32` length followed by a JSON body.
//! Requests are tagged by `Command` and carry an `idx` the response echoes;
//! unsolicited events are tagged by `Event` and carry no `idx`.

use crate::dns::DnsSettings;
use crate::error::{ErrorKind, VpnError, VpnResult};
use crate::firewall::FirewallState;
use crate::manager::{DaemonEvent, ManagerStatus};
use crate::ping::PingResult;
use crate::preferences::Preferences;
use crate::servers::ServerCatalogue;
use crate::splittun::{RunningApp, SplitTunnelState};
use crate::types::{ConnectionRequest, VpnType};
use crate::wifi::{WifiInfo, WifiPolicy};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Largest accepted message body.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

pub async fn write_message<W: AsyncWriteExt + Unpin>(writer: &mut W, data: &[u8]) -> VpnResult<()> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(VpnError::Protocol(format!("Message too large: {} bytes", data.len())));
    }
    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// `Ok(None)` on a clean end of stream between messages.
pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> VpnResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(VpnError::Protocol(format!(
            "Message too large: {} > {}",
            len, MAX_MESSAGE_SIZE
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(Some(data))
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "Command", rename_all_fields = "camelCase")]
pub enum Command {
    Hello {
        secret: String,
        #[serde(default)]
        client_version: String,
    },
    Connect {
        request: Box<ConnectionRequest>,
        /// Overrides the entry port, e.g. `udp:443`, `tcp` or `2049`.
        #[serde(default)]
        port: Option<String>,
    },
    Disconnect,
    /// `seconds == 0` resumes.
    Pause {
        seconds: u64,
    },
    #[serde(rename = "GetVPNState")]
    GetVpnState,
    GetServers,
    GetServersForceUpdate,
    PingServers {
        #[serde(default)]
        all_hosts: bool,
        #[serde(default)]
        prefer: Option<VpnType>,
    },
    FirewallSet {
        enable: bool,
    },
    FirewallStatus,
    FirewallAllowLan {
        allow: bool,
    },
    KillSwitchAllowLanMulticast {
        allow: bool,
    },
    FirewallAllowApiServers {
        allow: bool,
    },
    FirewallPersistentSet {
        persistent: bool,
    },
    /// Comma or space separated `ip[/prefix]` list.
    KillSwitchSetUserExceptions {
        exceptions: String,
    },
    #[serde(rename = "SetManualDNS")]
    SetManualDns {
        dns: DnsSettings,
    },
    SetAntitracker {
        enabled: bool,
        #[serde(default)]
        hardcore: bool,
    },
    SetSplitTunnelStatus {
        enabled: bool,
        #[serde(default)]
        inverse: bool,
        #[serde(default)]
        allow_when_no_vpn: bool,
    },
    #[serde(rename = "SplitTunnel_AddApp")]
    SplitTunnelAddApp {
        app: String,
    },
    #[serde(rename = "SplitTunnel_RemoveApp")]
    SplitTunnelRemoveApp {
        app: String,
    },
    SplitTunnelGetRunningApps,
    #[serde(rename = "SetWiFiSettings")]
    SetWifiSettings {
        settings: WifiPolicy,
    },
    #[serde(rename = "GetWiFiCurrentNetwork")]
    GetWifiCurrentNetwork,
    #[serde(rename = "WGKeysGenerate")]
    WgKeysGenerate,
    #[serde(rename = "WGKeysRotationInterval")]
    WgKeysRotationInterval {
        /// Seconds; 0 disables rotation.
        interval: u64,
    },
    SetPreferences {
        key: String,
        value: String,
    },
    GetPreferences,
    EaaSetPassword {
        #[serde(default)]
        old_hash: String,
        new_hash: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Hello { .. } => "Hello",
            Command::Connect { .. } => "Connect",
            Command::Disconnect => "Disconnect",
            Command::Pause { .. } => "Pause",
            Command::GetVpnState => "GetVPNState",
            Command::GetServers => "GetServers",
            Command::GetServersForceUpdate => "GetServersForceUpdate",
            Command::PingServers { .. } => "PingServers",
            Command::FirewallSet { .. } => "FirewallSet",
            Command::FirewallStatus => "FirewallStatus",
            Command::FirewallAllowLan { .. } => "FirewallAllowLan",
            Command::KillSwitchAllowLanMulticast { .. } => "KillSwitchAllowLanMulticast",
            Command::FirewallAllowApiServers { .. } => "FirewallAllowApiServers",
            Command::FirewallPersistentSet { .. } => "FirewallPersistentSet",
            Command::KillSwitchSetUserExceptions { .. } => "KillSwitchSetUserExceptions",
            Command::SetManualDns { .. } => "SetManualDNS",
            Command::SetAntitracker { .. } => "SetAntitracker",
            Command::SetSplitTunnelStatus { .. } => "SetSplitTunnelStatus",
            Command::SplitTunnelAddApp { .. } => "SplitTunnel_AddApp",
            Command::SplitTunnelRemoveApp { .. } => "SplitTunnel_RemoveApp",
            Command::SplitTunnelGetRunningApps => "SplitTunnelGetRunningApps",
            Command::SetWifiSettings { .. } => "SetWiFiSettings",
            Command::GetWifiCurrentNetwork => "GetWiFiCurrentNetwork",
            Command::WgKeysGenerate => "WGKeysGenerate",
            Command::WgKeysRotationInterval { .. } => "WGKeysRotationInterval",
            Command::SetPreferences { .. } => "SetPreferences",
            Command::GetPreferences => "GetPreferences",
            Command::EaaSetPassword { .. } => "EaaSetPassword",
        }
    }

    /// Requests that need the EAA password hash while EAA is enabled.
    pub fn is_privileged(&self) -> bool {
        !matches!(
            self,
            Command::Hello { .. }
                | Command::GetVpnState
                | Command::GetServers
                | Command::GetServersForceUpdate
                | Command::PingServers { .. }
                | Command::FirewallStatus
                | Command::SplitTunnelGetRunningApps
                | Command::GetWifiCurrentNetwork
                | Command::GetPreferences
                // Checks the old hash itself.
                | Command::EaaSetPassword { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub idx: u64,
    #[serde(default, rename = "eaaHash")]
    pub eaa_hash: String,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Deserialize)]
struct RequestHeader {
    #[serde(default)]
    idx: u64,
}

impl Request {
    /// Parse a request. On failure the error carries whatever `idx` could be
    /// recovered so the reply can still be matched.
    pub fn decode(data: &[u8]) -> Result<Self, (u64, VpnError)> {
        serde_json::from_slice(data).map_err(|e| {
            let idx = serde_json::from_slice::<RequestHeader>(data)
                .map(|h| h.idx)
                .unwrap_or(0);
            (idx, VpnError::Protocol(format!("Invalid request: {}", e)))
        })
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Account summary shown to frontends; never includes credentials.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub account_id: String,
    pub logged_in: bool,
    pub wg_public_key: String,
    pub wg_local_ip: Option<Ipv4Addr>,
    pub wg_keys_generated: u64,
    pub wg_keys_regen_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisabledFunctions {
    /// Why split tunnelling cannot be used here.
    pub split_tunnel_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParanoidMode {
    pub is_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "Response", rename_all_fields = "camelCase")]
pub enum ResponseBody {
    Hello {
        version: String,
        session: SessionInfo,
        daemon_settings: Box<Preferences>,
        disabled_functions: DisabledFunctions,
        paranoid_mode: ParanoidMode,
    },
    Ack,
    Error {
        kind: ErrorKind,
        message: String,
    },
    #[serde(rename = "VPNState")]
    VpnState {
        status: Box<ManagerStatus>,
    },
    Servers {
        servers: Box<ServerCatalogue>,
    },
    PingResults {
        results: Vec<PingResult>,
    },
    KillSwitchStatus {
        state: FirewallState,
    },
    SplitTunnelStatus {
        state: SplitTunnelState,
    },
    RunningApps {
        apps: Vec<RunningApp>,
    },
    #[serde(rename = "WiFiSettings")]
    WifiSettings {
        settings: WifiPolicy,
    },
    #[serde(rename = "WiFiCurrentNetwork")]
    WifiCurrentNetwork {
        wifi: WifiInfo,
    },
    Preferences {
        preferences: Box<Preferences>,
    },
}

impl ResponseBody {
    pub fn error(err: &VpnError) -> Self {
        ResponseBody::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub idx: u64,
    #[serde(flatten)]
    pub body: ResponseBody,
}

/// Anything the daemon writes to a frontend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outgoing {
    Response(Response),
    Event(DaemonEvent),
}

impl Outgoing {
    pub fn encode(&self) -> VpnResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| VpnError::Protocol(format!("Failed to encode message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::wg_request;
    use serde_json::json;

    #[test]
    fn test_decode_connect_request() {
        let body = json!({
            "Command": "Connect",
            "idx": 7,
            "eaaHash": "abc",
            "request": serde_json::to_value(wg_request()).unwrap(),
        });
        let req = Request::decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(req.idx, 7);
        assert_eq!(req.eaa_hash, "abc");
        assert_eq!(
            req.command,
            Command::Connect {
                request: Box::new(wg_request()),
                port: None,
            }
        );
    }

    #[test]
    fn test_decode_renamed_commands() {
        let req = Request::decode(br#"{"Command":"SplitTunnel_AddApp","idx":1,"app":"/usr/bin/firefox"}"#).unwrap();
        assert_eq!(
            req.command,
            Command::SplitTunnelAddApp {
                app: "/usr/bin/firefox".into()
            }
        );
        let req = Request::decode(br#"{"Command":"GetVPNState","idx":2}"#).unwrap();
        assert_eq!(req.command, Command::GetVpnState);
        assert_eq!(req.command.name(), "GetVPNState");
        let req = Request::decode(br#"{"Command":"PingServers","idx":3,"allHosts":true}"#).unwrap();
        assert_eq!(
            req.command,
            Command::PingServers {
                all_hosts: true,
                prefer: None
            }
        );
    }

    #[test]
    fn test_decode_failure_keeps_idx() {
        let (idx, err) = Request::decode(br#"{"Command":"Reboot","idx":42}"#).unwrap_err();
        assert_eq!(idx, 42);
        assert!(matches!(err, VpnError::Protocol(_)));
        let (idx, _) = Request::decode(b"not json").unwrap_err();
        assert_eq!(idx, 0);
    }

    #[test]
    fn test_response_shape() {
        let msg = Outgoing::Response(Response {
            idx: 5,
            body: ResponseBody::error(&VpnError::conflict("not connected")),
        });
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["idx"], 5);
        assert_eq!(value["Response"], "Error");
        assert_eq!(value["message"], "not connected");

        let msg = Outgoing::Event(DaemonEvent::DnsChanged { dns: None });
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"Event": "DnsChanged", "dns": null}));
    }

    #[test]
    fn test_privileged_commands() {
        assert!(Command::Disconnect.is_privileged());
        assert!(Command::FirewallSet { enable: false }.is_privileged());
        assert!(!Command::GetVpnState.is_privileged());
        assert!(!Command::Hello {
            secret: String::new(),
            client_version: String::new()
        }
        .is_privileged());
    }

    #[tokio::test]
    async fn test_framing() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        write_message(&mut a, b"{\"idx\":1}").await.unwrap();
        assert_eq!(read_message(&mut b).await.unwrap().unwrap(), b"{\"idx\":1}");

        let oversize = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
        a.write_all(&oversize).await.unwrap();
        assert!(matches!(read_message(&mut b).await, Err(VpnError::Protocol(_))));

        let (c, mut d) = tokio::io::duplex(64);
        drop(c);
        assert!(read_message(&mut d).await.unwrap().is_none());
    }
}
