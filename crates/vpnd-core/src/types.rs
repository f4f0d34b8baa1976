//! Connection-level data model shared by the backends, the manager and IPC.

use crate::dns::DnsSettings;
use crate::error::{VpnError, VpnResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Tunnel protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VpnType {
    WireGuard,
    OpenVpn,
}

impl fmt::Display for VpnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpnType::WireGuard => f.write_str("WireGuard"),
            VpnType::OpenVpn => f.write_str("OpenVPN"),
        }
    }
}

/// Transport protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn is_tcp(self) -> bool {
        self == Transport::Tcp
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => f.write_str("udp"),
            Transport::Tcp => f.write_str("tcp"),
        }
    }
}

/// Outer obfuscation layer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum V2RayTransport {
    Quic,
    Tcp,
}

impl V2RayTransport {
    /// Transport the tunnel itself must use towards the local proxy.
    pub fn tunnel_transport(self) -> Transport {
        match self {
            V2RayTransport::Quic => Transport::Udp,
            V2RayTransport::Tcp => Transport::Tcp,
        }
    }
}

// ============================================================================
// Connection state
// ============================================================================

/// Lifecycle state reported by backends and the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Wait,
    Auth,
    GetConfig,
    AssignIp,
    AddRoutes,
    Connected,
    Initialised,
    Reconnecting,
    TcpConnect,
    Exiting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Wait => "WAIT",
            ConnectionState::Auth => "AUTH",
            ConnectionState::GetConfig => "GETCONFIG",
            ConnectionState::AssignIp => "ASSIGNIP",
            ConnectionState::AddRoutes => "ADDROUTES",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Initialised => "INITIALISED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::TcpConnect => "TCP_CONNECT",
            ConnectionState::Exiting => "EXITING",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionState {
    type Err = VpnError;

    /// Accepts both our names and the OpenVPN management spellings
    /// (`GET_CONFIG`, `ASSIGN_IP`, `ADD_ROUTES`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_matches(|c: char| " \t;,.".contains(c));
        let state = match trimmed.to_ascii_uppercase().as_str() {
            "DISCONNECTED" => ConnectionState::Disconnected,
            "CONNECTING" => ConnectionState::Connecting,
            "WAIT" => ConnectionState::Wait,
            "AUTH" => ConnectionState::Auth,
            "GETCONFIG" | "GET_CONFIG" => ConnectionState::GetConfig,
            "ASSIGNIP" | "ASSIGN_IP" => ConnectionState::AssignIp,
            "ADDROUTES" | "ADD_ROUTES" => ConnectionState::AddRoutes,
            "CONNECTED" => ConnectionState::Connected,
            "INITIALISED" => ConnectionState::Initialised,
            "RECONNECTING" => ConnectionState::Reconnecting,
            "TCP_CONNECT" => ConnectionState::TcpConnect,
            "EXITING" => ConnectionState::Exiting,
            _ => return Err(VpnError::bad_parameter("state")),
        };
        Ok(state)
    }
}

/// One state transition with everything known about the connection at that point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateInfo {
    pub state: ConnectionState,
    #[serde(default)]
    pub description: String,
    pub vpn_type: VpnType,
    /// Unix seconds.
    pub time: u64,
    #[serde(default)]
    pub is_tcp: bool,
    #[serde(default)]
    pub client_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub client_ip6: Option<Ipv6Addr>,
    #[serde(default)]
    pub client_port: u16,
    #[serde(default)]
    pub server_ip: Option<IpAddr>,
    #[serde(default)]
    pub server_port: u16,
    #[serde(default)]
    pub exit_hostname: String,
    #[serde(default)]
    pub mtu: u16,
    #[serde(default)]
    pub is_auth_error: bool,
    /// Hint for the frontend, e.g. `tls-error` on OpenVPN reconnects.
    #[serde(default)]
    pub additional_info: String,
    #[serde(default)]
    pub v2ray: Option<V2RayTransport>,
}

impl StateInfo {
    pub fn new(state: ConnectionState, vpn_type: VpnType) -> Self {
        Self {
            state,
            description: String::new(),
            vpn_type,
            time: unix_now(),
            is_tcp: false,
            client_ip: None,
            client_ip6: None,
            client_port: 0,
            server_ip: None,
            server_port: 0,
            exit_hostname: String::new(),
            mtu: 0,
            is_auth_error: false,
            additional_info: String::new(),
            v2ray: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Details of an established tunnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedInfo {
    pub vpn_type: VpnType,
    pub transport: Transport,
    pub client_ip: Option<Ipv4Addr>,
    pub client_ip6: Option<Ipv6Addr>,
    pub client_port: u16,
    pub server_ip: Option<IpAddr>,
    pub server_port: u16,
    pub exit_hostname: String,
    pub mtu: u16,
    pub v2ray: Option<V2RayTransport>,
    /// Unix seconds.
    pub connected_since: u64,
}

impl From<&StateInfo> for ConnectedInfo {
    fn from(s: &StateInfo) -> Self {
        Self {
            vpn_type: s.vpn_type,
            transport: if s.is_tcp { Transport::Tcp } else { Transport::Udp },
            client_ip: s.client_ip,
            client_ip6: s.client_ip6,
            client_port: s.client_port,
            server_ip: s.server_ip,
            server_port: s.server_port,
            exit_hostname: s.exit_hostname.clone(),
            mtu: s.mtu,
            v2ray: s.v2ray,
            connected_since: s.time,
        }
    }
}

// ============================================================================
// Connection request
// ============================================================================

/// Entry server the tunnel dials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEndpoint {
    #[serde(default)]
    pub hostname: String,
    pub ip: IpAddr,
    pub port: u16,
    pub transport: Transport,
}

/// Multihop exit server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitHost {
    pub hostname: String,
    /// Gateway identifier (e.g. `nl4`) used in the OpenVPN username.
    #[serde(default)]
    pub gateway_id: String,
    /// Entry-server port that forwards to this exit.
    pub multihop_port: u16,
    /// WireGuard public key of the exit.
    #[serde(default)]
    pub public_key: Option<String>,
}

/// WireGuard-specific entry host data from the server list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireGuardHost {
    pub public_key: String,
    /// Host address inside the tunnel; used as default DNS and route gateway.
    pub local_ip: Ipv4Addr,
    /// Prefix prepended to the client IPv4 text to form the client IPv6.
    #[serde(default)]
    pub ipv6_prefix: Option<String>,
}

/// Obfuscation server for the V2Ray outer layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObfuscationSpec {
    pub transport: V2RayTransport,
    pub host: IpAddr,
    pub port: u16,
    /// VMESS user id.
    pub id: String,
    /// TLS server name presented to the obfuscation server.
    #[serde(default)]
    pub tls_server_name: String,
}

/// HTTP/SOCKS proxy for OpenVPN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    pub kind: ProxyKind,
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Socks,
}

fn default_true() -> bool {
    true
}

/// Everything needed to establish (and later re-establish) a tunnel.
///
/// The same structure is persisted as the last-connection snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    pub vpn_type: VpnType,
    pub entry: HostEndpoint,
    #[serde(default)]
    pub exit: Option<ExitHost>,
    #[serde(default)]
    pub wireguard: Option<WireGuardHost>,
    #[serde(default)]
    pub ipv6: bool,
    /// 0 = backend default.
    #[serde(default)]
    pub mtu: u16,
    #[serde(default)]
    pub obfuscation: Option<ObfuscationSpec>,
    #[serde(default)]
    pub proxy: Option<ProxySpec>,
    #[serde(default)]
    pub manual_dns: DnsSettings,
    #[serde(default = "default_true")]
    pub firewall_on_during_connection: bool,
}

impl ConnectionRequest {
    /// Structural checks that do not need any system state.
    pub fn validate(&self) -> VpnResult<()> {
        if self.entry.port == 0 {
            return Err(VpnError::bad_parameter("port"));
        }
        if self.mtu != 0 && !(crate::backend::wireguard::MIN_MTU..=crate::backend::wireguard::MAX_MTU).contains(&self.mtu) {
            return Err(VpnError::bad_parameter("mtu"));
        }
        match self.vpn_type {
            VpnType::WireGuard => {
                if self.wireguard.is_none() {
                    return Err(VpnError::bad_parameter("wireguard"));
                }
                if let Some(exit) = &self.exit {
                    if exit.public_key.is_none() || exit.multihop_port == 0 {
                        return Err(VpnError::bad_parameter("exit"));
                    }
                }
            }
            VpnType::OpenVpn => {
                if let Some(exit) = &self.exit {
                    if exit.multihop_port == 0 {
                        return Err(VpnError::bad_parameter("exit"));
                    }
                }
            }
        }
        self.manual_dns.validate()?;
        Ok(())
    }

    /// Port actually dialled on the entry host (multihop uses the exit's port).
    pub fn dial_port(&self) -> u16 {
        match &self.exit {
            Some(exit) => exit.multihop_port,
            None => self.entry.port,
        }
    }

    pub fn exit_hostname(&self) -> String {
        self.exit
            .as_ref()
            .map(|e| e.hostname.clone())
            .unwrap_or_default()
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::wg_request;

    #[test]
    fn test_parse_openvpn_state_names() {
        assert_eq!("GET_CONFIG".parse::<ConnectionState>().unwrap(), ConnectionState::GetConfig);
        assert_eq!("ASSIGN_IP".parse::<ConnectionState>().unwrap(), ConnectionState::AssignIp);
        assert_eq!(" ADD_ROUTES;".parse::<ConnectionState>().unwrap(), ConnectionState::AddRoutes);
        assert_eq!("connected".parse::<ConnectionState>().unwrap(), ConnectionState::Connected);
        assert!("RESOLVE".parse::<ConnectionState>().is_err());
    }

    #[test]
    fn test_state_display_round_trip() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::TcpConnect,
            ConnectionState::Initialised,
            ConnectionState::Exiting,
        ] {
            assert_eq!(state.to_string().parse::<ConnectionState>().unwrap(), state);
        }
    }

    #[test]
    fn test_request_validation() {
        let mut req = wg_request();
        assert!(req.validate().is_ok());

        req.mtu = 1000;
        assert_eq!(req.validate().unwrap_err().kind(), crate::error::ErrorKind::BadParameter);

        req.mtu = 1420;
        req.wireguard = None;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_dial_port_uses_multihop_port() {
        let mut req = wg_request();
        assert_eq!(req.dial_port(), 2049);
        req.exit = Some(ExitHost {
            hostname: "de1.wg.example.net".into(),
            gateway_id: "de1".into(),
            multihop_port: 20012,
            public_key: Some("key".into()),
        });
        assert_eq!(req.dial_port(), 20012);
        assert_eq!(req.exit_hostname(), "de1.wg.example.net");
    }

    #[test]
    fn test_request_defaults_from_json() {
        let req: ConnectionRequest = serde_json::from_str(
            r#"{"vpnType":"OpenVpn","entry":{"ip":"1.2.3.4","port":443,"transport":"tcp"}}"#,
        )
        .unwrap();
        assert!(req.firewall_on_during_connection);
        assert!(req.manual_dns.is_empty());
        assert_eq!(req.entry.transport, Transport::Tcp);
    }

    #[test]
    fn test_connected_info_from_state() {
        let mut s = StateInfo::new(ConnectionState::Connected, VpnType::WireGuard);
        s.client_ip = Some("172.21.0.5".parse().unwrap());
        s.server_ip = Some("185.253.97.12".parse().unwrap());
        s.server_port = 2049;
        let info = ConnectedInfo::from(&s);
        assert_eq!(info.transport, Transport::Udp);
        assert_eq!(info.server_port, 2049);
    }
}
