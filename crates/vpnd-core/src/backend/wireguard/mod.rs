//! WireGuard tunnel backend.
//!
//! The key exchange and data plane belong to the WireGuard engine (kernel
//! module, `wireguard-go` or the Windows tunnel service). This backend writes
//! the engine configuration, addresses the interface, installs routes, and
//! watches `wg show` for the first handshake.

pub mod keys;
pub mod linux;
pub mod macos;
pub mod service;

use super::{wait_for_connectivity, BackendContext, StateSink, TunnelBackend};
use crate::error::{VpnError, VpnResult};
use crate::preferences::SessionData;
use crate::route::{add_routes, remove_routes, HostPin, RouteEntry, RoutingTable};
use crate::types::{ConnectionRequest, ConnectionState, StateInfo, VpnType};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use vpnd_common::config::{remove_file_if_exists, write_private_file};
use vpnd_common::net::{get_free_udp_port, Family};
use vpnd_common::shell::redact;
use vpnd_common::{CommandRunner, ShellCommand};

pub const MIN_MTU: u16 = 1280;
pub const MAX_MTU: u16 = 65535;

pub const PERSISTENT_KEEPALIVE: u16 = 25;

/// `wg setconf` attempts when the listen port turns out to be taken.
const SETCONF_ATTEMPTS: usize = 5;

const ADDRESS_IN_USE: &str = "Address already in use";

/// Interval between `wg show` polls.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// First "still waiting" log; doubled after every report.
const HANDSHAKE_LOG_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Parameters
// ============================================================================

/// Everything needed to bring one WireGuard tunnel up.
#[derive(Clone, PartialEq, Eq)]
pub struct WgParams {
    pub client_ip: Ipv4Addr,
    pub private_key: String,
    pub preshared_key: Option<String>,
    pub host_ip: IpAddr,
    pub host_port: u16,
    pub host_public_key: String,
    /// Host address inside the tunnel.
    pub host_local_ip: Ipv4Addr,
    pub ipv6_prefix: Option<String>,
    /// 0 = engine default.
    pub mtu: u16,
    pub exit_hostname: String,
}

impl std::fmt::Debug for WgParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgParams")
            .field("client_ip", &self.client_ip)
            .field("host_ip", &self.host_ip)
            .field("host_port", &self.host_port)
            .field("host_public_key", &self.host_public_key)
            .field("host_local_ip", &self.host_local_ip)
            .field("ipv6_prefix", &self.ipv6_prefix)
            .field("mtu", &self.mtu)
            .finish_non_exhaustive()
    }
}

impl WgParams {
    pub fn from_request(req: &ConnectionRequest, session: &SessionData) -> VpnResult<Self> {
        let host = req
            .wireguard
            .as_ref()
            .ok_or_else(|| VpnError::bad_parameter("wireguard"))?;
        let creds = session
            .wireguard_credentials()
            .ok_or_else(|| VpnError::config("WireGuard local credentials not defined"))?;

        // Multihop speaks to the exit server through the entry's forwarding port.
        let host_public_key = match &req.exit {
            Some(exit) => exit
                .public_key
                .clone()
                .ok_or_else(|| VpnError::bad_parameter("exit"))?,
            None => host.public_key.clone(),
        };

        Ok(Self {
            client_ip: creds.local_ip,
            private_key: creds.private_key,
            preshared_key: creds.preshared_key,
            host_ip: req.entry.ip,
            host_port: req.dial_port(),
            host_public_key,
            host_local_ip: host.local_ip,
            ipv6_prefix: if req.ipv6 { host.ipv6_prefix.clone() } else { None },
            mtu: req.mtu,
            exit_hostname: req.exit_hostname(),
        })
    }

    /// Client IPv6 address: the prefix followed by the IPv4 address text.
    pub fn client_ip6(&self) -> Option<Ipv6Addr> {
        prefixed_ipv6(self.ipv6_prefix.as_deref()?, self.client_ip)
    }

    pub fn host_local_ip6(&self) -> Option<Ipv6Addr> {
        prefixed_ipv6(self.ipv6_prefix.as_deref()?, self.host_local_ip)
    }

    pub fn validate_mtu(&self) -> VpnResult<()> {
        if self.mtu != 0 && !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            log::error!(
                "Bad MTU value {} (acceptable interval is: [{} - {}])",
                self.mtu,
                MIN_MTU,
                MAX_MTU
            );
            return Err(VpnError::bad_parameter("mtu"));
        }
        Ok(())
    }
}

fn prefixed_ipv6(prefix: &str, v4: Ipv4Addr) -> Option<Ipv6Addr> {
    if prefix.is_empty() {
        return None;
    }
    format!("{}{}", prefix, v4).parse().ok()
}

/// Reject anything that is not a base64-encoded 32-byte key.
///
/// Keys are interpolated into the engine configuration, so nothing else may
/// get through.
pub fn validate_key(field: &str, key: &str) -> VpnResult<()> {
    match STANDARD.decode(key.trim()) {
        Ok(bytes) if bytes.len() == 32 && !key.contains(char::is_whitespace) => Ok(()),
        _ => Err(VpnError::bad_parameter(field)),
    }
}

// ============================================================================
// Configuration file
// ============================================================================

/// Extra `[Interface]` settings for engines that configure the interface
/// themselves (the Windows tunnel service).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigFlavor {
    Plain,
    Service { dns: Option<IpAddr> },
}

pub fn render_config(params: &WgParams, listen_port: u16, flavor: &ConfigFlavor) -> VpnResult<String> {
    validate_key("privateKey", &params.private_key)?;
    validate_key("hostPublicKey", &params.host_public_key)?;
    if let Some(psk) = &params.preshared_key {
        validate_key("presharedKey", psk)?;
    }

    let client_ip6 = params.client_ip6();
    let mut lines = vec![
        "[Interface]".to_string(),
        format!("PrivateKey = {}", params.private_key),
        format!("ListenPort = {}", listen_port),
    ];
    if let ConfigFlavor::Service { dns } = flavor {
        let mut address = format!("{}/32", params.client_ip);
        if let Some(v6) = client_ip6 {
            address.push_str(&format!(", {}/64", v6));
        }
        lines.push(format!("Address = {}", address));
        if let Some(dns) = dns {
            lines.push(format!("DNS = {}", dns));
        }
        if params.mtu > 0 {
            lines.push(format!("MTU = {}", params.mtu));
        }
    }

    lines.push(String::new());
    lines.push("[Peer]".into());
    lines.push(format!("PublicKey = {}", params.host_public_key));
    lines.push(format!("Endpoint = {}", std::net::SocketAddr::new(params.host_ip, params.host_port)));
    lines.push(format!("PersistentKeepalive = {}", PERSISTENT_KEEPALIVE));
    if let Some(psk) = &params.preshared_key {
        lines.push(format!("PresharedKey = {}", psk));
    }
    let mut allowed = "0.0.0.0/0".to_string();
    if client_ip6.is_some() {
        allowed.push_str(", ::/0");
    }
    lines.push(format!("AllowedIPs = {}", allowed));
    lines.push(String::new());
    Ok(lines.join("\n"))
}

/// Writes the engine configuration, picking a fresh listen port each time.
pub struct ConfigWriter {
    params: WgParams,
    path: PathBuf,
    flavor: ConfigFlavor,
}

impl ConfigWriter {
    pub fn new(params: WgParams, path: &Path, flavor: ConfigFlavor) -> Self {
        Self {
            params,
            path: path.to_path_buf(),
            flavor,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the file (mode 0600) and return the listen port it names.
    pub fn write(&self) -> VpnResult<u16> {
        let port = get_free_udp_port().map_err(|e| VpnError::config_with_source("unable to obtain free local port", e))?;
        let text = render_config(&self.params, port, &self.flavor)?;
        write_private_file(&self.path, text.as_bytes())
            .map_err(|e| VpnError::config_with_source("failed to save WireGuard configuration", e))?;

        let mut hidden = vec![self.params.private_key.clone()];
        hidden.extend(self.params.preshared_key.clone());
        log::info!(
            "WireGuard configuration:\n=====================\n{}\n=====================",
            redact(&text, &hidden)
        );
        Ok(port)
    }

    pub fn remove(&self) {
        if let Err(e) = remove_file_if_exists(&self.path) {
            log::warn!("Failed to remove WG configuration: {}", e);
        }
    }
}

/// Apply the configuration with `wg setconf`, re-rolling the listen port
/// while the engine reports it as taken.
pub async fn set_config_with_retry(
    runner: &dyn CommandRunner,
    wg: &Path,
    interface: &str,
    config: &ConfigWriter,
) -> VpnResult<u16> {
    for attempt in 1..=SETCONF_ATTEMPTS {
        let port = config.write()?;
        let cmd = ShellCommand::tool(wg)
            .arg("setconf")
            .arg(interface)
            .arg(config.path().to_string_lossy());
        let output = runner.output(&cmd).await?;
        if output.success() {
            return Ok(port);
        }
        let text = output.error_text();
        if !text.contains(ADDRESS_IN_USE) {
            return Err(VpnError::tool_failed("wg", output.code, text.trim()));
        }
        log::warn!("Listen port {} in use (attempt {}/{})", port, attempt, SETCONF_ATTEMPTS);
    }
    Err(VpnError::internal("failed to set wireguard configuration"))
}

/// True if `wg show <iface> latest-handshakes` reports any handshake.
///
/// Each line is `<peer public key>\t<unix seconds>`; `0` means none yet.
pub fn parse_latest_handshakes(text: &str) -> bool {
    text.lines().any(|line| {
        line.split_whitespace()
            .nth(1)
            .and_then(|ts| ts.parse::<u64>().ok())
            .is_some_and(|ts| ts > 0)
    })
}

// ============================================================================
// Engine abstraction
// ============================================================================

/// Platform part of the tunnel: creating, addressing and removing the interface.
#[async_trait]
pub trait WgEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Remove an interface left behind by an unclean shutdown.
    async fn cleanup(&self) -> VpnResult<()>;

    /// Start the engine, apply `config` and address the interface.
    /// Returns the interface name and listen port.
    async fn start(&self, params: &WgParams, config: &ConfigWriter) -> VpnResult<(String, u16)>;

    async fn stop(&self);

    /// `Ok(false)` when the interface vanished; an error when the tunnel must
    /// be re-established from scratch.
    async fn check_alive(&self) -> VpnResult<bool>;

    /// Routes sending all traffic into the tunnel. Empty when the engine
    /// installs them itself.
    fn tunnel_routes(&self, interface: &str, params: &WgParams) -> Vec<RouteEntry>;

    fn config_flavor(&self, _params: &WgParams) -> ConfigFlavor {
        ConfigFlavor::Plain
    }
}

pub fn platform_engine(ctx: &BackendContext) -> VpnResult<Box<dyn WgEngine>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxEngine::new(ctx.runner.clone(), &ctx.binaries)))
    }
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(macos::UserspaceEngine::new(ctx.runner.clone(), &ctx.binaries)))
    }
    #[cfg(windows)]
    {
        Ok(Box::new(service::ServiceEngine::new(ctx.runner.clone(), &ctx.binaries)))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = ctx;
        Err(VpnError::not_available("WireGuard"))
    }
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Default)]
struct Active {
    interface: Option<String>,
    listen_port: u16,
    pin: Option<HostPin>,
    routes: Vec<RouteEntry>,
}

pub struct WireGuard {
    runner: Arc<dyn CommandRunner>,
    wg: PathBuf,
    routes: Arc<dyn RoutingTable>,
    config: ConfigWriter,
    params: WgParams,
    engine: Box<dyn WgEngine>,
    active: Mutex<Active>,
}

impl WireGuard {
    pub fn new(ctx: &BackendContext, params: WgParams) -> VpnResult<Self> {
        let engine = platform_engine(ctx)?;
        Ok(Self::with_engine(ctx, params, engine))
    }

    pub fn with_engine(ctx: &BackendContext, params: WgParams, engine: Box<dyn WgEngine>) -> Self {
        let flavor = engine.config_flavor(&params);
        Self {
            runner: ctx.runner.clone(),
            wg: ctx.binaries.wg.clone(),
            routes: ctx.routes.clone(),
            config: ConfigWriter::new(params.clone(), &ctx.paths.wireguard_config(), flavor),
            params,
            engine,
            active: Mutex::new(Active::default()),
        }
    }

    fn state_info(&self, state: ConnectionState, listen_port: u16) -> StateInfo {
        let mut info = StateInfo::new(state, VpnType::WireGuard);
        info.client_ip = Some(self.params.client_ip);
        info.client_ip6 = self.params.client_ip6();
        info.client_port = listen_port;
        info.server_ip = Some(self.params.host_ip);
        info.server_port = self.params.host_port;
        info.mtu = self.params.mtu;
        info.exit_hostname = self.params.exit_hostname.clone();
        info
    }

    async fn bring_up(&self, gateway: IpAddr) -> VpnResult<u16> {
        if self.params.host_ip.is_loopback() && self.params.host_port == 0 {
            return Err(VpnError::bad_parameter("host"));
        }

        // The server must stay reachable outside the tunnel before the
        // split routes go in.
        if !self.params.host_ip.is_loopback() {
            let pin = HostPin::install_via(self.routes.as_ref(), self.params.host_ip, gateway).await?;
            self.active.lock().await.pin = Some(pin);
        }

        log::info!("Starting WireGuard ({})", self.engine.name());
        let (interface, port) = self.engine.start(&self.params, &self.config).await?;
        {
            let mut active = self.active.lock().await;
            active.interface = Some(interface.clone());
            active.listen_port = port;
        }

        let routes = self.engine.tunnel_routes(&interface, &self.params);
        let added = add_routes(self.routes.as_ref(), &routes).await?;
        self.active.lock().await.routes = added;
        Ok(port)
    }

    async fn run(&self, port: u16, sink: &StateSink, cancel: &CancellationToken) -> VpnResult<()> {
        log::info!("Initialised");
        sink.send(self.state_info(ConnectionState::Initialised, port));

        let interface = self.active.lock().await.interface.clone().unwrap_or_default();
        let started = tokio::time::Instant::now();
        let mut next_log = HANDSHAKE_LOG_INTERVAL;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(VpnError::Cancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            if self.handshake_done(&interface).await {
                break;
            }
            if !self.engine.check_alive().await? {
                return self.exited(sink, port, "WireGuard interface disappeared before the handshake");
            }
            let waited = started.elapsed();
            if waited >= next_log {
                log::info!("Waiting for handshake ({} sec)...", waited.as_secs());
                next_log *= 2;
            }
        }

        log::info!("Connected");
        sink.send(self.state_info(ConnectionState::Connected, port));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(VpnError::Cancelled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            if !self.engine.check_alive().await? {
                return self.exited(sink, port, "WireGuard interface disappeared");
            }
        }
    }

    fn exited(&self, sink: &StateSink, port: u16, reason: &str) -> VpnResult<()> {
        log::warn!("{}", reason);
        sink.send(self.state_info(ConnectionState::Exiting, port).with_description(reason));
        Ok(())
    }

    async fn handshake_done(&self, interface: &str) -> bool {
        let cmd = ShellCommand::tool(&self.wg)
            .args(["show", interface, "latest-handshakes"]);
        match self.runner.output(&cmd).await {
            Ok(out) if out.success() => parse_latest_handshakes(&out.stdout),
            Ok(out) => {
                log::debug!("wg show failed: {}", out.error_text().trim());
                false
            }
            Err(e) => {
                log::debug!("wg show failed: {}", e);
                false
            }
        }
    }

    async fn tear_down(&self) {
        let active = std::mem::take(&mut *self.active.lock().await);
        remove_routes(self.routes.as_ref(), &active.routes).await;
        if active.interface.is_some() {
            self.engine.stop().await;
        }
        if let Some(pin) = active.pin {
            pin.remove(self.routes.as_ref()).await;
        }
        self.config.remove();
        log::info!("Stopped");
    }
}

#[async_trait]
impl TunnelBackend for WireGuard {
    fn vpn_type(&self) -> VpnType {
        VpnType::WireGuard
    }

    fn destination_ip(&self) -> IpAddr {
        self.params.host_ip
    }

    fn default_dns(&self) -> Option<IpAddr> {
        Some(IpAddr::V4(self.params.host_local_ip))
    }

    fn applies_default_dns(&self) -> bool {
        matches!(self.config.flavor, ConfigFlavor::Service { dns: Some(_) })
    }

    fn is_ipv6_in_tunnel(&self) -> bool {
        self.params.client_ip6().is_some()
    }

    async fn init(&self) -> VpnResult<()> {
        self.engine.cleanup().await
    }

    async fn connect(&self, sink: StateSink, cancel: CancellationToken) -> VpnResult<()> {
        self.params.validate_mtu()?;
        sink.send(StateInfo::new(ConnectionState::Connecting, VpnType::WireGuard));

        let gateway = wait_for_connectivity(
            self.routes.as_ref(),
            Family::of(&self.params.host_ip),
            VpnType::WireGuard,
            &sink,
            &cancel,
        )
        .await?;

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(VpnError::Cancelled),
            r = self.bring_up(gateway) => r,
        };
        let result = match result {
            Ok(port) => self.run(port, &sink, &cancel).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if !matches!(e, VpnError::Cancelled) {
                log::error!("WireGuard connection failed: {}", e);
            }
        }
        self.tear_down().await;
        result
    }

    async fn on_routing_changed(&self) -> VpnResult<()> {
        let mut active = self.active.lock().await;
        if let Some(pin) = active.pin.as_mut() {
            let before = pin.gateway();
            if pin.refresh(self.routes.as_ref()).await? {
                log::info!(
                    "Default gateway changed: {:?} -> {:?}",
                    before,
                    pin.gateway()
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::MemoryRoutingTable;
    use crate::testing::{test_session, wg_request};
    use vpnd_common::config::{BinaryPaths, OpenVpnFiles, StatePaths};
    use vpnd_common::net::host_net;
    use vpnd_common::shell::ScriptedRunner;
    use vpnd_common::CommandOutput;

    const PRIVATE_KEY: &str = "6KpUNCFhbLOmPdGiZz7Vm5yqZqLGBY5R3nbcn8TPYW4=";

    fn params() -> WgParams {
        WgParams::from_request(&wg_request(), &test_session()).unwrap()
    }

    /// Engine that only records calls.
    #[derive(Default)]
    struct FakeEngine {
        alive: std::sync::Mutex<Vec<bool>>,
        stopped: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl WgEngine for FakeEngine {
        fn name(&self) -> &'static str {
            "fake"
        }
        async fn cleanup(&self) -> VpnResult<()> {
            Ok(())
        }
        async fn start(&self, _params: &WgParams, config: &ConfigWriter) -> VpnResult<(String, u16)> {
            let port = config.write()?;
            Ok(("wgtest".into(), port))
        }
        async fn stop(&self) {
            self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        async fn check_alive(&self) -> VpnResult<bool> {
            let mut alive = self.alive.lock().unwrap();
            Ok(if alive.len() > 1 { alive.remove(0) } else { alive.first().copied().unwrap_or(true) })
        }
        fn tunnel_routes(&self, interface: &str, _params: &WgParams) -> Vec<RouteEntry> {
            crate::route::split_default_routes(interface, Family::V4)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        runner: ScriptedRunner,
        routes: MemoryRoutingTable,
        ctx: BackendContext,
    }

    impl Fixture {
        fn wg(&self) -> String {
            self.ctx.binaries.wg.to_string_lossy().into_owned()
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let routes = MemoryRoutingTable::new();
        routes.set_default_gateway("192.168.1.1".parse().unwrap());
        let ctx = BackendContext {
            runner: runner.shared(),
            binaries: BinaryPaths::default(),
            openvpn_files: OpenVpnFiles::default(),
            paths: StatePaths::new(dir.path()),
            routes: Arc::new(routes.clone()),
        };
        Fixture {
            _dir: dir,
            runner,
            routes,
            ctx,
        }
    }

    #[test]
    fn test_ipv6_client_address_from_prefix() {
        let mut p = params();
        p.ipv6_prefix = Some("fd00:4956:504e:ffff::".into());
        assert_eq!(
            p.client_ip6().unwrap(),
            "fd00:4956:504e:ffff::ac15:5".parse::<Ipv6Addr>().unwrap()
        );
        p.ipv6_prefix = None;
        assert!(p.client_ip6().is_none());
    }

    #[test]
    fn test_render_plain_config() {
        let text = render_config(&params(), 51820, &ConfigFlavor::Plain).unwrap();
        assert!(text.starts_with("[Interface]\nPrivateKey = "));
        assert!(text.contains("ListenPort = 51820"));
        assert!(text.contains("Endpoint = 185.253.97.12:2049"));
        assert!(text.contains("PersistentKeepalive = 25"));
        assert!(text.contains("AllowedIPs = 0.0.0.0/0\n"));
        assert!(!text.contains("Address"));
        assert!(!text.contains("PresharedKey"));
    }

    #[test]
    fn test_render_service_config_with_ipv6_and_dns() {
        let mut p = params();
        p.ipv6_prefix = Some("fd00:4956:504e:ffff::".into());
        p.mtu = 1380;
        p.preshared_key = Some(PRIVATE_KEY.into());
        let text = render_config(
            &p,
            4000,
            &ConfigFlavor::Service {
                dns: Some("172.21.0.1".parse().unwrap()),
            },
        )
        .unwrap();
        assert!(text.contains("Address = 172.21.0.5/32, fd00:4956:504e:ffff::ac15:5/64"));
        assert!(text.contains("DNS = 172.21.0.1"));
        assert!(text.contains("MTU = 1380"));
        assert!(text.contains("PresharedKey = "));
        assert!(text.contains("AllowedIPs = 0.0.0.0/0, ::/0"));
    }

    #[test]
    fn test_injected_key_rejected() {
        let mut p = params();
        p.host_public_key = format!("{}\nEndpoint = 6.6.6.6:1", p.host_public_key);
        let err = render_config(&p, 1, &ConfigFlavor::Plain).unwrap_err();
        assert!(matches!(err, VpnError::BadParameter { ref field } if field == "hostPublicKey"));
        assert!(validate_key("k", "c2hvcnQ=").is_err());
    }

    #[test]
    fn test_missing_credentials() {
        let mut session = test_session();
        session.wg_private_key.clear();
        let err = WgParams::from_request(&wg_request(), &session).unwrap_err();
        assert!(err.to_string().contains("WireGuard local credentials not defined"));
    }

    #[test]
    fn test_parse_latest_handshakes() {
        assert!(!parse_latest_handshakes("oX/+u0tLhV8=\t0\n"));
        assert!(parse_latest_handshakes("a\t0\nb\t1700000000\n"));
        assert!(!parse_latest_handshakes(""));
    }

    #[test]
    fn test_mtu_bounds() {
        let mut p = params();
        p.mtu = 1279;
        assert!(p.validate_mtu().is_err());
        p.mtu = 1280;
        assert!(p.validate_mtu().is_ok());
        p.mtu = 0;
        assert!(p.validate_mtu().is_ok());
    }

    #[tokio::test]
    async fn test_setconf_rerolls_port_when_in_use() {
        let f = fixture();
        f.runner.on_sequence(
            "wg",
            &["setconf"],
            vec![
                CommandOutput::failed(1, "Unable to modify interface: Address already in use"),
                CommandOutput::ok(""),
            ],
        );
        let config = ConfigWriter::new(params(), &f.ctx.paths.wireguard_config(), ConfigFlavor::Plain);
        set_config_with_retry(f.runner.shared().as_ref(), Path::new("wg"), "utun5", &config)
            .await
            .unwrap();
        let setconf = f.runner.lines().iter().filter(|l| l.starts_with("wg setconf utun5")).count();
        assert_eq!(setconf, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_handshake_and_cancel() {
        let f = fixture();
        f.runner.on_sequence(
            &f.wg(),
            &["show", "wgtest", "latest-handshakes"],
            vec![
                CommandOutput::ok("oX/+u0tLhV8+S1SdhqbtGKyLq+Mh7k4wxNbeQ5k4b0Q=\t0\n"),
                CommandOutput::ok("oX/+u0tLhV8+S1SdhqbtGKyLq+Mh7k4wxNbeQ5k4b0Q=\t1700000000\n"),
            ],
        );
        let engine = FakeEngine::default();
        let stopped = engine.stopped.clone();
        let wg = Arc::new(WireGuard::with_engine(&f.ctx, params(), Box::new(engine)));
        let (sink, mut rx) = StateSink::channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let wg = wg.clone();
            let cancel = cancel.clone();
            async move { wg.connect(sink, cancel).await }
        });

        assert_eq!(rx.recv().await.unwrap().state, ConnectionState::Connecting);
        let init = rx.recv().await.unwrap();
        assert_eq!(init.state, ConnectionState::Initialised);
        let connected = rx.recv().await.unwrap();
        assert_eq!(connected.state, ConnectionState::Connected);
        assert_eq!(connected.client_ip, Some("172.21.0.5".parse().unwrap()));
        assert_eq!(connected.server_port, 2049);
        assert!(connected.client_port > 0);

        let server = host_net("185.253.97.12".parse().unwrap());
        assert_eq!(f.routes.routes_to(server).len(), 1);
        assert_eq!(f.routes.routes().len(), 3);
        assert!(f.ctx.paths.wireguard_config().exists());

        cancel.cancel();
        assert!(matches!(task.await.unwrap(), Err(VpnError::Cancelled)));
        assert!(f.routes.routes().is_empty());
        assert!(stopped.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!f.ctx.paths.wireguard_config().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_change_moves_host_pin() {
        let f = fixture();
        f.runner.on(&f.wg(), &["show"], CommandOutput::ok("k\t1700000000\n"));
        let wg = Arc::new(WireGuard::with_engine(&f.ctx, params(), Box::new(FakeEngine::default())));
        let (sink, mut rx) = StateSink::channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let wg = wg.clone();
            let cancel = cancel.clone();
            async move { wg.connect(sink, cancel).await }
        });
        while rx.recv().await.unwrap().state != ConnectionState::Connected {}

        f.routes.set_default_gateway("192.168.2.1".parse().unwrap());
        wg.on_routing_changed().await.unwrap();

        let server = host_net("185.253.97.12".parse().unwrap());
        let pinned = f.routes.routes_to(server);
        assert_eq!(pinned, vec![RouteEntry::via_gateway(server, "192.168.2.1".parse().unwrap())]);
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        let _ = task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_interface_reports_exiting() {
        let f = fixture();
        f.runner.on(&f.wg(), &["show"], CommandOutput::ok("k\t1700000000\n"));
        let engine = FakeEngine {
            alive: std::sync::Mutex::new(vec![true, true, false]),
            ..Default::default()
        };
        let wg = WireGuard::with_engine(&f.ctx, params(), Box::new(engine));
        let (sink, mut rx) = StateSink::channel();
        wg.connect(sink, CancellationToken::new()).await.unwrap();

        let mut last = None;
        while let Ok(s) = rx.try_recv() {
            last = Some(s);
        }
        let last = last.unwrap();
        assert_eq!(last.state, ConnectionState::Exiting);
        assert!(!last.is_auth_error);
        assert!(f.routes.routes().is_empty());
    }

    #[tokio::test]
    async fn test_failed_route_rolls_back_everything() {
        let f = fixture();
        f.routes.fail_destination("128.0.0.0/1".parse().unwrap());
        let engine = FakeEngine::default();
        let stopped = engine.stopped.clone();
        let wg = WireGuard::with_engine(&f.ctx, params(), Box::new(engine));
        let (sink, _rx) = StateSink::channel();
        assert!(wg.connect(sink, CancellationToken::new()).await.is_err());
        assert!(f.routes.routes().is_empty());
        assert!(stopped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
