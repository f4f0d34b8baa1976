//! V2Ray obfuscation layer.
//!
//! The tunnel dials a local dokodemo-door inbound; V2Ray carries the
//! traffic to the obfuscation server over VMESS on QUIC or TCP, and that
//! server forwards it to the real VPN endpoint. The obfuscation server is
//! host-pinned to the physical gateway for as long as the proxy runs.

use crate::backend::BackendContext;
use crate::error::{VpnError, VpnResult};
use crate::netchange::{system_route_probe, RouteProbe};
use crate::route::{HostPin, RoutingTable};
use crate::types::{ObfuscationSpec, Transport, V2RayTransport};
use async_trait::async_trait;
use serde_json::json;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vpnd_common::config::{remove_file_if_exists, write_private_file};
use vpnd_common::net::{get_free_tcp_port, get_free_udp_port};
use vpnd_common::shell::{OutputLine, ProcessHandle, DEFAULT_KILL_GRACE};
use vpnd_common::{CommandRunner, ShellCommand};

pub const START_TIMEOUT: Duration = Duration::from_secs(10);
pub const START_ATTEMPTS: usize = 3;
pub const ROUTE_CHECK_INTERVAL: Duration = Duration::from_secs(20);

/// Picks the local port for the inbound.
pub type PortAllocator = Arc<dyn Fn(Transport) -> io::Result<u16> + Send + Sync>;

pub fn system_port_allocator() -> PortAllocator {
    Arc::new(|transport| match transport {
        Transport::Udp => get_free_udp_port(),
        Transport::Tcp => get_free_tcp_port(),
    })
}

/// Outer proxy in front of the tunnel endpoint.
#[async_trait]
pub trait ObfuscationProxy: Send + Sync {
    fn transport(&self) -> V2RayTransport;

    /// Start the proxy and return the local port the tunnel must dial.
    async fn start(&self) -> VpnResult<u16>;

    async fn stop(&self);

    /// The default gateway may have moved; re-pin the obfuscation server.
    async fn on_routing_changed(&self) -> VpnResult<()>;
}

// ============================================================================
// Configuration
// ============================================================================

/// V2Ray client configuration for one start attempt.
pub fn render_config(spec: &ObfuscationSpec, local_port: u16, target: SocketAddr) -> serde_json::Value {
    let network = match spec.transport.tunnel_transport() {
        Transport::Udp => "udp",
        Transport::Tcp => "tcp",
    };
    let stream = match spec.transport {
        V2RayTransport::Quic => json!({
            "network": "quic",
            "security": "tls",
            "quicSettings": { "security": "", "key": "", "header": { "type": "srtp" } },
            "tlsSettings": { "serverName": spec.tls_server_name },
        }),
        V2RayTransport::Tcp => json!({
            "network": "tcp",
            "tcpSettings": {
                "header": {
                    "type": "http",
                    "request": {
                        "version": "1.1",
                        "method": "GET",
                        "path": ["/"],
                        "headers": {
                            "Host": [spec.tls_server_name],
                            "Accept-Encoding": ["gzip, deflate"],
                            "Connection": ["keep-alive"],
                            "Pragma": "no-cache",
                        },
                    },
                },
            },
        }),
    };
    json!({
        "log": { "loglevel": "info" },
        "inbounds": [{
            "listen": "127.0.0.1",
            "port": local_port.to_string(),
            "protocol": "dokodemo-door",
            "settings": {
                "address": target.ip().to_string(),
                "port": target.port(),
                "network": network,
            },
        }],
        "outbounds": [{
            "tag": "proxy",
            "protocol": "vmess",
            "settings": {
                "vnext": [{
                    "address": spec.host.to_string(),
                    "port": spec.port,
                    "users": [{ "id": spec.id, "alterId": 0, "security": "none" }],
                }],
            },
            "streamSettings": stream,
        }],
    })
}

/// `... listening UDP on 0.0.0.0:<port>` from V2Ray's start-up log.
pub fn parse_listening(line: &str) -> Option<(Transport, u16)> {
    let rest = &line[line.find("listening ")? + "listening ".len()..];
    let (proto, rest) = rest.split_once(' ')?;
    let transport = match proto {
        "UDP" => Transport::Udp,
        "TCP" => Transport::Tcp,
        _ => return None,
    };
    let port = rest.trim().strip_prefix("on ")?.rsplit_once(':')?.1;
    port.trim().parse().ok().map(|port| (transport, port))
}

fn is_port_in_use(line: &str) -> bool {
    line.to_lowercase().contains("address already in use")
}

enum StartFailure {
    PortInUse,
    Failed(VpnError),
}

// ============================================================================
// Process wrapper
// ============================================================================

struct Pin {
    pin: HostPin,
    local_ip: Option<IpAddr>,
}

struct Running {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
    local_port: u16,
}

pub struct V2Ray {
    runner: Arc<dyn CommandRunner>,
    binary: PathBuf,
    config_path: PathBuf,
    routes: Arc<dyn RoutingTable>,
    spec: ObfuscationSpec,
    target: SocketAddr,
    probe: RouteProbe,
    ports: PortAllocator,
    pin: Arc<Mutex<Option<Pin>>>,
    running: Mutex<Option<Running>>,
}

impl V2Ray {
    /// Proxy to `target`, the real VPN endpoint.
    pub fn new(ctx: &BackendContext, spec: ObfuscationSpec, target: SocketAddr) -> Self {
        Self {
            runner: ctx.runner.clone(),
            binary: ctx.binaries.v2ray.clone(),
            config_path: ctx.paths.v2ray_config(),
            routes: ctx.routes.clone(),
            spec,
            target,
            probe: system_route_probe(),
            ports: system_port_allocator(),
            pin: Arc::new(Mutex::new(None)),
            running: Mutex::new(None),
        }
    }

    pub fn with_probe(mut self, probe: RouteProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    async fn start_once(&self, local_port: u16) -> Result<ProcessHandle, StartFailure> {
        let config = render_config(&self.spec, local_port, self.target);
        let text = serde_json::to_string_pretty(&config)
            .map_err(|e| StartFailure::Failed(VpnError::internal(format!("V2Ray config: {}", e))))?;
        write_private_file(&self.config_path, text.as_bytes())
            .map_err(|e| StartFailure::Failed(VpnError::config_with_source("failed to write V2Ray config", e)))?;
        log::debug!("V2Ray configuration:\n{}", text);

        let cmd = ShellCommand::tool(&self.binary)
            .arg("run")
            .arg("-config")
            .arg(self.config_path.to_string_lossy());
        let mut process = self
            .runner
            .spawn(&cmd)
            .await
            .map_err(|e| StartFailure::Failed(e.into()))?;

        let expected = self.spec.transport.tunnel_transport();
        let waited = tokio::time::timeout(START_TIMEOUT, async {
            while let Some(line) = process.next_line().await {
                log::info!("[V2Ray] {}", line.text());
                if is_port_in_use(line.text()) {
                    return Err(StartFailure::PortInUse);
                }
                if let OutputLine::Stdout(text) = &line {
                    if let Some((transport, port)) = parse_listening(text) {
                        if transport == expected && port == local_port {
                            return Ok(());
                        }
                    }
                }
            }
            Err(StartFailure::Failed(VpnError::tool_failed(
                "v2ray",
                process.try_wait().flatten(),
                "exited during start",
            )))
        })
        .await;

        let failure = match waited {
            Ok(Ok(())) => return Ok(process),
            Ok(Err(failure)) => failure,
            Err(_) => StartFailure::Failed(VpnError::tool_failed(
                "v2ray",
                None,
                format!("start timeout (port {}:{})", local_port, expected.to_string().to_uppercase()),
            )),
        };
        if let Err(e) = process.kill(DEFAULT_KILL_GRACE).await {
            log::warn!("Failed to stop V2Ray: {}", e);
        }
        Err(failure)
    }

    async fn unpin(&self) {
        if let Some(pin) = self.pin.lock().await.take() {
            pin.pin.remove(self.routes.as_ref()).await;
        }
    }
}

/// Re-pin when the gateway or the local interface towards the server changed.
async fn update_main_route(
    routes: &dyn RoutingTable,
    probe: &RouteProbe,
    slot: &Mutex<Option<Pin>>,
) -> VpnResult<()> {
    let mut slot = slot.lock().await;
    let Some(current) = slot.as_mut() else {
        return Ok(());
    };
    let local_ip = probe(current.pin.server());
    if local_ip.is_some() && local_ip != current.local_ip {
        log::info!("Local interface towards the V2Ray server changed, updating route");
        let server = current.pin.server();
        if let Some(old) = slot.take() {
            old.pin.remove(routes).await;
        }
        let pin = HostPin::install(routes, server).await?;
        *slot = Some(Pin {
            local_ip: probe(server),
            pin,
        });
        return Ok(());
    }
    if current.pin.refresh(routes).await? {
        current.local_ip = probe(current.pin.server());
    }
    Ok(())
}

async fn supervise(
    mut process: ProcessHandle,
    routes: Arc<dyn RoutingTable>,
    probe: RouteProbe,
    pin: Arc<Mutex<Option<Pin>>>,
    local_port: u16,
    cancel: CancellationToken,
) {
    let mut lines = process.take_lines();
    let mut lines_open = true;
    let mut tick = tokio::time::interval(ROUTE_CHECK_INTERVAL);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = process.kill(DEFAULT_KILL_GRACE).await {
                    log::warn!("Failed to stop V2Ray: {}", e);
                }
                break;
            }
            line = lines.recv(), if lines_open => match line {
                Some(line) => log::debug!("[V2Ray] {}", line.text()),
                None => lines_open = false,
            },
            code = process.wait() => {
                log::warn!("V2Ray client stopped (port {}, exit {:?})", local_port, code.ok().flatten());
                break;
            }
            _ = tick.tick() => {
                if let Err(e) = update_main_route(routes.as_ref(), &probe, &pin).await {
                    log::error!("Failed to update V2Ray server route: {}", e);
                }
            }
        }
    }
}

#[async_trait]
impl ObfuscationProxy for V2Ray {
    fn transport(&self) -> V2RayTransport {
        self.spec.transport
    }

    async fn start(&self) -> VpnResult<u16> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.local_port);
        }
        log::info!(
            "Starting V2Ray ({:?}) via {}:{} to {}",
            self.spec.transport,
            self.spec.host,
            self.spec.port,
            self.target
        );

        {
            let pin = HostPin::install(self.routes.as_ref(), self.spec.host).await?;
            *self.pin.lock().await = Some(Pin {
                local_ip: (self.probe)(self.spec.host),
                pin,
            });
        }

        let transport = self.spec.transport.tunnel_transport();
        let mut last_error = VpnError::internal("V2Ray start failed");
        for attempt in 1..=START_ATTEMPTS {
            let local_port = match (self.ports)(transport) {
                Ok(port) => port,
                Err(e) => {
                    last_error = e.into();
                    break;
                }
            };
            match self.start_once(local_port).await {
                Ok(process) => {
                    if let Err(e) = remove_file_if_exists(&self.config_path) {
                        log::warn!("Failed to remove V2Ray config: {}", e);
                    }
                    log::info!("V2Ray started on 127.0.0.1:{}", local_port);
                    let cancel = CancellationToken::new();
                    let supervisor = tokio::spawn(supervise(
                        process,
                        self.routes.clone(),
                        self.probe.clone(),
                        self.pin.clone(),
                        local_port,
                        cancel.clone(),
                    ));
                    *running = Some(Running {
                        cancel,
                        supervisor,
                        local_port,
                    });
                    return Ok(local_port);
                }
                Err(StartFailure::PortInUse) => {
                    log::warn!(
                        "V2Ray port {} in use (attempt {}/{})",
                        local_port,
                        attempt,
                        START_ATTEMPTS
                    );
                    last_error = VpnError::internal(format!("V2Ray local port {} in use", local_port));
                }
                Err(StartFailure::Failed(e)) => {
                    last_error = e;
                    break;
                }
            }
        }

        log::error!("V2Ray start failed: {}", last_error);
        if let Err(e) = remove_file_if_exists(&self.config_path) {
            log::warn!("Failed to remove V2Ray config: {}", e);
        }
        self.unpin().await;
        Err(last_error)
    }

    async fn stop(&self) {
        if let Some(running) = self.running.lock().await.take() {
            running.cancel.cancel();
            if let Err(e) = running.supervisor.await {
                log::warn!("V2Ray supervisor ended abnormally: {}", e);
            }
            log::info!("V2Ray stopped");
        }
        self.unpin().await;
    }

    async fn on_routing_changed(&self) -> VpnResult<()> {
        update_main_route(self.routes.as_ref(), &self.probe, &self.pin).await
    }
}

/// Local endpoint the tunnel dials when obfuscation is active.
pub fn local_endpoint(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}
