//! Loopback IPC server.

use super::protocol::{
    read_message, write_message, Command, DisabledFunctions, Outgoing, ParanoidMode, Request, Response, ResponseBody,
    SessionInfo,
};
use crate::backend::wireguard::keys::{self, KeyRegistrar};
use crate::dns::DnsSettings;
use crate::eaa::Eaa;
use crate::error::{VpnError, VpnResult};
use crate::firewall::{parse_user_exceptions, Firewall, FirewallState};
use crate::manager::{DaemonEvent, ManagerHandle};
use crate::ping::{hosts_to_ping, Pinger};
use crate::port::PortSpec;
use crate::preferences::{Preferences, PreferencesStore, SessionData};
use crate::servers::ServersStore;
use crate::splittun::SplitTunnel;
use crate::types::{unix_now, VpnType};
use crate::wifi::{check_background_allowed, WifiMonitor};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use vpnd_common::config::{remove_file_if_exists, write_private_file};
use vpnd_common::CommandRunner;

/// Generates and registers WireGuard keys on request.
#[derive(Clone)]
pub struct KeyService {
    pub runner: Arc<dyn CommandRunner>,
    pub wg: PathBuf,
    pub registrar: Option<Arc<dyn KeyRegistrar>>,
}

/// Everything a request may touch.
#[derive(Clone)]
pub struct Services {
    pub manager: ManagerHandle,
    pub firewall: Arc<Firewall>,
    pub split: Arc<SplitTunnel>,
    pub prefs: Arc<PreferencesStore>,
    pub servers: Arc<ServersStore>,
    pub eaa: Arc<Eaa>,
    pub pinger: Arc<Pinger>,
    pub wifi: Arc<WifiMonitor>,
    pub keys: KeyService,
}

/// Session as shown to frontends: identifiers only.
fn public_session(session: &SessionData) -> SessionData {
    SessionData {
        account_id: session.account_id.clone(),
        wg_public_key: session.wg_public_key.clone(),
        wg_local_ip: session.wg_local_ip,
        wg_keys_generated: session.wg_keys_generated,
        wg_keys_regen_interval: session.wg_keys_regen_interval,
        ..Default::default()
    }
}

fn public_preferences(mut prefs: Preferences) -> Box<Preferences> {
    prefs.session = public_session(&prefs.session);
    Box::new(prefs)
}

pub struct IpcServer {
    services: Services,
    secret: String,
    info_file: PathBuf,
}

impl IpcServer {
    /// `info_file` receives `port:secret` once listening.
    pub fn new(services: Services, info_file: PathBuf) -> Self {
        let secret: [u8; 32] = rand::random();
        Self {
            services,
            secret: hex::encode(secret),
            info_file,
        }
    }

    /// Bind the loopback listener; port 0 picks one.
    pub async fn bind(port: u16) -> VpnResult<TcpListener> {
        Ok(TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?)
    }

    /// Accept frontends until `cancel`.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> VpnResult<()> {
        let port = listener.local_addr()?.port();
        write_private_file(&self.info_file, format!("{}:{}", port, self.secret).as_bytes())?;
        log::info!("IPC listening on 127.0.0.1:{}", port);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("IPC server stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer).await {
                                log::warn!("Frontend {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => log::error!("Failed to accept IPC connection: {}", e),
                },
            }
        }

        if let Err(e) = remove_file_if_exists(&self.info_file) {
            log::warn!("Failed to remove connection info file: {}", e);
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> VpnResult<()> {
        let (mut reader, mut writer) = stream.into_split();

        // The first message must authenticate the frontend.
        let Some(first) = read_message(&mut reader).await? else {
            return Ok(());
        };
        let hello = Request::decode(&first).map_err(|(_, e)| e)?;
        let Command::Hello { secret, client_version } = &hello.command else {
            return Err(VpnError::Protocol(format!(
                "expected Hello, got {}",
                hello.command.name()
            )));
        };
        if !bool::from(secret.as_bytes().ct_eq(self.secret.as_bytes())) {
            log::warn!("Refusing frontend {}: secret verification error", peer);
            let reply = Outgoing::Response(Response {
                idx: hello.idx,
                body: ResponseBody::error(&VpnError::AuthFailed),
            });
            write_message(&mut writer, &reply.encode()?).await?;
            return Ok(());
        }
        log::info!("Frontend {} connected (client version '{}')", peer, client_version);
        let _attached = self.services.manager.frontend_attached();

        let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let data = match msg.encode() {
                    Ok(data) => data,
                    Err(e) => {
                        log::error!("{}", e);
                        continue;
                    }
                };
                if let Err(e) = write_message(&mut writer, &data).await {
                    log::debug!("Frontend write failed: {}", e);
                    return;
                }
            }
        });

        let mut events = self.services.manager.subscribe();
        let event_tx = tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if event_tx.send(Outgoing::Event(event)).is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Frontend fell behind, {} events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        let _ = tx.send(Outgoing::Response(Response {
            idx: hello.idx,
            body: self.hello(),
        }));

        loop {
            let data = match read_message(&mut reader).await {
                Ok(Some(data)) => data,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Frontend {}: {}", peer, e);
                    break;
                }
            };
            let (idx, body) = match Request::decode(&data) {
                Ok(req) => {
                    log::info!("[<--] {}", req.command.name());
                    let idx = req.idx;
                    let body = self.handle(req).await.unwrap_or_else(|e| {
                        log::warn!("Request failed: {}", e);
                        ResponseBody::error(&e)
                    });
                    (idx, body)
                }
                Err((idx, e)) => (idx, ResponseBody::error(&e)),
            };
            if tx.send(Outgoing::Response(Response { idx, body })).is_err() {
                break;
            }
        }

        log::info!("Frontend {} disconnected", peer);
        forwarder.abort();
        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }

    fn hello(&self) -> ResponseBody {
        let s = &self.services;
        let prefs = s.prefs.get();
        let session = &prefs.session;
        ResponseBody::Hello {
            version: env!("CARGO_PKG_VERSION").to_string(),
            session: SessionInfo {
                account_id: session.account_id.clone(),
                logged_in: session.is_logged_in(),
                wg_public_key: session.wg_public_key.clone(),
                wg_local_ip: session.wg_local_ip,
                wg_keys_generated: session.wg_keys_generated,
                wg_keys_regen_interval: session.wg_keys_regen_interval,
            },
            disabled_functions: DisabledFunctions {
                split_tunnel_error: s.split.availability().err().map(|e| e.to_string()),
            },
            paranoid_mode: ParanoidMode {
                is_enabled: s.eaa.is_enabled(),
            },
            daemon_settings: public_preferences(prefs),
        }
    }

    /// Resolver to use for new connections: antitracker when enabled,
    /// otherwise the user's custom DNS.
    async fn effective_dns(&self, multihop: bool) -> DnsSettings {
        let prefs = self.services.prefs.get();
        if !prefs.antitracker {
            return prefs.custom_dns_cfg;
        }
        let catalogue = self.services.servers.cached().await;
        match catalogue.and_then(|c| c.antitracker_dns(prefs.antitracker_hardcore, multihop)) {
            Some(ip) => DnsSettings::plain(ip),
            None => {
                log::warn!("No antitracker resolver in the server list");
                DnsSettings::default()
            }
        }
    }

    async fn firewall_changed(&self, state: FirewallState) -> ResponseBody {
        self.services.manager.emit(DaemonEvent::KillSwitchStatus { state: state.clone() });
        ResponseBody::KillSwitchStatus { state }
    }

    async fn split_changed(&self) -> ResponseBody {
        let state = self.services.split.state().await;
        self.services.manager.emit(DaemonEvent::SplitTunnelStatus { state: state.clone() });
        ResponseBody::SplitTunnelStatus { state }
    }

    async fn servers(&self, force: bool) -> VpnResult<ResponseBody> {
        let servers = self.services.servers.get(force).await?;
        self.services.firewall.set_api_servers(servers.api_ips()).await?;
        Ok(ResponseBody::Servers {
            servers: Box::new(servers),
        })
    }

    async fn ping(&self, all_hosts: bool, prefer: Option<VpnType>) -> VpnResult<ResponseBody> {
        let s = &self.services;
        let catalogue = s.servers.get(false).await?;
        let hosts = {
            let mut rng = rand::rng();
            hosts_to_ping(&catalogue, all_hosts, prefer, &mut rng)
        };

        // ICMP to the probed hosts is otherwise blocked by the kill-switch.
        let fw = s.firewall.state().await;
        let opened: Vec<IpAddr> = if fw.enabled {
            hosts
                .iter()
                .filter(|ip| !fw.host_exceptions.contains_key(*ip))
                .copied()
                .collect()
        } else {
            Vec::new()
        };
        if !opened.is_empty() {
            s.firewall.add_host_exceptions(&opened, true, false).await?;
        }

        let manager = s.manager.clone();
        let results = s
            .pinger
            .ping_all(hosts, |r| {
                manager.emit(DaemonEvent::ServerPingResult {
                    results: vec![r.clone()],
                })
            })
            .await;

        if !opened.is_empty() {
            if let Err(e) = s.firewall.remove_host_exceptions(&opened).await {
                log::warn!("Failed to close ping exceptions: {}", e);
            }
        }
        Ok(ResponseBody::PingResults { results })
    }

    /// Run one authenticated request.
    pub async fn handle(&self, req: Request) -> VpnResult<ResponseBody> {
        let s = &self.services;
        if req.command.is_privileged() && !s.eaa.check(&req.eaa_hash)? {
            return Err(VpnError::AuthFailed);
        }

        match req.command {
            Command::Hello { .. } => Ok(self.hello()),
            Command::Connect { request, port } => {
                let mut request = *request;
                if let Some(port) = port {
                    let spec: PortSpec = port.parse()?;
                    request.entry.port = spec.port;
                    request.entry.transport = spec.transport;
                }
                if request.manual_dns.is_empty() {
                    request.manual_dns = self.effective_dns(request.exit.is_some()).await;
                }
                s.manager.connect(request).await?;
                Ok(ResponseBody::Ack)
            }
            Command::Disconnect => {
                s.manager.disconnect().await?;
                Ok(ResponseBody::Ack)
            }
            Command::Pause { seconds: 0 } => {
                s.manager.resume().await?;
                Ok(ResponseBody::Ack)
            }
            Command::Pause { seconds } => {
                s.manager.pause(Some(Duration::from_secs(seconds))).await?;
                Ok(ResponseBody::Ack)
            }
            Command::GetVpnState => Ok(ResponseBody::VpnState {
                status: Box::new(s.manager.status()),
            }),
            Command::GetServers => self.servers(false).await,
            Command::GetServersForceUpdate => self.servers(true).await,
            Command::PingServers { all_hosts, prefer } => self.ping(all_hosts, prefer).await,
            Command::FirewallSet { enable } => {
                let state = s.firewall.set_enabled(enable).await?;
                s.manager.keep_firewall().await;
                Ok(self.firewall_changed(state).await)
            }
            Command::FirewallStatus => Ok(ResponseBody::KillSwitchStatus {
                state: s.firewall.state().await,
            }),
            Command::FirewallAllowLan { allow } => {
                let current = s.firewall.state().await;
                let state = s.firewall.allow_lan(allow, allow && current.allow_lan_multicast).await?;
                s.prefs.update(|p| {
                    p.is_fw_allow_lan = state.allow_lan;
                    p.is_fw_allow_lan_multicast = state.allow_lan_multicast;
                })?;
                Ok(self.firewall_changed(state).await)
            }
            Command::KillSwitchAllowLanMulticast { allow } => {
                let current = s.firewall.state().await;
                let state = s.firewall.allow_lan(current.allow_lan, allow).await?;
                s.prefs.update(|p| p.is_fw_allow_lan_multicast = state.allow_lan_multicast)?;
                Ok(self.firewall_changed(state).await)
            }
            Command::FirewallAllowApiServers { allow } => {
                let state = s.firewall.set_allow_api_servers(allow).await?;
                s.prefs.update(|p| p.is_fw_allow_api_servers = allow)?;
                Ok(self.firewall_changed(state).await)
            }
            Command::FirewallPersistentSet { persistent } => {
                let state = s.firewall.set_persistent(persistent).await?;
                s.prefs.update(|p| p.is_fw_persistant = persistent)?;
                Ok(self.firewall_changed(state).await)
            }
            Command::KillSwitchSetUserExceptions { exceptions } => {
                let nets = parse_user_exceptions(&exceptions)?;
                let state = s.firewall.set_user_exceptions(nets).await?;
                s.prefs.update(|p| p.fw_user_exceptions = exceptions)?;
                Ok(self.firewall_changed(state).await)
            }
            Command::SetManualDns { dns } => {
                dns.validate()?;
                let prefs = s.prefs.update(|p| p.custom_dns_cfg = dns.clone())?;
                if !prefs.antitracker {
                    s.manager.set_manual_dns(dns).await?;
                }
                Ok(ResponseBody::Ack)
            }
            Command::SetAntitracker { enabled, hardcore } => {
                s.prefs.update(|p| {
                    p.antitracker = enabled;
                    p.antitracker_hardcore = enabled && hardcore;
                })?;
                let multihop = s.manager.status().request.is_some_and(|r| r.exit.is_some());
                let dns = self.effective_dns(multihop).await;
                s.manager.set_manual_dns(dns).await?;
                Ok(ResponseBody::Ack)
            }
            Command::SetSplitTunnelStatus {
                enabled,
                inverse,
                allow_when_no_vpn,
            } => {
                let apps = s.prefs.get().split_tunnel_apps;
                s.split.set_settings(enabled, inverse, allow_when_no_vpn, apps).await?;
                s.prefs.update(|p| {
                    p.is_split_tunnel = enabled;
                    p.split_tunnel_inversed = inverse;
                    p.split_tunnel_allow_when_no_vpn = allow_when_no_vpn;
                })?;
                Ok(self.split_changed().await)
            }
            Command::SplitTunnelAddApp { app } => {
                s.split.add_app(&app).await?;
                let apps = s.split.state().await.apps;
                s.prefs.update(|p| p.split_tunnel_apps = apps)?;
                Ok(self.split_changed().await)
            }
            Command::SplitTunnelRemoveApp { app } => {
                s.split.remove_app(&app).await?;
                let apps = s.split.state().await.apps;
                s.prefs.update(|p| p.split_tunnel_apps = apps)?;
                Ok(self.split_changed().await)
            }
            Command::SplitTunnelGetRunningApps => Ok(ResponseBody::RunningApps {
                apps: s.split.running_apps().await?,
            }),
            Command::SetWifiSettings { settings } => {
                check_background_allowed(&settings, s.eaa.is_enabled())?;
                let prefs = s.prefs.update(|p| p.wifi_control = settings)?;
                Ok(ResponseBody::WifiSettings {
                    settings: prefs.wifi_control,
                })
            }
            Command::GetWifiCurrentNetwork => Ok(ResponseBody::WifiCurrentNetwork {
                wifi: s.wifi.current().await?,
            }),
            Command::WgKeysGenerate => {
                let mut session = s.prefs.session();
                let k = &s.keys;
                keys::rotate_keys(k.runner.as_ref(), &k.wg, k.registrar.as_deref(), &mut session, unix_now()).await?;
                s.prefs.set_session(session)?;
                Ok(ResponseBody::Ack)
            }
            Command::WgKeysRotationInterval { interval } => {
                s.prefs.update(|p| p.session.wg_keys_regen_interval = interval)?;
                Ok(ResponseBody::Ack)
            }
            Command::SetPreferences { key, value } => {
                s.prefs.set_preference(&key, &value)?;
                Ok(ResponseBody::Ack)
            }
            Command::GetPreferences => Ok(ResponseBody::Preferences {
                preferences: public_preferences(s.prefs.get()),
            }),
            Command::EaaSetPassword { old_hash, new_hash } => {
                s.eaa.set(&old_hash, &new_hash)?;
                if s.eaa.is_enabled() && s.prefs.get().wifi_control.can_apply_in_background {
                    log::info!("EAA enabled: background WiFi actions turned off");
                    s.prefs.update(|p| p.wifi_control.can_apply_in_background = false)?;
                }
                Ok(ResponseBody::Ack)
            }
        }
    }
}
