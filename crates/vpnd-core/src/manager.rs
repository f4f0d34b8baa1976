//! Connection manager.
//!
//! One task owns the connection state machine. Frontends, the running
//! backend, the route change detector and the WiFi monitor only enqueue
//! events; each transition runs to completion (or rolls back) before the
//! next event is taken, so concurrent requests are totally ordered.
//!
//! Only one session exists at a time. A session is the tunnel backend, the
//! optional obfuscation proxy and everything applied on their behalf:
//! firewall exceptions, the client endpoint, DNS, split-tunnel addresses and
//! the route change watcher. Tearing a session down always undoes all of it.

use crate::backend::wireguard::keys::{self, KeyRegistrar};
use crate::backend::{create_backend, BackendContext, StateSink, TunnelBackend};
use crate::dns::{DnsController, DnsSettings};
use crate::error::{ErrorKind, VpnError, VpnResult};
use crate::firewall::{ClientEndpoint, Firewall, FirewallState};
use crate::netchange::{NetChangeDetector, NetChangeEvent};
use crate::ping::PingResult;
use crate::preferences::{PreferencesStore, SessionData};
use crate::splittun::{ConfigAddresses, SplitTunnel, SplitTunnelState};
use crate::types::{
    unix_now, ConnectedInfo, ConnectionRequest, ConnectionState, StateInfo, V2RayTransport, VpnType,
};
use crate::v2ray::{ObfuscationProxy, V2Ray};
use crate::wifi::{self, PolicyAction, WifiInfo};
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A tunnel that has not reported `Connected` by then is restarted.
pub const HANDSHAKE_CUTOFF: Duration = Duration::from_secs(60);
/// Reconnect attempts made without delay before backing off.
pub const IMMEDIATE_RETRIES: u32 = 3;
pub const BACKOFF_BASE: Duration = Duration::from_millis(1000);
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);
pub const BACKOFF_JITTER_MS: u64 = 500;

const COMMAND_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 64;

/// Delay before reconnect attempt `attempt` (1-based).
pub fn reconnect_delay<R: Rng + ?Sized>(attempt: u32, rng: &mut R) -> Duration {
    if attempt <= IMMEDIATE_RETRIES {
        return Duration::ZERO;
    }
    let exponent = (attempt - IMMEDIATE_RETRIES - 1).min(16);
    let backoff = BACKOFF_BASE.saturating_mul(1 << exponent).min(BACKOFF_MAX);
    backoff + Duration::from_millis(rng.random_range(0..=BACKOFF_JITTER_MS))
}

// ============================================================================
// Public surface
// ============================================================================

/// Pushed to every attached frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Event")]
pub enum DaemonEvent {
    VpnStateChanged {
        state: StateInfo,
        paused: bool,
    },
    Connected {
        info: ConnectedInfo,
    },
    Disconnected {
        failure: bool,
        reason: Option<ErrorKind>,
        message: String,
    },
    DnsChanged {
        dns: Option<DnsSettings>,
    },
    KillSwitchStatus {
        state: FirewallState,
    },
    SplitTunnelStatus {
        state: SplitTunnelState,
    },
    ServerPingResult {
        results: Vec<PingResult>,
    },
    WifiChanged {
        wifi: WifiInfo,
    },
}

/// Snapshot of the manager, readable without a round trip to its task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub state: StateInfo,
    pub paused: bool,
    pub connected: Option<ConnectedInfo>,
    pub request: Option<ConnectionRequest>,
}

impl ManagerStatus {
    fn idle() -> Self {
        Self {
            state: StateInfo::new(ConnectionState::Disconnected, VpnType::WireGuard),
            paused: false,
            connected: None,
            request: None,
        }
    }
}

type Reply<T> = oneshot::Sender<VpnResult<T>>;

enum Command {
    Connect {
        req: Box<ConnectionRequest>,
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Pause {
        duration: Option<Duration>,
        reply: Reply<()>,
    },
    Resume {
        reply: Reply<()>,
    },
    SetManualDns {
        dns: DnsSettings,
        reply: Reply<()>,
    },
    KeepFirewall,
    Wifi(WifiInfo),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Counts attached frontends for as long as it lives.
pub struct FrontendGuard(Arc<AtomicUsize>);

impl Drop for FrontendGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ManagerHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<DaemonEvent>,
    status: watch::Receiver<ManagerStatus>,
    frontends: Arc<AtomicUsize>,
}

impl ManagerHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> VpnResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| VpnError::internal("connection manager stopped"))?;
        rx.await
            .map_err(|_| VpnError::internal("connection manager stopped"))?
    }

    /// Start a connection, replacing the current one.
    ///
    /// Returns once the attempt is under way; progress is reported through
    /// [`DaemonEvent`]s.
    pub async fn connect(&self, req: ConnectionRequest) -> VpnResult<()> {
        self.request(|reply| Command::Connect {
            req: Box::new(req),
            reply,
        })
        .await
    }

    pub async fn disconnect(&self) -> VpnResult<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Tear the tunnel down but keep the request. `None` pauses until
    /// [`resume`](Self::resume).
    pub async fn pause(&self, duration: Option<Duration>) -> VpnResult<()> {
        self.request(|reply| Command::Pause { duration, reply }).await
    }

    pub async fn resume(&self) -> VpnResult<()> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// Change the resolver of the current connection; an empty value returns
    /// to the tunnel's default.
    pub async fn set_manual_dns(&self, dns: DnsSettings) -> VpnResult<()> {
        self.request(|reply| Command::SetManualDns { dns, reply }).await
    }

    /// The user changed the kill-switch; it is no longer turned off when the
    /// connection ends.
    pub async fn keep_firewall(&self) {
        let _ = self.commands.send(Command::KeepFirewall).await;
    }

    pub async fn wifi_changed(&self, wifi: WifiInfo) {
        let _ = self.commands.send(Command::Wifi(wifi)).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.events.subscribe()
    }

    /// Push an event produced outside the manager.
    pub fn emit(&self, event: DaemonEvent) {
        let _ = self.events.send(event);
    }

    pub fn status(&self) -> ManagerStatus {
        self.status.borrow().clone()
    }

    pub fn frontend_attached(&self) -> FrontendGuard {
        self.frontends.fetch_add(1, Ordering::SeqCst);
        FrontendGuard(self.frontends.clone())
    }

    /// Disconnect and stop the manager task.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = done.await;
        }
    }
}

// ============================================================================
// Dependencies
// ============================================================================

pub type BackendFactory = Arc<
    dyn Fn(&BackendContext, &ConnectionRequest, &SessionData) -> VpnResult<Arc<dyn TunnelBackend>>
        + Send
        + Sync,
>;

pub type ProxyFactory =
    Arc<dyn Fn(&BackendContext, ObfuscationTarget) -> Arc<dyn ObfuscationProxy> + Send + Sync>;

/// Obfuscation server plus the VPN endpoint the proxy forwards to.
#[derive(Debug, Clone)]
pub struct ObfuscationTarget {
    pub spec: crate::types::ObfuscationSpec,
    pub target: SocketAddr,
}

pub struct ManagerDeps {
    pub ctx: BackendContext,
    pub firewall: Arc<Firewall>,
    pub dns: Arc<DnsController>,
    pub split: Arc<SplitTunnel>,
    pub netchange: Arc<NetChangeDetector>,
    pub prefs: Arc<PreferencesStore>,
    pub registrar: Option<Arc<dyn KeyRegistrar>>,
    pub backends: BackendFactory,
    pub proxies: ProxyFactory,
    pub rng: Box<dyn RngCore + Send + Sync>,
}

impl ManagerDeps {
    pub fn new(
        ctx: BackendContext,
        firewall: Arc<Firewall>,
        dns: Arc<DnsController>,
        split: Arc<SplitTunnel>,
        netchange: Arc<NetChangeDetector>,
        prefs: Arc<PreferencesStore>,
    ) -> Self {
        Self {
            ctx,
            firewall,
            dns,
            split,
            netchange,
            prefs,
            registrar: None,
            backends: Arc::new(create_backend),
            proxies: Arc::new(|ctx, t| Arc::new(V2Ray::new(ctx, t.spec, t.target))),
            rng: Box::new(rand::rngs::StdRng::from_os_rng()),
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn KeyRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn with_backends(mut self, backends: BackendFactory) -> Self {
        self.backends = backends;
        self
    }

    pub fn with_proxies(mut self, proxies: ProxyFactory) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_rng(mut self, rng: Box<dyn RngCore + Send + Sync>) -> Self {
        self.rng = rng;
        self
    }
}

/// Start the manager task.
pub fn spawn(deps: ManagerDeps) -> (ManagerHandle, JoinHandle<()>) {
    let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
    let (events, _) = broadcast::channel(EVENT_QUEUE);
    let (status_tx, status) = watch::channel(ManagerStatus::idle());
    let (internal_tx, internal) = mpsc::unbounded_channel();
    let frontends = Arc::new(AtomicUsize::new(0));
    let netchange = deps.netchange.subscribe();

    let manager = Manager {
        deps,
        events: events.clone(),
        status: status_tx,
        frontends: frontends.clone(),
        internal: internal_tx,
        phase: Phase::Idle,
        generation: 0,
        attempts: 0,
        timer: None,
        fw_enabled_for_connection: false,
    };
    let task = tokio::spawn(manager.run(commands, internal, netchange));
    (
        ManagerHandle {
            commands: commands_tx,
            events,
            status,
            frontends,
        },
        task,
    )
}

// ============================================================================
// State machine
// ============================================================================

enum Internal {
    State { generation: u64, info: StateInfo },
    Stopped { generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    HandshakeCutoff { generation: u64 },
    Resume,
    Retry,
}

struct Session {
    generation: u64,
    /// As requested; never rewritten for the proxy.
    req: ConnectionRequest,
    backend: Arc<dyn TunnelBackend>,
    proxy: Option<Arc<dyn ObfuscationProxy>>,
    cancel: CancellationToken,
    task: JoinHandle<VpnResult<()>>,
    last: StateInfo,
    local_ip: Option<IpAddr>,
    connected: bool,
    auth_error: bool,
}

enum Phase {
    Idle,
    Active(Session),
    Paused { req: ConnectionRequest },
    /// Between reconnect attempts.
    Waiting { req: ConnectionRequest },
}

struct Manager {
    deps: ManagerDeps,
    events: broadcast::Sender<DaemonEvent>,
    status: watch::Sender<ManagerStatus>,
    frontends: Arc<AtomicUsize>,
    internal: mpsc::UnboundedSender<Internal>,
    phase: Phase,
    generation: u64,
    attempts: u32,
    timer: Option<(Instant, Timer)>,
    fw_enabled_for_connection: bool,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_route_event(rx: &mut Option<broadcast::Receiver<NetChangeEvent>>) -> NetChangeEvent {
    loop {
        let Some(events) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match events.recv().await {
            Ok(event) => return event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::debug!("Missed {} route change events", n);
                return NetChangeEvent::RoutingUpdate;
            }
            Err(broadcast::error::RecvError::Closed) => *rx = None,
        }
    }
}

/// Hosts the kill-switch must reach before the tunnel is up.
fn exception_hosts(req: &ConnectionRequest) -> Vec<IpAddr> {
    let mut hosts = vec![req.entry.ip];
    if let Some(spec) = &req.obfuscation {
        hosts.push(spec.host);
    }
    if let Some(proxy) = &req.proxy {
        hosts.push(proxy.address);
    }
    hosts.dedup();
    hosts
}

impl Manager {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        netchange: broadcast::Receiver<NetChangeEvent>,
    ) {
        let mut netchange = Some(netchange);
        loop {
            let deadline = self.timer.map(|(at, _)| at);
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(msg) = internal.recv() => match msg {
                    Internal::State { generation, info } => self.on_backend_state(generation, info).await,
                    Internal::Stopped { generation } => self.on_backend_stopped(generation).await,
                },
                event = next_route_event(&mut netchange) => self.on_route_event(event).await,
                _ = sleep_until(deadline) => {
                    if let Some((_, timer)) = self.timer.take() {
                        self.on_timer(timer).await;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { req, reply } => {
                let result = self.connect(*req).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(Ok(()));
            }
            Command::Pause { duration, reply } => {
                let result = self.pause(duration).await;
                let _ = reply.send(result);
            }
            Command::Resume { reply } => {
                let result = self.resume().await;
                let _ = reply.send(result);
            }
            Command::SetManualDns { dns, reply } => {
                let result = self.set_manual_dns(dns).await;
                let _ = reply.send(result);
            }
            Command::KeepFirewall => self.fw_enabled_for_connection = false,
            Command::Wifi(info) => self.on_wifi(info).await,
            Command::Shutdown { .. } => {}
        }
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    fn emit(&self, event: DaemonEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self, state: StateInfo, paused: bool, request: Option<&ConnectionRequest>) {
        log::info!(
            "VPN state: {}{}{}",
            state.state,
            if state.description.is_empty() { "" } else { " " },
            state.description
        );
        self.status.send_modify(|s| {
            match state.state {
                ConnectionState::Connected => s.connected = Some(ConnectedInfo::from(&state)),
                ConnectionState::Disconnected | ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    s.connected = None
                }
                _ => {}
            }
            s.state = state.clone();
            s.paused = paused;
            s.request = request.cloned();
        });
        self.emit(DaemonEvent::VpnStateChanged { state, paused });
    }

    async fn emit_firewall(&self) {
        self.emit(DaemonEvent::KillSwitchStatus {
            state: self.deps.firewall.state().await,
        });
    }

    // ------------------------------------------------------------------------
    // User requests
    // ------------------------------------------------------------------------

    async fn connect(&mut self, req: ConnectionRequest) -> VpnResult<()> {
        req.validate()?;
        if !self.deps.prefs.session().is_logged_in() {
            return Err(VpnError::NotLoggedIn);
        }

        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Active(session) => {
                log::info!("Closing current connection before connecting to {}", req.entry.ip);
                let vpn_type = session.req.vpn_type;
                let _ = self.stop_session(session).await;
                self.publish(StateInfo::new(ConnectionState::Disconnected, vpn_type), false, None);
            }
            Phase::Paused { .. } | Phase::Waiting { .. } => {}
        }
        self.timer = None;
        self.attempts = 0;
        self.start_or_retry(req).await
    }

    async fn disconnect(&mut self) {
        self.timer = None;
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Active(session) => {
                let vpn_type = session.req.vpn_type;
                let _ = self.stop_session(session).await;
                self.finish_disconnected(vpn_type, None).await;
            }
            Phase::Paused { req } | Phase::Waiting { req } => {
                self.finish_disconnected(req.vpn_type, None).await;
            }
        }
    }

    async fn pause(&mut self, duration: Option<Duration>) -> VpnResult<()> {
        let req = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => return Err(VpnError::conflict("not connected")),
            Phase::Active(session) => {
                let req = session.req.clone();
                let _ = self.stop_session(session).await;
                req
            }
            Phase::Paused { req } | Phase::Waiting { req } => req,
        };
        // The kill-switch stays up; only the tunnel exceptions are gone.

        self.timer = duration.map(|d| (Instant::now() + d, Timer::Resume));
        match duration {
            Some(d) => log::info!("Connection paused for {}s", d.as_secs()),
            None => log::info!("Connection paused"),
        }
        self.publish(
            StateInfo::new(ConnectionState::Reconnecting, req.vpn_type).with_description("paused"),
            true,
            Some(&req),
        );
        self.phase = Phase::Paused { req };
        Ok(())
    }

    async fn resume(&mut self) -> VpnResult<()> {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Paused { req } => {
                log::info!("Resuming connection");
                self.timer = None;
                self.attempts = 0;
                self.start_or_retry(req).await
            }
            other => {
                self.phase = other;
                Err(VpnError::conflict("connection is not paused"))
            }
        }
    }

    async fn set_manual_dns(&mut self, dns: DnsSettings) -> VpnResult<()> {
        dns.validate()?;
        match &mut self.phase {
            Phase::Idle => return Ok(()),
            Phase::Paused { req } | Phase::Waiting { req } => {
                req.manual_dns = dns;
                return Ok(());
            }
            Phase::Active(session) => session.req.manual_dns = dns,
        }

        let Phase::Active(session) = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return Ok(());
        };
        let result = match session.local_ip {
            Some(local_ip) => self.apply_dns(&session, local_ip).await,
            None => Ok(()),
        };
        self.phase = Phase::Active(session);
        result
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Start `req`; recoverable failures schedule another attempt.
    ///
    /// Returns an error only when the failure ends the connection.
    async fn start_or_retry(&mut self, req: ConnectionRequest) -> VpnResult<()> {
        match self.start_session(&req).await {
            Ok(session) => {
                self.phase = Phase::Active(session);
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                log::warn!("Failed to start connection: {}", e);
                self.schedule_retry(req, true);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start connection: {}", e);
                self.finish_disconnected(req.vpn_type, Some(&e)).await;
                Err(e)
            }
        }
    }

    async fn start_session(&mut self, req: &ConnectionRequest) -> VpnResult<Session> {
        self.generation += 1;
        let generation = self.generation;
        let connecting = StateInfo::new(ConnectionState::Connecting, req.vpn_type);
        self.publish(connecting.clone(), false, Some(req));

        let mut session_data = self.deps.prefs.session();
        if req.vpn_type == VpnType::WireGuard {
            self.rotate_keys_if_due(&mut session_data).await;
        }

        let firewall = self.deps.firewall.clone();
        if req.firewall_on_during_connection && !firewall.is_enabled().await {
            firewall.set_enabled(true).await?;
            self.fw_enabled_for_connection = true;
            self.emit_firewall().await;
        }
        let exceptions = exception_hosts(req);
        firewall.add_host_exceptions(&exceptions, false, false).await?;

        match self.launch(req, &session_data, generation).await {
            Ok((backend, proxy, cancel, task)) => {
                self.timer = Some((Instant::now() + HANDSHAKE_CUTOFF, Timer::HandshakeCutoff { generation }));
                Ok(Session {
                    generation,
                    req: req.clone(),
                    backend,
                    proxy,
                    cancel,
                    task,
                    last: connecting,
                    local_ip: None,
                    connected: false,
                    auth_error: false,
                })
            }
            Err(e) => {
                if let Err(e) = firewall.remove_host_exceptions(&exceptions).await {
                    log::warn!("Failed to remove firewall exceptions: {}", e);
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn launch(
        &self,
        req: &ConnectionRequest,
        session_data: &SessionData,
        generation: u64,
    ) -> VpnResult<(
        Arc<dyn TunnelBackend>,
        Option<Arc<dyn ObfuscationProxy>>,
        CancellationToken,
        JoinHandle<VpnResult<()>>,
    )> {
        let mut dial = req.clone();
        let proxy = match &req.obfuscation {
            Some(spec) => {
                let target = ObfuscationTarget {
                    spec: spec.clone(),
                    target: SocketAddr::new(req.entry.ip, req.dial_port()),
                };
                let proxy = (self.deps.proxies)(&self.deps.ctx, target);
                let port = proxy.start().await?;
                dial.entry.ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
                dial.entry.port = port;
                dial.entry.transport = spec.transport.tunnel_transport();
                if let Some(exit) = dial.exit.as_mut() {
                    exit.multihop_port = port;
                }
                dial.obfuscation = None;
                Some(proxy)
            }
            None => None,
        };

        let backend = match self.build_backend(&dial, session_data).await {
            Ok(backend) => backend,
            Err(e) => {
                if let Some(proxy) = &proxy {
                    proxy.stop().await;
                }
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let sink = {
            let internal = self.internal.clone();
            StateSink::new(move |info| {
                let _ = internal.send(Internal::State { generation, info });
            })
        };
        let task = {
            let backend = backend.clone();
            let internal = self.internal.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let result = backend.connect(sink, cancel).await;
                let _ = internal.send(Internal::Stopped { generation });
                result
            })
        };
        Ok((backend, proxy, cancel, task))
    }

    async fn build_backend(
        &self,
        dial: &ConnectionRequest,
        session_data: &SessionData,
    ) -> VpnResult<Arc<dyn TunnelBackend>> {
        let backend = (self.deps.backends)(&self.deps.ctx, dial, session_data)?;
        backend.init().await?;
        Ok(backend)
    }

    async fn rotate_keys_if_due(&self, session_data: &mut SessionData) {
        let Some(registrar) = self.deps.registrar.as_deref() else {
            return;
        };
        let now = unix_now();
        if !keys::needs_rotation(session_data, now) {
            return;
        }
        let ctx = &self.deps.ctx;
        match keys::rotate_keys(ctx.runner.as_ref(), &ctx.binaries.wg, Some(registrar), session_data, now).await {
            Ok(()) => {
                if let Err(e) = self.deps.prefs.set_session(session_data.clone()) {
                    log::warn!("Failed to store new WireGuard keys: {}", e);
                }
            }
            Err(e) => log::warn!("WireGuard key rotation failed: {}", e),
        }
    }

    /// Stop the backend and undo everything applied for the session.
    async fn stop_session(&mut self, mut session: Session) -> VpnResult<()> {
        let deps = &self.deps;
        deps.netchange.stop().await;

        if session.local_ip.is_some() {
            deps.dns.revert().await;
            self.emit(DaemonEvent::DnsChanged { dns: None });
            if cfg!(windows) {
                if let Err(e) = deps.firewall.single_dns_rule_off().await {
                    log::warn!("Failed to remove single DNS rule: {}", e);
                }
            }
        }
        if let Err(e) = deps.firewall.client_disconnected().await {
            log::error!("Failed to reset kill-switch exceptions: {}", e);
        }
        if let Err(e) = deps.firewall.set_allowed_applications(Vec::new()).await {
            log::warn!("Failed to reset kill-switch applications: {}", e);
        }

        session.cancel.cancel();
        let result = match (&mut session.task).await {
            Ok(result) => result,
            Err(e) => Err(VpnError::internal(format!("connection task failed: {}", e))),
        };

        if let Some(proxy) = &session.proxy {
            proxy.stop().await;
        }
        if let Err(e) = deps.split.set_vpn(false, ConfigAddresses::default()).await {
            log::warn!("Failed to update split tunnel: {}", e);
        }
        if self.timer.map(|(_, t)| t) == Some(Timer::HandshakeCutoff { generation: session.generation }) {
            self.timer = None;
        }
        self.emit_firewall().await;
        result
    }

    /// Decide what follows a session that ended with `result`.
    async fn after_session(&mut self, req: ConnectionRequest, result: VpnResult<()>, auth_error: bool) {
        match result {
            _ if auth_error => {
                log::error!("Authentication failed, not reconnecting");
                self.finish_disconnected(req.vpn_type, Some(&VpnError::AuthFailed)).await;
            }
            Err(e @ VpnError::ReconnectionRequired { .. }) => {
                log::info!("{}; reconnecting", e);
                self.schedule_retry(req, false);
            }
            Err(e) if !e.is_recoverable() => {
                log::error!("Connection failed: {}", e);
                self.finish_disconnected(req.vpn_type, Some(&e)).await;
            }
            Err(e) => {
                log::warn!("Connection lost: {}", e);
                self.schedule_retry(req, true);
            }
            Ok(()) => {
                log::warn!("Connection closed by the tunnel");
                self.schedule_retry(req, true);
            }
        }
    }

    fn schedule_retry(&mut self, req: ConnectionRequest, counted: bool) {
        let delay = if counted {
            self.attempts += 1;
            reconnect_delay(self.attempts, &mut *self.deps.rng)
        } else {
            Duration::ZERO
        };
        log::info!("Reconnecting in {}ms (attempt {})", delay.as_millis(), self.attempts);
        self.publish(
            StateInfo::new(ConnectionState::Reconnecting, req.vpn_type),
            false,
            Some(&req),
        );
        self.timer = Some((Instant::now() + delay, Timer::Retry));
        self.phase = Phase::Waiting { req };
    }

    async fn release_connection_firewall(&mut self) {
        if !self.fw_enabled_for_connection {
            return;
        }
        self.fw_enabled_for_connection = false;
        let firewall = self.deps.firewall.clone();
        if firewall.state().await.persistent {
            return;
        }
        match firewall.set_enabled(false).await {
            Ok(_) => self.emit_firewall().await,
            Err(e) => log::error!("Failed to disable kill-switch: {}", e),
        }
    }

    async fn finish_disconnected(&mut self, vpn_type: VpnType, error: Option<&VpnError>) {
        self.phase = Phase::Idle;
        self.timer = None;
        self.attempts = 0;
        self.release_connection_firewall().await;
        self.publish(StateInfo::new(ConnectionState::Disconnected, vpn_type), false, None);
        self.emit(DaemonEvent::Disconnected {
            failure: error.is_some(),
            reason: error.map(VpnError::kind),
            message: error.map(|e| e.to_string()).unwrap_or_default(),
        });
    }

    async fn shutdown(&mut self) {
        log::info!("Connection manager shutting down");
        self.disconnect().await;
    }

    // ------------------------------------------------------------------------
    // Backend reports
    // ------------------------------------------------------------------------

    async fn on_backend_state(&mut self, generation: u64, mut info: StateInfo) {
        let mut session = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Active(s) if s.generation == generation => s,
            other => {
                self.phase = other;
                return;
            }
        };

        if let Some(spec) = &session.req.obfuscation {
            info.server_ip = Some(session.req.entry.ip);
            info.server_port = session.req.dial_port();
            info.is_tcp = spec.transport == V2RayTransport::Tcp;
            info.v2ray = Some(spec.transport);
        }
        if info.state == ConnectionState::Exiting && info.is_auth_error {
            session.auth_error = true;
        }

        let tunnel_up = matches!(info.state, ConnectionState::Initialised | ConnectionState::Connected);
        if tunnel_up && session.local_ip.is_none() {
            if let Err(e) = self.on_tunnel_up(&mut session, &info).await {
                log::error!("Failed to configure the connection: {}", e);
                let vpn_type = session.req.vpn_type;
                let _ = self.stop_session(session).await;
                self.finish_disconnected(vpn_type, Some(&e)).await;
                return;
            }
        }

        if info.state != session.last.state {
            self.publish(info.clone(), false, Some(&session.req));
        }
        if info.state == ConnectionState::Connected && !session.connected {
            session.connected = true;
            self.attempts = 0;
            if self.timer.map(|(_, t)| t) == Some(Timer::HandshakeCutoff { generation }) {
                self.timer = None;
            }
            if let Err(e) = self.deps.prefs.save_last_connection(&session.req) {
                log::warn!("Failed to save last connection: {}", e);
            }
            self.emit(DaemonEvent::Connected {
                info: ConnectedInfo::from(&info),
            });
        }
        session.last = info;
        self.phase = Phase::Active(session);
    }

    async fn on_tunnel_up(&mut self, session: &mut Session, info: &StateInfo) -> VpnResult<()> {
        let client_ip = info
            .client_ip
            .ok_or_else(|| VpnError::internal("tunnel reported no client address"))?;
        let (server_ip, server_port, tcp) = match &session.req.obfuscation {
            Some(spec) => (spec.host, spec.port, spec.transport == V2RayTransport::Tcp),
            None => (
                info.server_ip.unwrap_or(session.req.entry.ip),
                session.req.dial_port(),
                session.req.entry.transport.is_tcp(),
            ),
        };
        self.deps
            .firewall
            .client_connected(ClientEndpoint {
                local_ip: client_ip,
                local_ip6: info.client_ip6,
                local_port: info.client_port,
                server_ip,
                server_port,
                tcp,
            })
            .await?;

        let local_ip = IpAddr::V4(client_ip);
        session.local_ip = Some(local_ip);
        self.apply_dns(session, local_ip).await?;

        let netchange = &self.deps.netchange;
        netchange.init(local_ip).await;
        if let Err(e) = netchange.start() {
            log::warn!("Route change detection unavailable: {}", e);
        }

        let addrs = ConfigAddresses {
            tunnel_v4: Some(client_ip),
            tunnel_v6: info.client_ip6,
            ..Default::default()
        };
        if let Err(e) = self.deps.split.set_vpn(true, addrs).await {
            log::warn!("Failed to update split tunnel: {}", e);
        }
        self.emit_firewall().await;
        Ok(())
    }

    /// Apply the session's resolver: the manual one if set, else the
    /// tunnel's default.
    async fn apply_dns(&self, session: &Session, local_ip: IpAddr) -> VpnResult<()> {
        let dns = &self.deps.dns;
        let manual = &session.req.manual_dns;
        let current = if !manual.is_empty() {
            dns.set_manual(manual, local_ip).await?;
            Some(manual.clone())
        } else {
            match session.backend.default_dns() {
                Some(ip) if session.backend.applies_default_dns() => {
                    dns.revert().await;
                    Some(DnsSettings::plain(ip))
                }
                Some(ip) => {
                    dns.set_default(ip, local_ip).await?;
                    Some(DnsSettings::plain(ip))
                }
                None => {
                    dns.revert().await;
                    None
                }
            }
        };

        let firewall = &self.deps.firewall;
        let encrypted = current.as_ref().is_some_and(DnsSettings::is_encrypted);
        let pin = current.as_ref().filter(|d| !d.is_encrypted()).and_then(DnsSettings::address);
        firewall.on_dns_changed(pin).await?;
        let apps = if encrypted {
            dns.proxy_binary().into_iter().collect()
        } else {
            Vec::new()
        };
        firewall.set_allowed_applications(apps).await?;
        if cfg!(windows) && !firewall.is_enabled().await {
            match pin {
                Some(ip) => firewall.single_dns_rule_on(ip).await?,
                None => firewall.single_dns_rule_off().await?,
            }
        }

        self.emit(DaemonEvent::DnsChanged { dns: current });
        Ok(())
    }

    async fn on_backend_stopped(&mut self, generation: u64) {
        let session = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Active(s) if s.generation == generation => s,
            other => {
                self.phase = other;
                return;
            }
        };
        let req = session.req.clone();
        let auth_error = session.auth_error;
        let result = self.stop_session(session).await;
        self.after_session(req, result, auth_error).await;
    }

    // ------------------------------------------------------------------------
    // Timers and external signals
    // ------------------------------------------------------------------------

    async fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::HandshakeCutoff { generation } => {
                let session = match std::mem::replace(&mut self.phase, Phase::Idle) {
                    Phase::Active(s) if s.generation == generation && !s.connected => s,
                    other => {
                        self.phase = other;
                        return;
                    }
                };
                log::warn!("No handshake within {}s, restarting the connection", HANDSHAKE_CUTOFF.as_secs());
                let req = session.req.clone();
                let _ = self.stop_session(session).await;
                self.after_session(req, Err(VpnError::HandshakeTimeout), false).await;
            }
            Timer::Resume | Timer::Retry => match std::mem::replace(&mut self.phase, Phase::Idle) {
                Phase::Paused { req } | Phase::Waiting { req } => {
                    if timer == Timer::Resume {
                        self.attempts = 0;
                    }
                    // Terminal failures are already reported as Disconnected.
                    let _ = self.start_or_retry(req).await;
                }
                other => self.phase = other,
            },
        }
    }

    async fn on_route_event(&mut self, event: NetChangeEvent) {
        let (backend, proxy) = match &self.phase {
            Phase::Active(s) if s.local_ip.is_some() => (s.backend.clone(), s.proxy.clone()),
            _ => return,
        };
        match event {
            NetChangeEvent::RoutingChanged => self.restart("routing changed").await,
            NetChangeEvent::RoutingUpdate => {
                if let Some(proxy) = proxy {
                    if let Err(e) = proxy.on_routing_changed().await {
                        log::warn!("Failed to update obfuscation route: {}", e);
                    }
                }
                if let Err(e) = backend.on_routing_changed().await {
                    log::warn!("Failed to follow the routing change: {}", e);
                    self.restart("server route lost").await;
                    return;
                }
                if let Err(e) = self.deps.firewall.refresh().await {
                    log::warn!("Failed to refresh kill-switch: {}", e);
                }
            }
        }
    }

    /// Reconnect right away without counting an attempt.
    async fn restart(&mut self, reason: &str) {
        if let Phase::Active(session) = std::mem::replace(&mut self.phase, Phase::Idle) {
            log::info!("Restarting connection: {}", reason);
            let req = session.req.clone();
            let _ = self.stop_session(session).await;
            self.schedule_retry(req, false);
        }
    }

    async fn on_wifi(&mut self, info: WifiInfo) {
        let policy = self.deps.prefs.get().wifi_control;
        let can_apply = self.frontends.load(Ordering::SeqCst) > 0 || policy.can_apply_in_background;
        let actions = wifi::evaluate(&policy, &info, can_apply);
        log::info!("WiFi network '{}' (insecure: {}): {:?}", info.ssid, info.is_insecure, actions);
        self.emit(DaemonEvent::WifiChanged { wifi: info });

        let firewall = self.deps.firewall.clone();
        for action in actions {
            match action {
                PolicyAction::DisconnectVpn => self.disconnect().await,
                PolicyAction::DisableFirewall => match firewall.set_enabled(false).await {
                    Ok(_) => self.fw_enabled_for_connection = false,
                    Err(e) => log::warn!("Trusted network: kill-switch stays on: {}", e),
                },
                PolicyAction::ConnectVpn => {
                    if !matches!(self.phase, Phase::Idle) {
                        continue;
                    }
                    match self.deps.prefs.load_last_connection() {
                        Ok(Some(req)) => {
                            if let Err(e) = self.connect(req).await {
                                log::warn!("Untrusted network: failed to connect: {}", e);
                            }
                        }
                        Ok(None) => log::info!("Untrusted network: no previous connection to restore"),
                        Err(e) => log::warn!("Untrusted network: {}", e),
                    }
                }
                PolicyAction::EnableFirewall => match firewall.set_enabled(true).await {
                    Ok(_) => self.fw_enabled_for_connection = false,
                    Err(e) => log::error!("Untrusted network: failed to enable kill-switch: {}", e),
                },
                PolicyAction::BlockLan => {
                    if let Err(e) = firewall.allow_lan(false, false).await {
                        log::error!("Untrusted network: failed to block LAN: {}", e);
                    }
                }
            }
        }
        self.emit_firewall().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::backend::MemoryDnsBackend;
    use crate::dns::journal::DnsJournal;
    use crate::dns::proxy::NoEncryptedDns;
    use crate::firewall::MemoryBackend;
    use crate::netchange::{ChangeSource, ChannelSource, RouteProbe, SourceFactory};
    use crate::route::MemoryRoutingTable;
    use crate::splittun::UnsupportedBackend;
    use crate::testing::{test_session, wg_request};
    use crate::types::{ObfuscationSpec, Transport};
    use crate::wifi::WifiNetwork;
    use async_trait::async_trait;
    use rand_chacha::ChaCha8Rng;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;
    use vpnd_common::config::{BinaryPaths, OpenVpnFiles, StatePaths};
    use vpnd_common::shell::ScriptedRunner;

    const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(172, 21, 0, 5);
    const HOST_DNS: Ipv4Addr = Ipv4Addr::new(172, 21, 0, 1);

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Script {
        /// Connect and stay up until cancelled.
        Connect,
        /// Connect, then report the tunnel gone.
        ConnectThenDrop,
        /// OpenVPN-style authentication failure.
        AuthFailure,
        /// Never get a handshake.
        Silent,
    }

    #[derive(Default)]
    struct Recorder {
        scripts: StdMutex<VecDeque<Script>>,
        dialled: StdMutex<Vec<ConnectionRequest>>,
        connects: AtomicUsize,
        route_updates: AtomicUsize,
    }

    struct FakeBackend {
        vpn_type: VpnType,
        dial: ConnectionRequest,
        script: Script,
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl TunnelBackend for FakeBackend {
        fn vpn_type(&self) -> VpnType {
            self.vpn_type
        }

        fn destination_ip(&self) -> IpAddr {
            self.dial.entry.ip
        }

        fn default_dns(&self) -> Option<IpAddr> {
            Some(IpAddr::V4(HOST_DNS))
        }

        async fn connect(&self, sink: StateSink, cancel: CancellationToken) -> VpnResult<()> {
            self.recorder.connects.fetch_add(1, Ordering::SeqCst);
            sink.send(StateInfo::new(ConnectionState::Connecting, self.vpn_type));
            match self.script {
                Script::AuthFailure => {
                    let mut exiting = StateInfo::new(ConnectionState::Exiting, self.vpn_type);
                    exiting.is_auth_error = true;
                    sink.send(exiting);
                    return Ok(());
                }
                Script::Silent => {
                    cancel.cancelled().await;
                    return Err(VpnError::Cancelled);
                }
                Script::Connect | Script::ConnectThenDrop => {}
            }

            let mut up = StateInfo::new(ConnectionState::Initialised, self.vpn_type);
            up.client_ip = Some(CLIENT_IP);
            up.client_port = 51820;
            up.server_ip = Some(self.dial.entry.ip);
            up.server_port = self.dial.dial_port();
            up.mtu = 1420;
            sink.send(up.clone());
            up.state = ConnectionState::Connected;
            sink.send(up);

            if self.script == Script::ConnectThenDrop {
                sink.send(StateInfo::new(ConnectionState::Exiting, self.vpn_type));
                return Ok(());
            }
            cancel.cancelled().await;
            Err(VpnError::Cancelled)
        }

        async fn on_routing_changed(&self) -> VpnResult<()> {
            self.recorder.route_updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeProxy {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ObfuscationProxy for FakeProxy {
        fn transport(&self) -> V2RayTransport {
            V2RayTransport::Quic
        }

        async fn start(&self) -> VpnResult<u16> {
            Ok(40001)
        }

        async fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        async fn on_routing_changed(&self) -> VpnResult<()> {
            Ok(())
        }
    }

    struct Harness {
        handle: ManagerHandle,
        events: broadcast::Receiver<DaemonEvent>,
        firewall: Arc<Firewall>,
        dns: MemoryDnsBackend,
        prefs: Arc<PreferencesStore>,
        recorder: Arc<Recorder>,
        proxy_stopped: Arc<AtomicBool>,
        poke: Arc<StdMutex<Option<mpsc::UnboundedSender<()>>>>,
        _dir: tempfile::TempDir,
    }

    fn harness(scripts: &[Script]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        let routes = MemoryRoutingTable::new();
        routes.set_default_gateway(ip("192.168.1.1"));
        let ctx = BackendContext {
            runner: ScriptedRunner::new().shared(),
            binaries: BinaryPaths::default(),
            openvpn_files: OpenVpnFiles::default(),
            paths: paths.clone(),
            routes: Arc::new(routes.clone()),
        };

        let firewall = Arc::new(Firewall::new(Arc::new(MemoryBackend::new()), Arc::new(Vec::new)));
        let dns_backend = MemoryDnsBackend::with_system(vec![ip("192.168.1.1")]);
        let dns = Arc::new(DnsController::new(
            Arc::new(dns_backend.clone()),
            Arc::new(NoEncryptedDns),
            DnsJournal::new(&paths.dns_journal()),
            Arc::new(routes),
        ));
        let split = Arc::new(SplitTunnel::new(Arc::new(UnsupportedBackend), Arc::new(|_| None)));

        let poke: Arc<StdMutex<Option<mpsc::UnboundedSender<()>>>> = Arc::new(StdMutex::new(None));
        let slot = poke.clone();
        let factory: SourceFactory = Arc::new(move || {
            let (tx, source) = ChannelSource::new();
            *slot.lock().unwrap() = Some(tx);
            Ok(Box::new(source) as Box<dyn ChangeSource>)
        });
        let probe: RouteProbe = Arc::new(|_| Some(IpAddr::V4(CLIENT_IP)));
        let netchange = Arc::new(NetChangeDetector::new(factory, probe));

        let prefs = Arc::new(PreferencesStore::load(&paths).unwrap());
        prefs.set_session(test_session()).unwrap();

        let recorder = Arc::new(Recorder::default());
        recorder.scripts.lock().unwrap().extend(scripts.iter().copied());
        let rec = recorder.clone();
        let backends: BackendFactory = Arc::new(move |_, dial, _| {
            rec.dialled.lock().unwrap().push(dial.clone());
            let script = rec.scripts.lock().unwrap().pop_front().unwrap_or(Script::Connect);
            Ok(Arc::new(FakeBackend {
                vpn_type: dial.vpn_type,
                dial: dial.clone(),
                script,
                recorder: rec.clone(),
            }) as Arc<dyn TunnelBackend>)
        });
        let proxy_stopped = Arc::new(AtomicBool::new(false));
        let stopped = proxy_stopped.clone();
        let proxies: ProxyFactory = Arc::new(move |_, _| {
            Arc::new(FakeProxy {
                stopped: stopped.clone(),
            }) as Arc<dyn ObfuscationProxy>
        });

        let deps = ManagerDeps::new(ctx, firewall.clone(), dns, split, netchange, prefs.clone())
            .with_backends(backends)
            .with_proxies(proxies)
            .with_rng(Box::new(ChaCha8Rng::seed_from_u64(1)));
        let (handle, _task) = spawn(deps);
        Harness {
            events: handle.subscribe(),
            handle,
            firewall,
            dns: dns_backend,
            prefs,
            recorder,
            proxy_stopped,
            poke,
            _dir: dir,
        }
    }

    impl Harness {
        /// Events up to and including the first one matching `until`.
        async fn events_until<F>(&mut self, until: F) -> Vec<DaemonEvent>
        where
            F: Fn(&DaemonEvent) -> bool,
        {
            let mut seen = Vec::new();
            loop {
                let event = tokio::time::timeout(Duration::from_secs(600), self.events.recv())
                    .await
                    .expect("timed out waiting for event")
                    .unwrap();
                let done = until(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
        }

        async fn until_connected(&mut self) -> Vec<DaemonEvent> {
            self.events_until(|e| matches!(e, DaemonEvent::Connected { .. })).await
        }

        fn connects(&self) -> usize {
            self.recorder.connects.load(Ordering::SeqCst)
        }
    }

    fn states(events: &[DaemonEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                DaemonEvent::VpnStateChanged { state, .. } => Some(state.state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_reconnect_delay() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for attempt in 1..=IMMEDIATE_RETRIES {
            assert_eq!(reconnect_delay(attempt, &mut rng), Duration::ZERO);
        }
        let fourth = reconnect_delay(4, &mut rng);
        assert!(fourth >= Duration::from_millis(1000) && fourth <= Duration::from_millis(1500));
        let fifth = reconnect_delay(5, &mut rng);
        assert!(fifth >= Duration::from_millis(2000) && fifth <= Duration::from_millis(2500));
        let late = reconnect_delay(40, &mut rng);
        assert!(late >= BACKOFF_MAX && late <= BACKOFF_MAX + Duration::from_millis(BACKOFF_JITTER_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_happy_path() {
        let mut h = harness(&[]);
        assert!(!h.firewall.is_enabled().await);

        h.handle.connect(wg_request()).await.unwrap();
        let events = h.until_connected().await;
        assert_eq!(
            states(&events),
            [
                ConnectionState::Connecting,
                ConnectionState::Initialised,
                ConnectionState::Connected
            ]
        );
        let Some(DaemonEvent::Connected { info }) = events.last() else {
            panic!("expected Connected");
        };
        assert_eq!(info.client_ip, Some(CLIENT_IP));
        assert_eq!(info.client_ip6, None);
        assert_eq!(info.server_ip, Some(ip("185.253.97.12")));
        assert_eq!(info.server_port, 2049);
        assert_eq!(info.transport, Transport::Udp);

        let fw = h.firewall.state().await;
        assert!(fw.enabled);
        let endpoint = fw.client_endpoint.unwrap();
        assert_eq!(endpoint.local_ip, CLIENT_IP);
        assert_eq!(endpoint.server_ip, ip("185.253.97.12"));
        assert_eq!(fw.dns_pin, Some(IpAddr::V4(HOST_DNS)));
        assert!(fw.host_exceptions.is_empty());

        assert_eq!(h.dns.system(), vec![IpAddr::V4(HOST_DNS)]);
        assert_eq!(h.prefs.load_last_connection().unwrap(), Some(wg_request()));
        let status = h.handle.status();
        assert_eq!(status.state.state, ConnectionState::Connected);
        assert_eq!(status.connected.unwrap().client_ip, Some(CLIENT_IP));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_restores_pre_connect_state() {
        let mut h = harness(&[]);
        h.handle.connect(wg_request()).await.unwrap();
        h.until_connected().await;

        h.handle.disconnect().await.unwrap();
        let events = h
            .events_until(|e| matches!(e, DaemonEvent::Disconnected { .. }))
            .await;
        assert!(matches!(
            events.last(),
            Some(DaemonEvent::Disconnected { failure: false, .. })
        ));

        let fw = h.firewall.state().await;
        assert!(!fw.enabled);
        assert!(fw.client_endpoint.is_none());
        assert!(fw.dns_pin.is_none());
        assert!(fw.host_exceptions.values().all(|e| e.persistent));
        assert_eq!(h.dns.system(), vec![ip("192.168.1.1")]);
        assert_eq!(h.handle.status().state.state, ConnectionState::Disconnected);
        assert!(h.handle.status().connected.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_firewall_stays_on_after_disconnect() {
        let mut h = harness(&[]);
        h.firewall.set_enabled(true).await.unwrap();
        h.handle.connect(wg_request()).await.unwrap();
        h.until_connected().await;
        h.handle.disconnect().await.unwrap();
        assert!(h.firewall.is_enabled().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_on_timer() {
        let mut h = harness(&[]);
        h.handle.connect(wg_request()).await.unwrap();
        h.until_connected().await;

        let paused_at = Instant::now();
        h.handle.pause(Some(Duration::from_secs(300))).await.unwrap();
        let status = h.handle.status();
        assert!(status.paused);
        assert_eq!(status.state.state, ConnectionState::Reconnecting);
        assert_eq!(status.request, Some(wg_request()));
        assert_eq!(h.dns.system(), vec![ip("192.168.1.1")]);
        let fw = h.firewall.state().await;
        assert!(fw.enabled);
        assert_eq!(fw.client_endpoint, None);

        h.until_connected().await;
        assert!(paused_at.elapsed() >= Duration::from_secs(300));
        assert_eq!(h.connects(), 2);
        assert!(!h.handle.status().paused);
        assert!(h.firewall.is_enabled().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_paused_releases_kill_switch() {
        let mut h = harness(&[]);
        h.handle.connect(wg_request()).await.unwrap();
        h.until_connected().await;

        h.handle.pause(None).await.unwrap();
        assert!(h.firewall.is_enabled().await);

        h.handle.disconnect().await.unwrap();
        assert_eq!(h.handle.status().state.state, ConnectionState::Disconnected);
        assert!(!h.firewall.is_enabled().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_requires_pause() {
        let h = harness(&[]);
        assert!(matches!(h.handle.resume().await, Err(VpnError::Conflict { .. })));
        assert!(matches!(h.handle.pause(None).await, Err(VpnError::Conflict { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_terminal() {
        let mut h = harness(&[Script::AuthFailure]);
        h.handle.connect(wg_request()).await.unwrap();
        let events = h
            .events_until(|e| matches!(e, DaemonEvent::Disconnected { .. }))
            .await;
        match events.last() {
            Some(DaemonEvent::Disconnected { failure, reason, .. }) => {
                assert!(*failure);
                assert_eq!(*reason, Some(ErrorKind::AuthFailed));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.connects(), 1);
        assert!(!h.firewall.is_enabled().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_tunnel_reconnects() {
        let mut h = harness(&[Script::ConnectThenDrop]);
        h.handle.connect(wg_request()).await.unwrap();
        h.until_connected().await;

        let events = h.until_connected().await;
        assert!(states(&events).contains(&ConnectionState::Reconnecting));
        assert!(!events.iter().any(|e| matches!(e, DaemonEvent::Disconnected { .. })));
        assert_eq!(h.connects(), 2);
        // Kill-switch never dropped between the attempts.
        assert!(h.firewall.is_enabled().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_cutoff_restarts() {
        let mut h = harness(&[Script::Silent]);
        let started = Instant::now();
        h.handle.connect(wg_request()).await.unwrap();
        let events = h.until_connected().await;
        assert!(started.elapsed() >= HANDSHAKE_CUTOFF);
        assert!(states(&events).contains(&ConnectionState::Reconnecting));
        assert_eq!(h.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_requires_login() {
        let h = harness(&[]);
        h.prefs.set_session(SessionData::default()).unwrap();
        let err = h.handle.connect(wg_request()).await.unwrap_err();
        assert!(matches!(err, VpnError::NotLoggedIn));
        assert_eq!(h.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_obfuscated_connection_dials_local_proxy() {
        let mut h = harness(&[]);
        let mut req = wg_request();
        req.obfuscation = Some(ObfuscationSpec {
            transport: V2RayTransport::Quic,
            host: ip("185.253.97.100"),
            port: 443,
            id: "6b5f2d0e-1c2a-4b7e-9d3f-0a1b2c3d4e5f".into(),
            tls_server_name: "us-ca1.gw.example.net".into(),
        });
        h.handle.connect(req.clone()).await.unwrap();
        let events = h.until_connected().await;

        let dial = h.recorder.dialled.lock().unwrap()[0].clone();
        assert_eq!(dial.entry.ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(dial.entry.port, 40001);
        assert_eq!(dial.entry.transport, Transport::Udp);
        assert!(dial.obfuscation.is_none());

        let Some(DaemonEvent::Connected { info }) = events.last() else {
            panic!("expected Connected");
        };
        assert_eq!(info.server_ip, Some(ip("185.253.97.12")));
        assert_eq!(info.v2ray, Some(V2RayTransport::Quic));
        let endpoint = h.firewall.state().await.client_endpoint.unwrap();
        assert_eq!(endpoint.server_ip, ip("185.253.97.100"));
        assert_eq!(endpoint.server_port, 443);
        assert_eq!(h.prefs.load_last_connection().unwrap(), Some(req));

        h.handle.disconnect().await.unwrap();
        assert!(h.proxy_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_dns_while_connected() {
        let mut h = harness(&[]);
        h.handle.connect(wg_request()).await.unwrap();
        h.until_connected().await;

        h.handle.set_manual_dns(DnsSettings::plain(ip("9.9.9.9"))).await.unwrap();
        assert_eq!(h.dns.system(), vec![ip("9.9.9.9")]);
        assert_eq!(h.firewall.state().await.dns_pin, Some(ip("9.9.9.9")));

        h.handle.set_manual_dns(DnsSettings::default()).await.unwrap();
        assert_eq!(h.dns.system(), vec![IpAddr::V4(HOST_DNS)]);
        assert_eq!(h.firewall.state().await.dns_pin, Some(IpAddr::V4(HOST_DNS)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_update_keeps_connection() {
        let mut h = harness(&[]);
        h.handle.connect(wg_request()).await.unwrap();
        h.until_connected().await;

        h.poke.lock().unwrap().as_ref().unwrap().send(()).unwrap();
        tokio::time::sleep(crate::netchange::DEBOUNCE + Duration::from_secs(2)).await;

        assert_eq!(h.recorder.route_updates.load(Ordering::SeqCst), 1);
        assert_eq!(h.connects(), 1);
        assert_eq!(h.handle.status().state.state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untrusted_wifi_restores_last_connection() {
        let mut h = harness(&[]);
        h.prefs.save_last_connection(&wg_request()).unwrap();
        h.prefs
            .update(|p| {
                p.wifi_control.can_apply_in_background = true;
                p.wifi_control.trusted_networks_control = true;
                p.wifi_control.networks = vec![WifiNetwork {
                    ssid: "Airport Free WiFi".into(),
                    is_trusted: false,
                }];
            })
            .unwrap();

        h.handle
            .wifi_changed(WifiInfo {
                ssid: "Airport Free WiFi".into(),
                is_insecure: true,
            })
            .await;
        h.until_connected().await;

        let fw = h.firewall.state().await;
        assert!(fw.enabled);
        assert!(!fw.allow_lan);
        // Enabled by the policy, so it outlives the connection.
        h.handle.disconnect().await.unwrap();
        assert!(h.firewall.is_enabled().await);
    }
}
