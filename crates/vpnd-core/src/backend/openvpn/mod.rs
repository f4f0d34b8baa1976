//! OpenVPN tunnel backend.
//!
//! Runs the `openvpn` binary with a generated configuration and drives it
//! through the management interface (see [`mgmt`]).

pub mod config;
pub mod mgmt;

pub use config::OpenVpnParams;

use super::{wait_for_connectivity, BackendContext, StateSink, TunnelBackend};
use crate::error::{VpnError, VpnResult};
use crate::types::{ConnectionState, StateInfo, VpnType};
use async_trait::async_trait;
use mgmt::{Credentials, ManagementInterface, MgmtCommand, MgmtEvent, StateUpdate};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use vpnd_common::config::{remove_file_if_exists, OpenVpnFiles};
use vpnd_common::net::Family;
use vpnd_common::shell::{OutputLine, DEFAULT_KILL_GRACE};
use vpnd_common::{CommandRunner, ShellCommand};

/// Oldest supported OpenVPN release.
pub const MIN_VERSION: [u32; 2] = [2, 3];

/// Time OpenVPN gets to exit after `signal SIGTERM`.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Parse `OpenVPN 2.5.8 x86_64-pc-linux-gnu ...` into its version numbers.
pub fn parse_version(text: &str) -> Option<Vec<u32>> {
    let first = text.lines().next()?;
    let rest = first.strip_prefix("OpenVPN ")?;
    let version = rest.split_whitespace().next()?;
    version
        .split('.')
        .map(|n| n.parse().ok())
        .collect::<Option<Vec<u32>>>()
        .filter(|v| !v.is_empty())
}

pub struct OpenVpn {
    runner: Arc<dyn CommandRunner>,
    binary: PathBuf,
    files: OpenVpnFiles,
    config_path: PathBuf,
    proxy_auth_path: PathBuf,
    routes: Arc<dyn crate::route::RoutingTable>,
    params: OpenVpnParams,
    pushed_dns: Mutex<Option<IpAddr>>,
}

impl OpenVpn {
    pub fn new(ctx: &BackendContext, params: OpenVpnParams) -> Self {
        let config_path = ctx.paths.openvpn_config();
        let proxy_auth_path = config_path.with_extension("proxy-auth");
        Self {
            runner: ctx.runner.clone(),
            binary: ctx.binaries.openvpn.clone(),
            files: ctx.openvpn_files.clone(),
            config_path,
            proxy_auth_path,
            routes: ctx.routes.clone(),
            params,
            pushed_dns: Mutex::new(None),
        }
    }

    fn state_info(&self, update: &StateUpdate) -> StateInfo {
        let mut info = StateInfo::new(update.state, VpnType::OpenVpn).with_description(update.description.clone());
        info.is_tcp = self.params.transport.is_tcp();
        info.is_auth_error = update.is_auth_error;
        info.additional_info = update.additional_info.clone();
        if update.state == ConnectionState::Connected {
            info.client_ip = update.client_ip;
            // Behind a proxy OpenVPN only knows the proxy address.
            info.server_ip = Some(self.params.host_ip);
            info.server_port = self.params.host_port;
            info.exit_hostname = self.params.exit_hostname.clone();
        }
        info
    }

    fn prepare_config(&self, management: std::net::SocketAddr, gateway: IpAddr) -> VpnResult<()> {
        let mut proxy_auth_file = None;
        if let Some(proxy) = &self.params.proxy {
            if config::write_proxy_auth(proxy, &self.proxy_auth_path)? {
                proxy_auth_file = Some(self.proxy_auth_path.clone());
            }
        }
        let inputs = config::ConfigInputs {
            management,
            files: &self.files,
            proxy_auth_file,
            gateway: Some(gateway),
        };
        let lines = config::generate(&self.params, &inputs)?;
        config::write_config(&lines, &self.config_path)
    }

    async fn run(&self, sink: &StateSink, cancel: &CancellationToken) -> VpnResult<()> {
        let gateway = wait_for_connectivity(
            self.routes.as_ref(),
            Family::of(&self.params.destination_ip()),
            VpnType::OpenVpn,
            sink,
            cancel,
        )
        .await?;

        let mi = ManagementInterface::bind().await?;
        let secret = mi.secret().to_string();
        self.prepare_config(mi.local_addr()?, gateway)?;

        let cmd = ShellCommand::tool(&self.binary)
            .arg("--config")
            .arg(self.config_path.to_string_lossy());
        let mut process = self.runner.spawn(&cmd).await?;

        let (verified_tx, verified_rx) = oneshot::channel();
        let output = tokio::spawn(watch_output(process.take_lines(), secret, verified_tx));

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let credentials = Credentials {
            username: self.params.username.clone(),
            password: self.params.password.clone(),
        };
        let mut mgmt = tokio::spawn(mi.run(credentials, verified_rx, events_tx, commands_rx));

        let mut mgmt_open = true;
        let mut exited_reported = false;
        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(VpnError::Cancelled),
                code = process.wait() => {
                    match code {
                        Ok(code) => log::info!("OpenVPN process exited ({:?})", code),
                        Err(e) => log::error!("OpenVPN process wait failed: {}", e),
                    }
                    break Ok(());
                }
                joined = &mut mgmt, if mgmt_open => {
                    mgmt_open = false;
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            log::error!("Management interface failed: {}", e);
                            break Err(e);
                        }
                        Err(e) => break Err(VpnError::internal(format!("management task: {}", e))),
                    }
                }
                event = events.recv() => match event {
                    Some(MgmtEvent::PushedDns(dns)) => {
                        *self.pushed_dns.lock().unwrap_or_else(|e| e.into_inner()) = Some(dns);
                    }
                    Some(MgmtEvent::State(update)) => {
                        exited_reported |= update.state == ConnectionState::Exiting;
                        self.report(&update, sink);
                    }
                    None => {
                        // Channel closed with the management task; keep waiting for the process.
                        if !mgmt_open {
                            let code = process.wait().await;
                            log::info!("OpenVPN process exited ({:?})", code.ok().flatten());
                            break Ok(());
                        }
                    }
                },
            }
        };

        // Ask OpenVPN to go away politely, then insist.
        if process.try_wait().is_none() {
            let _ = commands.send(MgmtCommand::Terminate);
            if tokio::time::timeout(EXIT_GRACE, process.wait()).await.is_err() {
                if let Err(e) = process.kill(DEFAULT_KILL_GRACE).await {
                    log::warn!("Failed to kill OpenVPN: {}", e);
                }
            }
        }
        drop(commands);
        mgmt.abort();
        output.abort();

        if result.is_ok() && !exited_reported {
            sink.send(StateInfo::new(ConnectionState::Exiting, VpnType::OpenVpn).with_description("OpenVPN process exited"));
        }
        result
    }

    fn report(&self, update: &StateUpdate, sink: &StateSink) {
        let info = self.state_info(update);
        if update.state == ConnectionState::Connected {
            // Interface addressed and routes in place: report both steps.
            let mut initialised = info.clone();
            initialised.state = ConnectionState::Initialised;
            sink.send(initialised);
        }
        sink.send(info);
    }

    fn cleanup_files(&self) {
        for path in [&self.config_path, &self.proxy_auth_path] {
            if let Err(e) = remove_file_if_exists(path) {
                log::warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

async fn watch_output(mut lines: mpsc::Receiver<OutputLine>, secret: String, verified: oneshot::Sender<()>) {
    let mut verified = Some(verified);
    while let Some(line) = lines.recv().await {
        if verified.is_some() && line.text().contains(&secret) {
            if let Some(tx) = verified.take() {
                let _ = tx.send(());
            }
            continue;
        }
        log::debug!("[openvpn] {}", line.text());
    }
}

#[async_trait]
impl TunnelBackend for OpenVpn {
    fn vpn_type(&self) -> VpnType {
        VpnType::OpenVpn
    }

    fn destination_ip(&self) -> IpAddr {
        self.params.destination_ip()
    }

    fn default_dns(&self) -> Option<IpAddr> {
        *self.pushed_dns.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn init(&self) -> VpnResult<()> {
        let out = self
            .runner
            .output(&ShellCommand::tool(&self.binary).arg("--version"))
            .await?;
        match parse_version(&out.stdout) {
            Some(version) => {
                log::info!("OpenVPN version: {:?}", version);
                if version.iter().take(2).copied().lt(MIN_VERSION.iter().copied()) {
                    return Err(VpnError::not_available(format!(
                        "OpenVPN {:?} (minimum required {:?})",
                        version, MIN_VERSION
                    )));
                }
            }
            None => log::warn!("Unable to determine OpenVPN version"),
        }
        Ok(())
    }

    async fn connect(&self, sink: StateSink, cancel: CancellationToken) -> VpnResult<()> {
        sink.send(StateInfo::new(ConnectionState::Connecting, VpnType::OpenVpn));
        *self.pushed_dns.lock().unwrap_or_else(|e| e.into_inner()) = None;

        let result = self.run(&sink, &cancel).await;
        if let Err(e) = &result {
            if !matches!(e, VpnError::Cancelled) {
                log::error!("Connection error: {}", e);
            }
        }
        self.cleanup_files();
        *self.pushed_dns.lock().unwrap_or_else(|e| e.into_inner()) = None;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::MemoryRoutingTable;
    use crate::testing::{ovpn_request, test_session};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use vpnd_common::config::{BinaryPaths, StatePaths};
    use vpnd_common::shell::{ProcessHandle, ScriptedRunner};
    use vpnd_common::CommandOutput;

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("OpenVPN 2.5.8 x86_64-pc-linux-gnu [SSL (OpenSSL)]\nlibrary versions"),
            Some(vec![2, 5, 8])
        );
        assert_eq!(parse_version("garbage"), None);
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        runner: ScriptedRunner,
        ctx: BackendContext,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.crt");
        let ta = dir.path().join("ta.key");
        std::fs::write(&ca, "ca").unwrap();
        std::fs::write(&ta, "ta").unwrap();
        let routes = MemoryRoutingTable::new();
        routes.set_default_gateway("192.168.1.1".parse().unwrap());
        let runner = ScriptedRunner::new();
        let ctx = BackendContext {
            runner: runner.shared(),
            binaries: BinaryPaths::default(),
            openvpn_files: OpenVpnFiles {
                ca,
                ta,
                extra_parameters: String::new(),
            },
            paths: StatePaths::new(dir.path()),
            routes: Arc::new(routes),
        };
        Fixture { _dir: dir, runner, ctx }
    }

    fn management_port(config: &str) -> u16 {
        config
            .lines()
            .find_map(|l| l.strip_prefix("management 127.0.0.1 "))
            .and_then(|p| p.parse().ok())
            .unwrap()
    }

    #[tokio::test]
    async fn test_version_check() {
        let f = fixture();
        let binary = f.ctx.binaries.openvpn.to_string_lossy().into_owned();
        f.runner.on(&binary, &["--version"], CommandOutput::ok("OpenVPN 2.2.1 x86_64\n"));
        let params = OpenVpnParams::from_request(&ovpn_request(), &test_session()).unwrap();
        let ovpn = OpenVpn::new(&f.ctx, params);
        assert!(matches!(ovpn.init().await, Err(VpnError::NotAvailable { .. })));

        f.runner.on(&binary, &["--version"], CommandOutput::ok("OpenVPN 2.6.0 x86_64\n"));
        ovpn.init().await.unwrap();
    }

    #[tokio::test]
    async fn test_management_session() {
        let f = fixture();
        let (handle, mut script) = ProcessHandle::scripted("openvpn");
        f.runner.push_spawn(handle);
        let params = OpenVpnParams::from_request(&ovpn_request(), &test_session()).unwrap();
        let ovpn = Arc::new(OpenVpn::new(&f.ctx, params));
        let (sink, mut states) = StateSink::channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let ovpn = ovpn.clone();
            let cancel = cancel.clone();
            async move { ovpn.connect(sink, cancel).await }
        });

        assert_eq!(states.recv().await.unwrap().state, ConnectionState::Connecting);
        while f.runner.history().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let config = std::fs::read_to_string(f.ctx.paths.openvpn_config()).unwrap();
        let port = management_port(&config);

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let echo = lines.next_line().await.unwrap().unwrap();
        let secret = echo.strip_prefix("echo ").unwrap().to_string();
        script.stdout(&format!("MANAGEMENT: {}", secret)).await;

        write.write_all(b">HOLD:Waiting for hold release:0\r\n").await.unwrap();
        for expected in ["state on", "log on", "hold off", "hold release"] {
            assert_eq!(lines.next_line().await.unwrap().unwrap(), expected);
        }

        write
            .write_all(b">PASSWORD:Need 'Auth' username/password\r\n")
            .await
            .unwrap();
        let user = lines.next_line().await.unwrap().unwrap();
        assert_eq!(user, format!("username \"Auth\" {}", test_session().openvpn_user));
        let pass = lines.next_line().await.unwrap().unwrap();
        assert!(pass.starts_with("password \"Auth\" "));

        write
            .write_all(b">LOG:1700000000,,PUSH: Received control message: 'PUSH_REPLY,dhcp-option DNS 10.34.0.1,ifconfig 10.34.0.6 255.255.0.0'\r\n")
            .await
            .unwrap();
        write
            .write_all(b">STATE:1700000000,CONNECTED,SUCCESS,10.34.0.6,185.253.97.12,2049,,\r\n")
            .await
            .unwrap();

        let init = states.recv().await.unwrap();
        assert_eq!(init.state, ConnectionState::Initialised);
        let connected = states.recv().await.unwrap();
        assert_eq!(connected.state, ConnectionState::Connected);
        assert_eq!(connected.client_ip, Some("10.34.0.6".parse().unwrap()));
        assert_eq!(connected.server_port, 2049);
        assert_eq!(ovpn.default_dns(), Some("10.34.0.1".parse().unwrap()));

        cancel.cancel();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "signal SIGTERM");
        script.exit(0);
        assert!(matches!(task.await.unwrap(), Err(VpnError::Cancelled)));
        assert!(!f.ctx.paths.openvpn_config().exists());
        assert_eq!(ovpn.default_dns(), None);
    }

    #[tokio::test]
    async fn test_process_exit_reports_exiting() {
        let f = fixture();
        let (handle, mut script) = ProcessHandle::scripted("openvpn");
        f.runner.push_spawn(handle);
        script.exit(1);
        let params = OpenVpnParams::from_request(&ovpn_request(), &test_session()).unwrap();
        let ovpn = OpenVpn::new(&f.ctx, params);
        let (sink, mut states) = StateSink::channel();

        ovpn.connect(sink, CancellationToken::new()).await.unwrap();
        assert_eq!(states.recv().await.unwrap().state, ConnectionState::Connecting);
        let last = states.recv().await.unwrap();
        assert_eq!(last.state, ConnectionState::Exiting);
        assert!(!last.is_auth_error);
    }
}
