//! vpnd
//!
//! Privileged VPN daemon: owns the tunnel, kill-switch, DNS and split-tunnel
//! state of the host and serves frontends over a loopback socket.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use vpnd_common::config::{load_daemon_config, DaemonConfig};
use vpnd_common::{CommandRunner, ProcessRunner};
use vpnd_core::backend::wireguard;
use vpnd_core::backend::BackendContext;
use vpnd_core::dns::journal::DnsJournal;
use vpnd_core::dns::proxy::{DnscryptProxy, EncryptedDnsProxy};
use vpnd_core::dns::{self, DnsController};
use vpnd_core::eaa::Eaa;
use vpnd_core::firewall::{self, Firewall};
use vpnd_core::ipc::{IpcServer, KeyService, Services};
use vpnd_core::netchange::{self, NetChangeDetector};
use vpnd_core::ping::Pinger;
use vpnd_core::preferences::PreferencesStore;
use vpnd_core::route::{RoutingTable, SystemRoutingTable};
use vpnd_core::servers::ServersStore;
use vpnd_core::splittun::{self, ConfigAddresses, SplitTunnel};
use vpnd_core::wifi::{CommandWifiSource, WifiMonitor, WifiSource};
use vpnd_core::{manager, DaemonLock, ErrorKind, ManagerDeps};

#[derive(Parser)]
#[command(name = "vpnd")]
#[command(version)]
#[command(about = "Privileged VPN daemon")]
struct Args {
    /// Path to the daemon config file (default: /etc/vpnd/vpnd.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, overridden by RUST_LOG (e.g. debug, vpnd_core=trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground
    Run,
    /// Undo what a crashed daemon left behind
    ///
    /// Restores the resolvers from the DNS journal, removes the tunnel
    /// interface, lifts a non-persistent kill-switch and resets split-tunnel
    /// routing. Refuses to run while the daemon is alive.
    Cleanup,
    /// Show whether the daemon is running and what it persisted
    Status,
    /// Remove every kill-switch rule, including an always-on one
    FirewallOff,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_daemon_config(args.config.as_deref())?;
    let level = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match args.command {
        Command::Run => run_daemon(config).await,
        Command::Cleanup => cleanup(config).await,
        Command::Status => status(config),
        Command::FirewallOff => firewall_off(config).await,
    }
}

/// Platform components shared by `run` and `cleanup`.
struct Platform {
    ctx: BackendContext,
    firewall: Arc<Firewall>,
    dns: Arc<DnsController>,
    split: Arc<SplitTunnel>,
    netchange: Arc<NetChangeDetector>,
}

impl Platform {
    async fn build(config: &DaemonConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let paths = config.paths();
        let routes: Arc<dyn RoutingTable> =
            Arc::new(SystemRoutingTable::new(runner.clone(), config.binaries.clone()));

        let fw_backend = firewall::platform_backend(runner.clone(), &config.binaries)
            .context("No usable packet filter")?;
        log::info!("Firewall backend: {}", fw_backend.name());
        let firewall = Arc::new(Firewall::new(fw_backend, firewall::system_lan_source()));

        let dns_backend = dns::backend::platform_backend(runner.clone(), &config.binaries).await;
        let proxy: Arc<dyn EncryptedDnsProxy> = Arc::new(DnscryptProxy::new(
            runner.clone(),
            &config.binaries.dnscrypt_proxy,
            &paths.dnscrypt_config(),
        ));
        let dns = Arc::new(DnsController::new(
            dns_backend,
            proxy,
            DnsJournal::new(&paths.dns_journal()),
            routes.clone(),
        ));

        let split_backend = splittun::platform_backend(runner.clone(), &config.binaries, routes.clone());
        let split = Arc::new(SplitTunnel::new(
            split_backend,
            splittun::system_public_address_source(),
        ));

        let netchange = Arc::new(NetChangeDetector::new(
            netchange::platform_source_factory(),
            netchange::system_route_probe(),
        ));

        let ctx = BackendContext {
            runner,
            binaries: config.binaries.clone(),
            openvpn_files: config.openvpn.clone(),
            paths,
            routes,
        };

        Ok(Self {
            ctx,
            firewall,
            dns,
            split,
            netchange,
        })
    }
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    let paths = config.paths();
    let _lock = DaemonLock::acquire(&paths.lock_file()).context("Failed to acquire daemon lock")?;
    log::info!("vpnd {} starting (state: {})", env!("CARGO_PKG_VERSION"), paths.dir.display());

    let runner = ProcessRunner::shared();
    let platform = Platform::build(&config, runner.clone()).await?;

    if platform
        .dns
        .recover()
        .await
        .context("Failed to restore resolvers from the DNS journal")?
    {
        log::info!("Resolvers restored from a previous run");
    }

    let prefs = Arc::new(PreferencesStore::load(&paths).context("Failed to load preferences")?);
    let stored = prefs.get();

    platform
        .firewall
        .init(stored.firewall_state())
        .await
        .context("Failed to initialise the kill-switch")?;

    let cancel = CancellationToken::new();
    tokio::spawn(platform.firewall.clone().reassert_persistent(cancel.clone()));

    match platform.split.availability() {
        Ok(()) => {
            if let Err(e) = platform
                .split
                .apply_config(
                    stored.is_split_tunnel,
                    stored.split_tunnel_inversed,
                    stored.split_tunnel_allow_when_no_vpn,
                    false,
                    ConfigAddresses::default(),
                    stored.split_tunnel_apps.clone(),
                )
                .await
            {
                log::warn!("Failed to restore split-tunnel settings: {}", e);
            }
            tokio::spawn(
                platform
                    .split
                    .clone()
                    .watch_routing(platform.netchange.subscribe(), cancel.clone()),
            );
        }
        Err(e) => log::info!("Split tunnel disabled: {}", e),
    }

    let deps = ManagerDeps::new(
        platform.ctx.clone(),
        platform.firewall.clone(),
        platform.dns.clone(),
        platform.split.clone(),
        platform.netchange.clone(),
        prefs.clone(),
    );
    let (manager, manager_task) = manager::spawn(deps);

    let wifi_source: Arc<dyn WifiSource> =
        Arc::new(CommandWifiSource::platform(runner.clone(), &config.binaries));
    let (wifi_tx, mut wifi_rx) = mpsc::unbounded_channel();
    WifiMonitor::new(wifi_source.clone()).spawn(wifi_tx, cancel.clone());
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            while let Some(info) = wifi_rx.recv().await {
                manager.wifi_changed(info).await;
            }
        });
    }

    if stored.is_autoconnect_on_launch_daemon {
        match prefs.load_last_connection() {
            Ok(Some(req)) => {
                let manager = manager.clone();
                tokio::spawn(async move {
                    log::info!("Autoconnecting to the last server");
                    if let Err(e) = manager.connect(req).await {
                        log::warn!("Autoconnect failed: {}", e);
                    }
                });
            }
            Ok(None) => log::debug!("Autoconnect enabled but no previous connection"),
            Err(e) => log::warn!("Unable to read the last connection: {}", e),
        }
    }

    let services = Services {
        manager: manager.clone(),
        firewall: platform.firewall.clone(),
        split: platform.split.clone(),
        prefs: prefs.clone(),
        servers: Arc::new(ServersStore::new(paths.servers_cache(), None)),
        eaa: Arc::new(Eaa::load(&paths.eaa_secret())),
        pinger: Arc::new(Pinger::new(runner.clone(), config.binaries.ping.clone())),
        wifi: Arc::new(WifiMonitor::new(wifi_source)),
        keys: KeyService {
            runner,
            wg: config.binaries.wg.clone(),
            registrar: None,
        },
    };
    let listener = IpcServer::bind(config.ipc_port)
        .await
        .with_context(|| format!("Failed to bind IPC port {}", config.ipc_port))?;
    let server = Arc::new(IpcServer::new(services, paths.connection_info()));
    let mut ipc = tokio::spawn(server.run(listener, cancel.clone()));

    tokio::select! {
        result = shutdown_signal() => {
            result?;
            log::info!("Shutdown requested");
        }
        result = &mut ipc => {
            match result {
                Ok(Ok(())) => log::warn!("IPC server stopped"),
                Ok(Err(e)) => log::error!("IPC server failed: {}", e),
                Err(e) => log::error!("IPC server task panicked: {}", e),
            }
        }
    }

    cancel.cancel();
    manager.shutdown().await;
    let _ = manager_task.await;
    if !ipc.is_finished() {
        let _ = ipc.await;
    }

    let fw = platform.firewall.state().await;
    if fw.enabled && !fw.persistent {
        if let Err(e) = platform.firewall.set_enabled(false).await {
            log::warn!("Failed to remove kill-switch on exit: {}", e);
        }
    }
    log::info!("vpnd stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    Ok(())
}

/// Hold the daemon lock, or explain why not.
fn lock_or_running(config: &DaemonConfig) -> Result<Option<DaemonLock>> {
    match DaemonLock::acquire(&config.paths().lock_file()) {
        Ok(lock) => Ok(Some(lock)),
        Err(e) if e.kind() == ErrorKind::Conflict => Ok(None),
        Err(e) => Err(e).context("Failed to open the daemon lock"),
    }
}

async fn cleanup(config: DaemonConfig) -> Result<()> {
    let Some(_lock) = lock_or_running(&config)? else {
        anyhow::bail!("vpnd is running; stop it before cleaning up");
    };
    let paths = config.paths();
    let runner = ProcessRunner::shared();
    let platform = Platform::build(&config, runner).await?;
    let mut failures = 0;

    match platform.dns.recover().await {
        Ok(true) => println!("Restored resolvers from the DNS journal"),
        Ok(false) => println!("No DNS journal found"),
        Err(e) => {
            failures += 1;
            eprintln!("Failed to restore resolvers: {}", e);
        }
    }

    match wireguard::platform_engine(&platform.ctx) {
        Ok(engine) => match engine.cleanup().await {
            Ok(()) => println!("Tunnel interface removed"),
            Err(e) => {
                failures += 1;
                eprintln!("Failed to remove the tunnel interface: {}", e);
            }
        },
        Err(e) => log::debug!("No WireGuard engine on this platform: {}", e),
    }

    let prefs = PreferencesStore::load(&paths).context("Failed to load preferences")?;
    // A persistent kill-switch is re-installed, anything else removed.
    match platform.firewall.init(prefs.get().firewall_state()).await {
        Ok(()) if platform.firewall.state().await.persistent => println!("Always-on kill-switch kept"),
        Ok(()) => println!("Kill-switch rules removed"),
        Err(e) => {
            failures += 1;
            eprintln!("Failed to reset the kill-switch: {}", e);
        }
    }

    if platform.split.availability().is_ok() {
        match platform.split.reset().await {
            Ok(()) => println!("Split-tunnel routing stopped"),
            Err(e) => {
                failures += 1;
                eprintln!("Failed to stop split-tunnel routing: {}", e);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} cleanup step(s) failed", failures);
    }
    Ok(())
}

fn status(config: DaemonConfig) -> Result<()> {
    let paths = config.paths();
    let running = lock_or_running(&config)?.is_none();
    println!("Daemon:        {}", if running { "running" } else { "stopped" });

    if running {
        match std::fs::read_to_string(paths.connection_info()) {
            Ok(info) => {
                let port = info.split(':').next().unwrap_or_default().trim();
                println!("IPC:           127.0.0.1:{}", port);
            }
            Err(e) => println!("IPC:           unknown ({})", e),
        }
    }

    let prefs = PreferencesStore::load(&paths).context("Failed to load preferences")?;
    let stored = prefs.get();
    println!(
        "Kill-switch:   {}",
        if stored.is_fw_persistant { "always on" } else { "on demand" }
    );
    println!(
        "Split tunnel:  {}",
        match (stored.is_split_tunnel, stored.split_tunnel_inversed) {
            (false, _) => "off",
            (true, false) => "on",
            (true, true) => "inverse",
        }
    );
    println!(
        "Logged in:     {}",
        if prefs.session().is_logged_in() { "yes" } else { "no" }
    );
    match prefs.load_last_connection() {
        Ok(Some(req)) => println!(
            "Last server:   {} {} ({:?})",
            req.entry.hostname, req.entry.ip, req.vpn_type
        ),
        Ok(None) => println!("Last server:   none"),
        Err(e) => println!("Last server:   unreadable ({})", e),
    }
    Ok(())
}

async fn firewall_off(config: DaemonConfig) -> Result<()> {
    let paths = config.paths();
    let runner = ProcessRunner::shared();
    let backend = firewall::platform_backend(runner, &config.binaries).context("No usable packet filter")?;

    backend
        .remove()
        .await
        .context("Failed to remove kill-switch rules")?;
    backend
        .set_single_dns_rule(None)
        .await
        .context("Failed to remove the DNS rule")?;

    // Otherwise the next start re-installs it.
    let prefs = PreferencesStore::load(&paths).context("Failed to load preferences")?;
    if prefs.get().is_fw_persistant {
        prefs
            .update(|p| p.is_fw_persistant = false)
            .context("Failed to clear the always-on preference")?;
        println!("Always-on kill-switch disabled");
    }
    println!("Kill-switch rules removed");
    if lock_or_running(&config)?.is_none() {
        println!("vpnd is running; restart it to resync its kill-switch state");
    }
    Ok(())
}
