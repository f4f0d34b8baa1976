//! Userspace WireGuard (`wireguard-go`) on a utun device.

use super::{set_config_with_retry, ConfigWriter, WgEngine, WgParams};
use crate::error::{VpnError, VpnResult};
use crate::route::{split_default_nets, RouteEntry};
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use vpnd_common::config::BinaryPaths;
use vpnd_common::net::Family;
use vpnd_common::shell::{ProcessHandle, DEFAULT_KILL_GRACE};
use vpnd_common::{CommandRunner, ShellCommand};

/// `wireguard-go` prints this once the device accepts configuration.
const STARTED_MARKER: &str = "UAPI listener started";

const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Lowest `utunN` not present in `ifconfig -l` output.
pub fn next_utun_name(interface_list: &str) -> String {
    let taken: Vec<u32> = interface_list
        .split_whitespace()
        .filter_map(|name| name.strip_prefix("utun"))
        .filter_map(|n| n.parse().ok())
        .collect();
    let free = (0u32..).find(|n| !taken.contains(n)).unwrap_or_default();
    format!("utun{}", free)
}

struct Running {
    interface: String,
    process: ProcessHandle,
}

pub struct UserspaceEngine {
    runner: Arc<dyn CommandRunner>,
    wireguard_go: PathBuf,
    wg: PathBuf,
    ipconfig: PathBuf,
    ifconfig: PathBuf,
    running: Mutex<Option<Running>>,
}

impl UserspaceEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, binaries: &BinaryPaths) -> Self {
        Self {
            runner,
            wireguard_go: binaries.wireguard_go.clone(),
            wg: binaries.wg.clone(),
            ipconfig: binaries.ipconfig.clone(),
            ifconfig: binaries.ifconfig.clone(),
            running: Mutex::new(None),
        }
    }

    async fn pick_interface(&self) -> VpnResult<String> {
        let out = self
            .runner
            .exec(&ShellCommand::tool(&self.ifconfig).arg("-l"))
            .await?;
        Ok(next_utun_name(&out.stdout))
    }

    async fn launch(&self, interface: &str) -> VpnResult<ProcessHandle> {
        let cmd = ShellCommand::tool(&self.wireguard_go)
            .args(["-f", interface])
            .env("LOG_LEVEL", "verbose");
        let mut process = self.runner.spawn(&cmd).await?;

        let mut lines = process.take_lines();
        let (started_tx, started_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut started_tx = Some(started_tx);
            while let Some(line) = lines.recv().await {
                log::debug!("[wg] {}", line.text());
                if line.text().contains(STARTED_MARKER) {
                    if let Some(tx) = started_tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
        });

        match tokio::time::timeout(START_TIMEOUT, started_rx).await {
            Ok(Ok(())) => Ok(process),
            _ => {
                let _ = process.kill(DEFAULT_KILL_GRACE).await;
                Err(VpnError::internal("timeout waiting for WireGuard to start"))
            }
        }
    }

    async fn configure(&self, interface: &str, params: &WgParams, config: &ConfigWriter) -> VpnResult<u16> {
        let local = params.client_ip.to_string();
        self.runner
            .exec(&ShellCommand::tool(&self.ipconfig).args(["set", interface, "MANUAL", local.as_str(), "255.0.0.0"]))
            .await?;
        if let Some(v6) = params.client_ip6() {
            let v6 = v6.to_string();
            self.runner
                .exec(&ShellCommand::tool(&self.ipconfig).args(["set", interface, "MANUAL-V6", v6.as_str(), "64"]))
                .await?;
        }

        let port = set_config_with_retry(self.runner.as_ref(), &self.wg, interface, config).await?;

        if params.mtu > 0 {
            let mtu = params.mtu.to_string();
            self.runner
                .exec(&ShellCommand::tool(&self.ifconfig).args([interface, "mtu", mtu.as_str()]))
                .await?;
        }
        Ok(port)
    }
}

#[async_trait]
impl WgEngine for UserspaceEngine {
    fn name(&self) -> &'static str {
        "wireguard-go"
    }

    async fn cleanup(&self) -> VpnResult<()> {
        // utun devices disappear together with their process.
        Ok(())
    }

    async fn start(&self, params: &WgParams, config: &ConfigWriter) -> VpnResult<(String, u16)> {
        let interface = self.pick_interface().await?;
        let mut process = self.launch(&interface).await?;
        match self.configure(&interface, params, config).await {
            Ok(port) => {
                *self.running.lock().await = Some(Running {
                    interface: interface.clone(),
                    process,
                });
                Ok((interface, port))
            }
            Err(e) => {
                let _ = process.kill(DEFAULT_KILL_GRACE).await;
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        if let Some(mut running) = self.running.lock().await.take() {
            if let Err(e) = running.process.kill(DEFAULT_KILL_GRACE).await {
                log::warn!("Failed to stop wireguard-go on {}: {}", running.interface, e);
            }
        }
    }

    async fn check_alive(&self) -> VpnResult<bool> {
        let mut running = self.running.lock().await;
        match running.as_mut() {
            None => Ok(false),
            Some(r) => match r.process.try_wait() {
                None => Ok(true),
                Some(code) => {
                    log::error!("wireguard-go on {} exited unexpectedly ({:?})", r.interface, code);
                    Err(VpnError::reconnection_required())
                }
            },
        }
    }

    fn tunnel_routes(&self, _interface: &str, params: &WgParams) -> Vec<RouteEntry> {
        let mut routes: Vec<RouteEntry> = split_default_nets(Family::V4)
            .into_iter()
            .map(|net| RouteEntry::via_gateway(net, IpAddr::V4(params.host_local_ip)))
            .collect();
        if let Some(gw6) = params.host_local_ip6() {
            routes.extend(
                split_default_nets(Family::V6)
                    .into_iter()
                    .map(|net| RouteEntry::via_gateway(net, IpAddr::V6(gw6))),
            );
        }
        routes
    }
}
