//! WireGuard for Windows tunnel service.
//!
//! `wireguard.exe /installtunnelservice <conf>` registers and starts a service
//! named `WireGuardTunnel$<name>`. The service addresses the adapter, sets
//! DNS and installs its own routes from the `[Interface]` section, so the
//! daemon only has to wait for it to reach RUNNING.

use super::{ConfigFlavor, ConfigWriter, WgEngine, WgParams};
use crate::error::{VpnError, VpnResult};
use crate::route::RouteEntry;
use async_trait::async_trait;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vpnd_common::config::{BinaryPaths, WG_INTERFACE_NAME};
use vpnd_common::{CommandRunner, ShellCommand};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const RUNNING_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const QUERY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    Other,
}

/// Extract the service state from `sc query` output:
///
/// ```text
///         STATE              : 4  RUNNING
/// ```
pub fn parse_service_state(text: &str) -> Option<ServiceState> {
    let line = text.lines().find(|l| l.trim_start().starts_with("STATE"))?;
    let value = line.split(':').nth(1)?;
    let code: u32 = value.split_whitespace().next()?.parse().ok()?;
    Some(match code {
        1 => ServiceState::Stopped,
        2 => ServiceState::StartPending,
        3 => ServiceState::StopPending,
        4 => ServiceState::Running,
        _ => ServiceState::Other,
    })
}

pub struct ServiceEngine {
    runner: Arc<dyn CommandRunner>,
    wireguard: PathBuf,
    sc: PathBuf,
    tunnel: String,
}

impl ServiceEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, binaries: &BinaryPaths) -> Self {
        Self {
            runner,
            wireguard: binaries.wireguard_windows.clone(),
            sc: binaries.sc.clone(),
            tunnel: WG_INTERFACE_NAME.to_string(),
        }
    }

    fn service_name(&self) -> String {
        format!("WireGuardTunnel${}", self.tunnel)
    }

    async fn query(&self) -> VpnResult<Option<ServiceState>> {
        let cmd = ShellCommand::tool(&self.sc).args(["query".to_string(), self.service_name()]);
        let out = self.runner.output(&cmd).await?;
        if !out.success() {
            // 1060: the service does not exist.
            return Ok(None);
        }
        Ok(parse_service_state(&out.stdout))
    }

    async fn wait_running(&self) -> VpnResult<()> {
        let deadline = tokio::time::Instant::now() + RUNNING_TIMEOUT;
        loop {
            match self.query().await? {
                Some(ServiceState::Running) => return Ok(()),
                Some(ServiceState::Stopped) | None => {
                    return Err(VpnError::internal("WireGuard tunnel service stopped while starting"))
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(VpnError::internal("timeout waiting for WireGuard tunnel service"));
            }
            tokio::time::sleep(QUERY_INTERVAL).await;
        }
    }

    async fn uninstall(&self) -> VpnResult<()> {
        let cmd = ShellCommand::tool(&self.wireguard)
            .args(["/uninstalltunnelservice", self.tunnel.as_str()])
            .timeout(INSTALL_TIMEOUT);
        self.runner.exec(&cmd).await?;
        Ok(())
    }
}

#[async_trait]
impl WgEngine for ServiceEngine {
    fn name(&self) -> &'static str {
        "tunnel service"
    }

    async fn cleanup(&self) -> VpnResult<()> {
        if self.query().await?.is_some() {
            log::info!("Removing stale service {}", self.service_name());
            self.uninstall().await?;
        }
        Ok(())
    }

    async fn start(&self, _params: &WgParams, config: &ConfigWriter) -> VpnResult<(String, u16)> {
        let port = config.write()?;
        let cmd = ShellCommand::tool(&self.wireguard)
            .arg("/installtunnelservice")
            .arg(config.path().to_string_lossy())
            .timeout(INSTALL_TIMEOUT);
        self.runner.exec(&cmd).await?;

        if let Err(e) = self.wait_running().await {
            self.stop().await;
            return Err(e);
        }
        Ok((self.tunnel.clone(), port))
    }

    async fn stop(&self) {
        if let Err(e) = self.uninstall().await {
            log::warn!("Failed to uninstall {}: {}", self.service_name(), e);
        }
    }

    async fn check_alive(&self) -> VpnResult<bool> {
        Ok(matches!(self.query().await?, Some(ServiceState::Running)))
    }

    fn tunnel_routes(&self, _interface: &str, _params: &WgParams) -> Vec<RouteEntry> {
        Vec::new()
    }

    fn config_flavor(&self, params: &WgParams) -> ConfigFlavor {
        ConfigFlavor::Service {
            dns: Some(IpAddr::V4(params.host_local_ip)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_session, wg_request};
    use vpnd_common::shell::ScriptedRunner;
    use vpnd_common::CommandOutput;

    const RUNNING: &str = "SERVICE_NAME: WireGuardTunnel$wgivpn\n        TYPE               : 10  WIN32_OWN_PROCESS\n        STATE              : 4  RUNNING\n";
    const PENDING: &str = "        STATE              : 2  START_PENDING\n";

    fn engine(runner: &ScriptedRunner) -> ServiceEngine {
        let binaries = BinaryPaths {
            wireguard_windows: "wireguard.exe".into(),
            sc: "sc.exe".into(),
            ..BinaryPaths::default()
        };
        ServiceEngine::new(runner.shared(), &binaries)
    }

    #[test]
    fn test_parse_service_state() {
        assert_eq!(parse_service_state(RUNNING), Some(ServiceState::Running));
        assert_eq!(parse_service_state(PENDING), Some(ServiceState::StartPending));
        assert_eq!(parse_service_state("garbage"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_waits_for_running() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        runner.on_sequence(
            "sc.exe",
            &["query"],
            vec![CommandOutput::ok(PENDING), CommandOutput::ok(PENDING), CommandOutput::ok(RUNNING)],
        );
        let engine = engine(&runner);
        let params = WgParams::from_request(&wg_request(), &test_session()).unwrap();
        let config = ConfigWriter::new(params.clone(), &dir.path().join("wgivpn.conf"), engine.config_flavor(&params));

        let (iface, _) = engine.start(&params, &config).await.unwrap();
        assert_eq!(iface, "wgivpn");
        let text = std::fs::read_to_string(dir.path().join("wgivpn.conf")).unwrap();
        assert!(text.contains("DNS = 172.21.0.1"));
        let queries = runner.lines().iter().filter(|l| l.starts_with("sc.exe query")).count();
        assert_eq!(queries, 3);
        assert!(engine.tunnel_routes(&iface, &params).is_empty());
    }

    #[tokio::test]
    async fn test_service_stopping_during_start_uninstalls() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        runner.on("sc.exe", &["query"], CommandOutput::failed(1060, "The specified service does not exist"));
        let engine = engine(&runner);
        let params = WgParams::from_request(&wg_request(), &test_session()).unwrap();
        let config = ConfigWriter::new(params.clone(), &dir.path().join("wgivpn.conf"), engine.config_flavor(&params));

        assert!(engine.start(&params, &config).await.is_err());
        assert_eq!(runner.lines().last().unwrap(), "wireguard.exe /uninstalltunnelservice wgivpn");
    }
}
