//! Kernel WireGuard driven through iproute2 and `wg`.

use super::{set_config_with_retry, ConfigWriter, WgEngine, WgParams};
use crate::error::{VpnError, VpnResult};
use crate::route::{split_default_routes, RouteEntry};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use vpnd_common::config::{BinaryPaths, WG_INTERFACE_NAME};
use vpnd_common::net::Family;
use vpnd_common::{CommandRunner, ShellCommand};

pub struct LinuxEngine {
    runner: Arc<dyn CommandRunner>,
    ip: PathBuf,
    wg: PathBuf,
    interface: String,
}

impl LinuxEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, binaries: &BinaryPaths) -> Self {
        Self {
            runner,
            ip: binaries.ip.clone(),
            wg: binaries.wg.clone(),
            interface: WG_INTERFACE_NAME.to_string(),
        }
    }

    async fn ip<I, S>(&self, args: I) -> VpnResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.runner.exec(&ShellCommand::tool(&self.ip).args(args)).await?;
        Ok(())
    }

    async fn delete_link(&self) -> VpnResult<()> {
        self.ip(["link", "delete", "dev", self.interface.as_str()]).await
    }

    async fn configure(&self, params: &WgParams, config: &ConfigWriter) -> VpnResult<u16> {
        let iface = self.interface.as_str();
        self.ip(["link", "add", "dev", iface, "type", "wireguard"]).await?;
        let port = set_config_with_retry(self.runner.as_ref(), &self.wg, iface, config).await?;

        let v4 = format!("{}/32", params.client_ip);
        self.ip(["address", "add", v4.as_str(), "dev", iface]).await?;
        if let Some(v6) = params.client_ip6() {
            let v6 = format!("{}/64", v6);
            self.ip(["-6", "address", "add", v6.as_str(), "dev", iface]).await?;
        }

        let mut link = vec!["link".to_string(), "set".into()];
        if params.mtu > 0 {
            link.extend(["mtu".into(), params.mtu.to_string()]);
        }
        link.extend(["up".into(), "dev".into(), iface.to_string()]);
        self.ip(link).await?;
        Ok(port)
    }
}

#[async_trait]
impl WgEngine for LinuxEngine {
    fn name(&self) -> &'static str {
        "kernel"
    }

    async fn cleanup(&self) -> VpnResult<()> {
        if self.check_alive().await? {
            log::info!("Removing stale interface {}", self.interface);
            self.delete_link().await?;
        }
        Ok(())
    }

    async fn start(&self, params: &WgParams, config: &ConfigWriter) -> VpnResult<(String, u16)> {
        match self.configure(params, config).await {
            Ok(port) => Ok((self.interface.clone(), port)),
            Err(e) => {
                // The link may exist half-configured.
                if let Err(del) = self.delete_link().await {
                    log::debug!("Removing {} after failure: {}", self.interface, del);
                }
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        if let Err(e) = self.delete_link().await {
            log::warn!("Failed to remove interface {}: {}", self.interface, e);
        }
    }

    async fn check_alive(&self) -> VpnResult<bool> {
        let cmd = ShellCommand::tool(&self.ip).args(["link", "show", "dev", self.interface.as_str()]);
        let output = self.runner.output(&cmd).await.map_err(VpnError::from)?;
        Ok(output.success())
    }

    fn tunnel_routes(&self, interface: &str, params: &WgParams) -> Vec<RouteEntry> {
        let mut routes = split_default_routes(interface, Family::V4);
        if params.client_ip6().is_some() {
            routes.extend(split_default_routes(interface, Family::V6));
        }
        routes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::wireguard::ConfigFlavor;
    use crate::testing::{test_session, wg_request};
    use vpnd_common::shell::ScriptedRunner;
    use vpnd_common::CommandOutput;

    fn engine(runner: &ScriptedRunner) -> LinuxEngine {
        let binaries = BinaryPaths {
            ip: "ip".into(),
            wg: "wg".into(),
            ..BinaryPaths::default()
        };
        LinuxEngine::new(runner.shared(), &binaries)
    }

    #[tokio::test]
    async fn test_bring_up_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let mut params = WgParams::from_request(&wg_request(), &test_session()).unwrap();
        params.mtu = 1380;
        params.ipv6_prefix = Some("fd00:4956:504e:ffff::".into());
        let config = ConfigWriter::new(params.clone(), &dir.path().join("wgivpn.conf"), ConfigFlavor::Plain);

        let (iface, port) = engine(&runner).start(&params, &config).await.unwrap();
        assert_eq!(iface, "wgivpn");
        assert!(port > 0);

        let conf = dir.path().join("wgivpn.conf").to_string_lossy().into_owned();
        assert_eq!(
            runner.lines(),
            vec![
                "ip link add dev wgivpn type wireguard".to_string(),
                format!("wg setconf wgivpn {}", conf),
                "ip address add 172.21.0.5/32 dev wgivpn".into(),
                "ip -6 address add fd00:4956:504e:ffff::ac15:5/64 dev wgivpn".into(),
                "ip link set mtu 1380 up dev wgivpn".into(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_start_removes_link() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        runner.on("ip", &["address", "add"], CommandOutput::failed(2, "RTNETLINK answers: Permission denied"));
        let params = WgParams::from_request(&wg_request(), &test_session()).unwrap();
        let config = ConfigWriter::new(params.clone(), &dir.path().join("wg.conf"), ConfigFlavor::Plain);

        assert!(engine(&runner).start(&params, &config).await.is_err());
        assert_eq!(runner.lines().last().unwrap(), "ip link delete dev wgivpn");
    }

    #[tokio::test]
    async fn test_cleanup_only_when_present() {
        let runner = ScriptedRunner::new();
        runner.on("ip", &["link", "show"], CommandOutput::failed(1, "Device \"wgivpn\" does not exist."));
        engine(&runner).cleanup().await.unwrap();
        assert!(!runner.lines().iter().any(|l| l.contains("delete")));

        runner.on("ip", &["link", "show"], CommandOutput::ok("5: wgivpn: <POINTOPOINT,NOARP,UP>"));
        engine(&runner).cleanup().await.unwrap();
        assert!(runner.lines().iter().any(|l| l == "ip link delete dev wgivpn"));
    }

    #[test]
    fn test_ipv6_routes_only_with_prefix() {
        let runner = ScriptedRunner::new();
        let mut params = WgParams::from_request(&wg_request(), &test_session()).unwrap();
        assert_eq!(engine(&runner).tunnel_routes("wgivpn", &params).len(), 2);
        params.ipv6_prefix = Some("fd00::".into());
        assert_eq!(engine(&runner).tunnel_routes("wgivpn", &params).len(), 4);
    }
}
