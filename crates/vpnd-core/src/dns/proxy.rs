//! Local forwarder for DoH/DoT resolvers.
//!
//! Encrypted resolvers cannot be configured as system DNS directly; a
//! `dnscrypt-proxy` child listens on `127.0.0.1:53` and forwards to the
//! configured server. The system resolver is then pointed at loopback.

use super::stamp::server_stamp;
use super::{DnsSettings, LOCAL_RESOLVER};
use crate::error::{VpnError, VpnResult};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use vpnd_common::config::{remove_file_if_exists, write_private_file};
use vpnd_common::shell::{ProcessHandle, DEFAULT_KILL_GRACE};
use vpnd_common::{CommandRunner, ShellCommand};

/// Time allowed for the forwarder to report it is listening.
const START_TIMEOUT: Duration = Duration::from_secs(10);

/// Marker logged by dnscrypt-proxy once its listeners are up.
const READY_MARKER: &str = "Now listening to";

const SERVER_NAME: &str = "vpnd-resolver";

#[async_trait]
pub trait EncryptedDnsProxy: Send + Sync {
    /// Start forwarding to `settings`; returns the local listen address.
    async fn start(&self, settings: &DnsSettings) -> VpnResult<IpAddr>;

    async fn stop(&self);

    async fn is_running(&self) -> bool;

    /// Executable the firewall must let through.
    fn binary(&self) -> Option<PathBuf>;
}

#[derive(Serialize)]
struct StaticServer {
    stamp: String,
}

/// The subset of dnscrypt-proxy.toml the daemon controls.
#[derive(Serialize)]
struct DnscryptConfig {
    listen_addresses: Vec<String>,
    server_names: Vec<String>,
    ipv4_servers: bool,
    ipv6_servers: bool,
    doh_servers: bool,
    require_dnssec: bool,
    require_nolog: bool,
    require_nofilter: bool,
    cache: bool,
    #[serde(rename = "static")]
    statics: BTreeMap<String, StaticServer>,
}

/// Render the forwarder configuration for `settings`.
pub fn render_config(settings: &DnsSettings) -> VpnResult<String> {
    let stamp = server_stamp(settings)?;
    let mut statics = BTreeMap::new();
    statics.insert(SERVER_NAME.to_string(), StaticServer { stamp });
    let cfg = DnscryptConfig {
        listen_addresses: vec![format!("{}:53", LOCAL_RESOLVER)],
        server_names: vec![SERVER_NAME.to_string()],
        ipv4_servers: true,
        ipv6_servers: true,
        doh_servers: true,
        require_dnssec: false,
        require_nolog: false,
        require_nofilter: false,
        cache: true,
        statics,
    };
    toml::to_string(&cfg).map_err(|e| VpnError::config_with_source("Failed to render dnscrypt-proxy config", e))
}

/// `dnscrypt-proxy` managed as a child process.
pub struct DnscryptProxy {
    runner: Arc<dyn CommandRunner>,
    binary: PathBuf,
    config_path: PathBuf,
    child: Mutex<Option<ProcessHandle>>,
}

impl DnscryptProxy {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: &Path, config_path: &Path) -> Self {
        Self {
            runner,
            binary: binary.to_path_buf(),
            config_path: config_path.to_path_buf(),
            child: Mutex::new(None),
        }
    }

    async fn wait_ready(handle: &mut ProcessHandle) -> VpnResult<()> {
        let scan = async {
            while let Some(line) = handle.next_line().await {
                log::debug!("[dnscrypt-proxy] {}", line.text());
                if line.text().contains(READY_MARKER) {
                    return Ok(());
                }
            }
            Err(VpnError::tool_failed("dnscrypt-proxy", None, "exited before listening"))
        };
        match tokio::time::timeout(START_TIMEOUT, scan).await {
            Ok(result) => result,
            Err(_) => Err(VpnError::tool_failed("dnscrypt-proxy", None, "start timed out")),
        }
    }
}

#[async_trait]
impl EncryptedDnsProxy for DnscryptProxy {
    async fn start(&self, settings: &DnsSettings) -> VpnResult<IpAddr> {
        self.stop().await;

        let config = render_config(settings)?;
        write_private_file(&self.config_path, config.as_bytes())?;

        let cmd = ShellCommand::tool(&self.binary)
            .arg("-config")
            .arg(self.config_path.to_string_lossy());
        let mut handle = self.runner.spawn(&cmd).await?;
        if let Err(e) = Self::wait_ready(&mut handle).await {
            let _ = handle.kill(DEFAULT_KILL_GRACE).await;
            return Err(e);
        }

        // Keep the pipes drained for the lifetime of the child.
        let mut lines = handle.take_lines();
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                log::debug!("[dnscrypt-proxy] {}", line.text());
            }
        });

        log::info!("Encrypted DNS forwarder started for {}", settings.info_string());
        *self.child.lock().await = Some(handle);
        Ok(LOCAL_RESOLVER)
    }

    async fn stop(&self) {
        if let Some(mut handle) = self.child.lock().await.take() {
            if let Err(e) = handle.kill(DEFAULT_KILL_GRACE).await {
                log::warn!("Failed to stop dnscrypt-proxy: {}", e);
            }
            log::info!("Encrypted DNS forwarder stopped");
        }
        if let Err(e) = remove_file_if_exists(&self.config_path) {
            log::debug!("Failed to remove {}: {}", self.config_path.display(), e);
        }
    }

    async fn is_running(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(handle) => handle.try_wait().is_none(),
            None => false,
        }
    }

    fn binary(&self) -> Option<PathBuf> {
        Some(self.binary.clone())
    }
}

/// Placeholder used where no forwarder binary is configured.
pub struct NoEncryptedDns;

#[async_trait]
impl EncryptedDnsProxy for NoEncryptedDns {
    async fn start(&self, _settings: &DnsSettings) -> VpnResult<IpAddr> {
        Err(VpnError::not_available("encrypted DNS"))
    }

    async fn stop(&self) {}

    async fn is_running(&self) -> bool {
        false
    }

    fn binary(&self) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::DnsEncryption;
    use vpnd_common::shell::ScriptedRunner;

    fn doh() -> DnsSettings {
        DnsSettings {
            host: Some("9.9.9.9".parse().unwrap()),
            encryption: DnsEncryption::DoH,
            template: "https://dns.quad9.net/dns-query".into(),
        }
    }

    #[test]
    fn test_render_config() {
        let text = render_config(&doh()).unwrap();
        let parsed: toml::Value = toml::from_str(&text).unwrap();
        assert_eq!(parsed["listen_addresses"][0].as_str(), Some("127.0.0.1:53"));
        assert_eq!(parsed["server_names"][0].as_str(), Some(SERVER_NAME));
        let stamp = parsed["static"][SERVER_NAME]["stamp"].as_str().unwrap();
        assert!(stamp.starts_with("sdns://"));
    }

    #[tokio::test]
    async fn test_start_waits_for_listener() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("dnscrypt-proxy.toml");
        let runner = ScriptedRunner::new();
        let (handle, script) = ProcessHandle::scripted("dnscrypt-proxy");
        runner.push_spawn(handle);

        script.stderr("[NOTICE] dnscrypt-proxy 2.1.5").await;
        script.stderr("[NOTICE] Now listening to 127.0.0.1:53 [UDP]").await;

        let proxy = DnscryptProxy::new(runner.shared(), Path::new("dnscrypt-proxy"), &cfg);
        assert_eq!(proxy.start(&doh()).await.unwrap(), LOCAL_RESOLVER);
        assert!(cfg.exists());
        assert!(proxy.is_running().await);
        assert!(runner.lines()[0].ends_with("dnscrypt-proxy.toml"));

        proxy.stop().await;
        assert!(!proxy.is_running().await);
        assert!(!cfg.exists());
    }

    #[tokio::test]
    async fn test_start_fails_when_child_exits() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let (handle, mut script) = ProcessHandle::scripted("dnscrypt-proxy");
        runner.push_spawn(handle);
        script.stderr("[FATAL] listen udp 127.0.0.1:53: bind: address already in use").await;
        script.exit(255);

        let proxy = DnscryptProxy::new(
            runner.shared(),
            Path::new("dnscrypt-proxy"),
            &dir.path().join("cfg.toml"),
        );
        let err = proxy.start(&doh()).await.unwrap_err();
        assert!(matches!(err, VpnError::ExternalToolFailed { .. }));
        assert!(!proxy.is_running().await);
    }
}
