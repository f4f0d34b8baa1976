//! Platform resolver configuration.

use super::journal::{JournalEntry, PriorDns};
use crate::error::{VpnError, VpnResult};
use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use vpnd_common::config::BinaryPaths;
use vpnd_common::net::interface_by_ip;
use vpnd_common::{CommandRunner, ShellCommand};

/// System resolver file rewritten when no resolver daemon is present.
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Maps the tunnel's local address to its interface name.
pub type InterfaceLookup = Arc<dyn Fn(IpAddr) -> io::Result<Option<String>> + Send + Sync>;

fn system_interface_lookup() -> InterfaceLookup {
    Arc::new(interface_by_ip)
}

fn resolve_interface(lookup: &InterfaceLookup, local_ip: IpAddr) -> VpnResult<String> {
    lookup.as_ref()(local_ip)?.ok_or_else(|| {
        VpnError::internal(format!("no interface carries local address {}", local_ip))
    })
}

/// A way of pointing the OS at a resolver and putting things back.
#[async_trait]
pub trait DnsBackend: Send + Sync {
    /// Identifies the backend in the journal.
    fn name(&self) -> &'static str;

    /// Record what `apply` is about to overwrite.
    async fn snapshot(&self, local_ip: IpAddr) -> VpnResult<Vec<JournalEntry>>;

    /// Make `dns` the only resolver. `local_ip` is the tunnel's address.
    async fn apply(&self, dns: IpAddr, local_ip: IpAddr) -> VpnResult<()>;

    /// Restore recorded state. Continues past individual failures.
    async fn restore(&self, entries: &[JournalEntry]) -> VpnResult<()>;
}

/// Pick the backend for this host.
pub async fn platform_backend(runner: Arc<dyn CommandRunner>, binaries: &BinaryPaths) -> Arc<dyn DnsBackend> {
    if cfg!(target_os = "linux") {
        let status = ShellCommand::tool(&binaries.resolvectl).arg("status");
        match runner.output(&status).await {
            Ok(out) if out.success() => {
                log::info!("DNS: using resolvectl");
                Arc::new(ResolvectlBackend::new(runner, binaries))
            }
            _ => {
                log::info!("DNS: resolvectl unavailable, using {}", RESOLV_CONF);
                Arc::new(ResolvConfBackend::new(Path::new(RESOLV_CONF)))
            }
        }
    } else if cfg!(target_os = "macos") {
        Arc::new(NetworksetupBackend::new(runner, binaries))
    } else {
        Arc::new(NetshBackend::new(runner, binaries))
    }
}

// ============================================================================
// systemd-resolved
// ============================================================================

/// Per-link configuration through `resolvectl`; the link is the tunnel.
pub struct ResolvectlBackend {
    runner: Arc<dyn CommandRunner>,
    binary: PathBuf,
    lookup: InterfaceLookup,
}

impl ResolvectlBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, binaries: &BinaryPaths) -> Self {
        Self {
            runner,
            binary: binaries.resolvectl.clone(),
            lookup: system_interface_lookup(),
        }
    }

    pub fn with_lookup(mut self, lookup: InterfaceLookup) -> Self {
        self.lookup = lookup;
        self
    }

    async fn run(&self, args: &[&str]) -> VpnResult<()> {
        self.runner
            .exec(&ShellCommand::tool(&self.binary).args(args.iter().copied()))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DnsBackend for ResolvectlBackend {
    fn name(&self) -> &'static str {
        "resolvectl"
    }

    async fn snapshot(&self, local_ip: IpAddr) -> VpnResult<Vec<JournalEntry>> {
        Ok(vec![JournalEntry {
            target: resolve_interface(&self.lookup, local_ip)?,
            prior: PriorDns::LinkRevert,
        }])
    }

    async fn apply(&self, dns: IpAddr, local_ip: IpAddr) -> VpnResult<()> {
        let iface = resolve_interface(&self.lookup, local_ip)?;
        let dns = dns.to_string();
        // Route every lookup domain to this link.
        self.run(&["domain", &iface, "~."]).await?;
        self.run(&["default-route", &iface, "true"]).await?;
        self.run(&["dns", &iface, &dns]).await
    }

    async fn restore(&self, entries: &[JournalEntry]) -> VpnResult<()> {
        for entry in entries {
            // The link may already be gone together with the tunnel.
            if let Err(e) = self.run(&["revert", &entry.target]).await {
                log::debug!("resolvectl revert {}: {}", entry.target, e);
            }
        }
        Ok(())
    }
}

// ============================================================================
// resolv.conf
// ============================================================================

/// Rewrites a resolver file wholesale.
pub struct ResolvConfBackend {
    path: PathBuf,
}

impl ResolvConfBackend {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn render(dns: IpAddr) -> String {
        format!("# Generated by vpnd. Do not edit.\nnameserver {}\n", dns)
    }
}

#[async_trait]
impl DnsBackend for ResolvConfBackend {
    fn name(&self) -> &'static str {
        "resolvconf"
    }

    async fn snapshot(&self, _local_ip: IpAddr) -> VpnResult<Vec<JournalEntry>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(vec![JournalEntry {
            target: self.path.display().to_string(),
            prior: PriorDns::File { contents },
        }])
    }

    async fn apply(&self, dns: IpAddr, _local_ip: IpAddr) -> VpnResult<()> {
        tokio::fs::write(&self.path, Self::render(dns)).await?;
        log::info!("DNS set to {} in {}", dns, self.path.display());
        Ok(())
    }

    async fn restore(&self, entries: &[JournalEntry]) -> VpnResult<()> {
        for entry in entries {
            if let PriorDns::File { contents } = &entry.prior {
                tokio::fs::write(&entry.target, contents).await?;
                log::info!("Restored {}", entry.target);
            }
        }
        Ok(())
    }
}

// ============================================================================
// macOS network services
// ============================================================================

/// Sets the resolver on every enabled network service.
pub struct NetworksetupBackend {
    runner: Arc<dyn CommandRunner>,
    binary: PathBuf,
}

impl NetworksetupBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, binaries: &BinaryPaths) -> Self {
        Self {
            runner,
            binary: binaries.networksetup.clone(),
        }
    }

    async fn services(&self) -> VpnResult<Vec<String>> {
        let out = self
            .runner
            .exec(&ShellCommand::tool(&self.binary).arg("-listallnetworkservices"))
            .await?;
        Ok(parse_network_services(&out.stdout))
    }

    async fn set_servers(&self, service: &str, servers: &[String]) -> VpnResult<()> {
        let cmd = ShellCommand::tool(&self.binary)
            .arg("-setdnsservers")
            .arg(service)
            .args(servers.iter().cloned());
        self.runner.exec(&cmd).await?;
        Ok(())
    }
}

/// Service names from `-listallnetworkservices`; disabled (`*`) ones skipped.
pub fn parse_network_services(text: &str) -> Vec<String> {
    text.lines()
        .skip(1)
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('*'))
        .map(str::to_string)
        .collect()
}

/// Parse `-getdnsservers`; "There aren't any DNS Servers set" means automatic.
pub fn parse_dns_servers(text: &str) -> PriorDns {
    let servers: Vec<IpAddr> = text
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();
    if servers.is_empty() {
        PriorDns::Automatic
    } else {
        PriorDns::Servers { servers }
    }
}

#[async_trait]
impl DnsBackend for NetworksetupBackend {
    fn name(&self) -> &'static str {
        "networksetup"
    }

    async fn snapshot(&self, _local_ip: IpAddr) -> VpnResult<Vec<JournalEntry>> {
        let mut entries = Vec::new();
        for service in self.services().await? {
            let out = self
                .runner
                .exec(&ShellCommand::tool(&self.binary).arg("-getdnsservers").arg(&service))
                .await?;
            entries.push(JournalEntry {
                target: service,
                prior: parse_dns_servers(&out.stdout),
            });
        }
        Ok(entries)
    }

    async fn apply(&self, dns: IpAddr, _local_ip: IpAddr) -> VpnResult<()> {
        for service in self.services().await? {
            self.set_servers(&service, &[dns.to_string()]).await?;
        }
        Ok(())
    }

    async fn restore(&self, entries: &[JournalEntry]) -> VpnResult<()> {
        for entry in entries {
            let servers: Vec<String> = match &entry.prior {
                PriorDns::Servers { servers } => servers.iter().map(IpAddr::to_string).collect(),
                _ => vec!["Empty".to_string()],
            };
            if let Err(e) = self.set_servers(&entry.target, &servers).await {
                log::warn!("Failed to restore DNS on '{}': {}", entry.target, e);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Windows
// ============================================================================

/// Static resolver on the tunnel adapter via `netsh`.
pub struct NetshBackend {
    runner: Arc<dyn CommandRunner>,
    binary: PathBuf,
    lookup: InterfaceLookup,
}

impl NetshBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, binaries: &BinaryPaths) -> Self {
        Self {
            runner,
            binary: binaries.netsh.clone(),
            lookup: system_interface_lookup(),
        }
    }

    pub fn with_lookup(mut self, lookup: InterfaceLookup) -> Self {
        self.lookup = lookup;
        self
    }
}

fn netsh_family(ip: &IpAddr) -> &'static str {
    if ip.is_ipv4() {
        "ipv4"
    } else {
        "ipv6"
    }
}

#[async_trait]
impl DnsBackend for NetshBackend {
    fn name(&self) -> &'static str {
        "netsh"
    }

    async fn snapshot(&self, local_ip: IpAddr) -> VpnResult<Vec<JournalEntry>> {
        Ok(vec![JournalEntry {
            target: resolve_interface(&self.lookup, local_ip)?,
            prior: PriorDns::Automatic,
        }])
    }

    async fn apply(&self, dns: IpAddr, local_ip: IpAddr) -> VpnResult<()> {
        let iface = resolve_interface(&self.lookup, local_ip)?;
        let cmd = ShellCommand::tool(&self.binary).args([
            "interface".to_string(),
            netsh_family(&dns).to_string(),
            "set".into(),
            "dnsservers".into(),
            format!("name={}", iface),
            "source=static".into(),
            format!("address={}", dns),
            "register=primary".into(),
            "validate=no".into(),
        ]);
        self.runner.exec(&cmd).await?;
        Ok(())
    }

    async fn restore(&self, entries: &[JournalEntry]) -> VpnResult<()> {
        for entry in entries {
            for family in ["ipv4", "ipv6"] {
                let cmd = ShellCommand::tool(&self.binary).args([
                    "interface".to_string(),
                    family.to_string(),
                    "set".into(),
                    "dnsservers".into(),
                    format!("name={}", entry.target),
                    "source=dhcp".into(),
                ]);
                if let Err(e) = self.runner.exec(&cmd).await {
                    log::debug!("netsh {} revert on {}: {}", family, entry.target, e);
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
struct MemoryDnsState {
    system: Vec<IpAddr>,
    fail_apply: bool,
    applies: usize,
}

/// Resolver state held in memory.
#[derive(Clone, Default)]
pub struct MemoryDnsBackend {
    state: Arc<Mutex<MemoryDnsState>>,
}

impl MemoryDnsBackend {
    pub fn with_system(servers: Vec<IpAddr>) -> Self {
        let backend = Self::default();
        backend.lock().system = servers;
        backend
    }

    pub fn system(&self) -> Vec<IpAddr> {
        self.lock().system.clone()
    }

    pub fn applies(&self) -> usize {
        self.lock().applies
    }

    pub fn fail_apply(&self, fail: bool) {
        self.lock().fail_apply = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryDnsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DnsBackend for MemoryDnsBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn snapshot(&self, _local_ip: IpAddr) -> VpnResult<Vec<JournalEntry>> {
        Ok(vec![JournalEntry {
            target: "system".into(),
            prior: PriorDns::Servers {
                servers: self.system(),
            },
        }])
    }

    async fn apply(&self, dns: IpAddr, _local_ip: IpAddr) -> VpnResult<()> {
        let mut state = self.lock();
        if state.fail_apply {
            return Err(VpnError::tool_failed("dns", Some(1), "apply refused"));
        }
        state.system = vec![dns];
        state.applies += 1;
        Ok(())
    }

    async fn restore(&self, entries: &[JournalEntry]) -> VpnResult<()> {
        for entry in entries {
            if let PriorDns::Servers { servers } = &entry.prior {
                self.lock().system = servers.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpnd_common::shell::ScriptedRunner;
    use vpnd_common::CommandOutput;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn fixed_lookup(name: &'static str) -> InterfaceLookup {
        Arc::new(move |_| Ok(Some(name.to_string())))
    }

    #[test]
    fn test_parse_network_services() {
        let out = "An asterisk (*) denotes that a network service is disabled.\n\
                   Wi-Fi\n*Bluetooth PAN\nThunderbolt Bridge\n";
        assert_eq!(parse_network_services(out), ["Wi-Fi", "Thunderbolt Bridge"]);
    }

    #[test]
    fn test_parse_dns_servers() {
        assert_eq!(
            parse_dns_servers("There aren't any DNS Servers set on Wi-Fi.\n"),
            PriorDns::Automatic
        );
        assert_eq!(
            parse_dns_servers("192.168.1.1\n2001:db8::1\n"),
            PriorDns::Servers {
                servers: vec![ip("192.168.1.1"), ip("2001:db8::1")]
            }
        );
    }

    #[tokio::test]
    async fn test_resolvectl_commands() {
        let runner = ScriptedRunner::new();
        let backend = ResolvectlBackend::new(runner.shared(), &BinaryPaths::default())
            .with_lookup(fixed_lookup("wgivpn"));
        backend.apply(ip("172.21.0.1"), ip("172.21.0.5")).await.unwrap();
        assert_eq!(
            runner.lines(),
            [
                "resolvectl domain wgivpn ~.",
                "resolvectl default-route wgivpn true",
                "resolvectl dns wgivpn 172.21.0.1",
            ]
        );

        runner.on("resolvectl", &["revert"], CommandOutput::failed(1, "Failed to resolve interface"));
        let entries = backend.snapshot(ip("172.21.0.5")).await.unwrap();
        backend.restore(&entries).await.unwrap();
    }

    #[tokio::test]
    async fn test_resolv_conf_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 192.168.1.1\nsearch lan\n").unwrap();

        let backend = ResolvConfBackend::new(&path);
        let entries = backend.snapshot(ip("10.0.0.2")).await.unwrap();
        backend.apply(ip("10.0.0.1"), ip("10.0.0.2")).await.unwrap();
        let applied = std::fs::read_to_string(&path).unwrap();
        assert!(applied.contains("nameserver 10.0.0.1"));
        assert!(!applied.contains("192.168.1.1"));

        backend.restore(&entries).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "nameserver 192.168.1.1\nsearch lan\n"
        );
    }

    #[tokio::test]
    async fn test_networksetup_restore_uses_empty_for_automatic() {
        let runner = ScriptedRunner::new();
        let backend = NetworksetupBackend::new(runner.shared(), &BinaryPaths::default());
        backend
            .restore(&[
                JournalEntry {
                    target: "Wi-Fi".into(),
                    prior: PriorDns::Automatic,
                },
                JournalEntry {
                    target: "Ethernet".into(),
                    prior: PriorDns::Servers {
                        servers: vec![ip("1.1.1.1")],
                    },
                },
            ])
            .await
            .unwrap();
        assert_eq!(
            runner.lines(),
            [
                "/usr/sbin/networksetup -setdnsservers Wi-Fi Empty",
                "/usr/sbin/networksetup -setdnsservers Ethernet 1.1.1.1",
            ]
        );
    }

    #[tokio::test]
    async fn test_netsh_apply_v6_resolver() {
        let runner = ScriptedRunner::new();
        let backend = NetshBackend::new(runner.shared(), &BinaryPaths::default())
            .with_lookup(fixed_lookup("vpnd"));
        backend.apply(ip("fd00::1"), ip("10.0.0.2")).await.unwrap();
        assert_eq!(
            runner.lines(),
            ["netsh interface ipv6 set dnsservers name=vpnd source=static address=fd00::1 register=primary validate=no"]
        );
    }
}
