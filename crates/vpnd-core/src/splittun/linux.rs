//! Linux backend: a net_cls cgroup plus policy routing.
//!
//! Processes in the `ivpn-exclude` cgroup get a class id; an iptables mangle
//! rule turns the class id into a firewall mark, and an `ip rule` sends
//! marked packets to a routing table whose default route is the physical
//! gateway. Inverse mode selects the unmarked traffic instead. Marked
//! packets are masqueraded because their source address was chosen before
//! the mark rerouted them.

use super::procfs::{descendants, parse_pid_list, read_process, resolve_roots, RunningApp};
use super::{SplitConfig, SplitTunnelBackend};
use crate::error::{VpnError, VpnResult};
use crate::route::{add_routes, remove_routes, RouteEntry, RoutingTable};
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::BTreeMap;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use vpnd_common::config::BinaryPaths;
use vpnd_common::net::Family;
use vpnd_common::{CommandRunner, ShellCommand};

pub const NET_CLS_ROOT: &str = "/sys/fs/cgroup/net_cls";
pub const CGROUP_NAME: &str = "ivpn-exclude";

/// "IVPN" in ASCII.
pub const CLASS_ID: u32 = 0x4956_504e;
pub const FWMARK: u32 = 0xca6c;
pub const ROUTING_TABLE: u32 = 17;
pub const BLACKHOLE_TABLE: u32 = 18;
pub const RULE_PRIORITY: u32 = 1005;

/// Lets more specific main-table routes (LAN, server pin) win over the
/// split tables; only `/0` and `/1` routes are suppressed.
const MAIN_RULE_PRIORITY: u32 = RULE_PRIORITY - 1;
const BLACKHOLE_RULE_PRIORITY: u32 = RULE_PRIORITY + 1;

/// Upper bound on duplicate rules removed per call.
const MAX_RULE_DELETES: usize = 8;

#[derive(Default)]
struct LinuxState {
    applied: Option<SplitConfig>,
    /// Explicitly added processes and the command they were started with.
    roots: BTreeMap<u32, String>,
    table_routes: Vec<RouteEntry>,
}

pub struct CgroupBackend {
    runner: Arc<dyn CommandRunner>,
    ip: PathBuf,
    iptables: PathBuf,
    ip6tables: PathBuf,
    routes: Arc<dyn RoutingTable>,
    net_cls_root: PathBuf,
    proc_root: PathBuf,
    state: Mutex<LinuxState>,
}

impl CgroupBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, binaries: &BinaryPaths, routes: Arc<dyn RoutingTable>) -> Self {
        Self {
            runner,
            ip: binaries.ip.clone(),
            iptables: binaries.iptables.clone(),
            ip6tables: binaries.ip6tables.clone(),
            routes,
            net_cls_root: PathBuf::from(NET_CLS_ROOT),
            proc_root: PathBuf::from("/proc"),
            state: Mutex::new(LinuxState::default()),
        }
    }

    /// Use other cgroup and procfs mounts.
    pub fn with_roots(mut self, net_cls_root: &Path, proc_root: &Path) -> Self {
        self.net_cls_root = net_cls_root.to_path_buf();
        self.proc_root = proc_root.to_path_buf();
        self
    }

    fn cgroup_dir(&self) -> PathBuf {
        self.net_cls_root.join(CGROUP_NAME)
    }

    async fn ensure_cgroup(&self) -> VpnResult<()> {
        if !self.net_cls_root.join("cgroup.procs").exists() {
            fs::create_dir_all(&self.net_cls_root)?;
            let mount = ShellCommand::new("mount").args([
                "-t".to_string(),
                "cgroup".into(),
                "-o".into(),
                "net_cls".into(),
                "net_cls".into(),
                self.net_cls_root.display().to_string(),
            ]);
            self.runner.exec(&mount).await?;
        }
        let dir = self.cgroup_dir();
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("net_cls.classid"), CLASS_ID.to_string())?;
        Ok(())
    }

    fn iptables(&self, family: Family) -> &Path {
        match family {
            Family::V4 => &self.iptables,
            Family::V6 => &self.ip6tables,
        }
    }

    fn ip_cmd(&self, family: Family) -> ShellCommand {
        let cmd = ShellCommand::tool(&self.ip);
        match family {
            Family::V4 => cmd,
            Family::V6 => cmd.arg("-6"),
        }
    }

    fn mark_rules() -> Vec<Vec<String>> {
        let to_strings = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        vec![
            to_strings(&[
                "-t",
                "mangle",
                "OUTPUT",
                "-m",
                "cgroup",
                "--cgroup",
                &format!("{:#x}", CLASS_ID),
                "-j",
                "MARK",
                "--set-mark",
                &format!("{:#x}", FWMARK),
            ]),
            to_strings(&[
                "-t",
                "nat",
                "POSTROUTING",
                "-m",
                "mark",
                "--mark",
                &format!("{:#x}", FWMARK),
                "-j",
                "MASQUERADE",
            ]),
        ]
    }

    /// `rule` is `[-t, table, chain, spec..]`; insert the action flag after
    /// the chain.
    fn iptables_cmd(&self, family: Family, action: &str, rule: &[String]) -> ShellCommand {
        let (head, spec) = rule.split_at(2);
        let (chain, spec) = spec.split_at(1);
        ShellCommand::tool(self.iptables(family))
            .args(head.iter().cloned())
            .arg(action)
            .args(chain.iter().cloned())
            .args(spec.iter().cloned())
    }

    async fn install_marking(&self) -> VpnResult<()> {
        for family in [Family::V4, Family::V6] {
            for rule in Self::mark_rules() {
                let check = self.runner.output(&self.iptables_cmd(family, "-C", &rule)).await?;
                if !check.success() {
                    self.runner.exec(&self.iptables_cmd(family, "-I", &rule)).await?;
                }
            }
        }
        Ok(())
    }

    async fn remove_marking(&self) {
        for family in [Family::V4, Family::V6] {
            for rule in Self::mark_rules() {
                for _ in 0..MAX_RULE_DELETES {
                    match self.runner.output(&self.iptables_cmd(family, "-D", &rule)).await {
                        Ok(out) if out.success() => continue,
                        _ => break,
                    }
                }
            }
        }
    }

    fn rule_specs(config: &SplitConfig) -> Vec<Vec<String>> {
        let mark = format!("{:#x}", FWMARK);
        let mut specs = vec![vec![
            "table".to_string(),
            "main".into(),
            "suppress_prefixlength".into(),
            "1".into(),
            "priority".into(),
            MAIN_RULE_PRIORITY.to_string(),
        ]];
        let mut selector = Vec::new();
        if config.inverse {
            selector.push("not".to_string());
        }
        selector.extend(["fwmark".to_string(), mark.clone()]);
        specs.push(
            selector
                .into_iter()
                .chain([
                    "table".to_string(),
                    ROUTING_TABLE.to_string(),
                    "priority".into(),
                    RULE_PRIORITY.to_string(),
                ])
                .collect(),
        );
        if config.inverse && config.addrs.is_blackhole() {
            specs.push(vec![
                "fwmark".to_string(),
                mark,
                "table".into(),
                BLACKHOLE_TABLE.to_string(),
                "priority".into(),
                BLACKHOLE_RULE_PRIORITY.to_string(),
            ]);
        }
        specs
    }

    async fn install_rules(&self, config: &SplitConfig) -> VpnResult<()> {
        for family in [Family::V4, Family::V6] {
            for spec in Self::rule_specs(config) {
                let cmd = self.ip_cmd(family).args(["rule", "add"]).args(spec);
                let out = self.runner.output(&cmd).await?;
                if !out.success() {
                    if family == Family::V6 {
                        log::warn!("IPv6 split rule not installed: {}", out.error_text().trim());
                        continue;
                    }
                    return Err(VpnError::tool_failed(cmd.program(), out.code, out.error_text().trim()));
                }
            }
        }
        Ok(())
    }

    async fn remove_rules(&self) {
        for family in [Family::V4, Family::V6] {
            for priority in [MAIN_RULE_PRIORITY, RULE_PRIORITY, BLACKHOLE_RULE_PRIORITY] {
                for _ in 0..MAX_RULE_DELETES {
                    let cmd = self
                        .ip_cmd(family)
                        .args(["rule".to_string(), "del".into(), "priority".into(), priority.to_string()]);
                    match self.runner.output(&cmd).await {
                        Ok(out) if out.success() => continue,
                        _ => break,
                    }
                }
            }
        }
    }

    async fn table_routes(&self, config: &SplitConfig) -> Vec<RouteEntry> {
        let mut routes = Vec::new();
        for family in [Family::V4, Family::V6] {
            let default = match family {
                Family::V4 => IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::UNSPECIFIED, 0)),
                Family::V6 => IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::UNSPECIFIED, 0)),
            };
            match self.routes.default_gateway(family).await {
                Ok(gw) => routes.push(RouteEntry::via_gateway(default, gw).in_table(ROUTING_TABLE)),
                Err(e) => log::debug!("No {:?} gateway for split table: {}", family, e),
            }
            if config.inverse && config.addrs.is_blackhole() {
                routes.push(RouteEntry::blackhole(default).in_table(BLACKHOLE_TABLE));
            }
        }
        routes
    }

    async fn flush_tables(&self) {
        for family in [Family::V4, Family::V6] {
            for table in [ROUTING_TABLE, BLACKHOLE_TABLE] {
                let cmd = self
                    .ip_cmd(family)
                    .args(["route".to_string(), "flush".into(), "table".into(), table.to_string()]);
                if let Err(e) = self.runner.output(&cmd).await {
                    log::debug!("Flushing table {} failed: {}", table, e);
                }
            }
        }
    }

    fn move_to_root(&self, pid: u32) -> VpnResult<()> {
        fs::write(self.net_cls_root.join("cgroup.procs"), pid.to_string())?;
        Ok(())
    }

    fn member_pids(&self) -> VpnResult<Vec<u32>> {
        match fs::read_to_string(self.cgroup_dir().join("cgroup.procs")) {
            Ok(text) => Ok(parse_pid_list(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn release_members(&self) {
        match self.member_pids() {
            Ok(pids) => {
                for pid in pids {
                    if let Err(e) = self.move_to_root(pid) {
                        log::debug!("Unable to release PID {}: {}", pid, e);
                    }
                }
            }
            Err(e) => log::warn!("Unable to read split-tunnel members: {}", e),
        }
    }

    async fn enable(&self, state: &mut LinuxState, config: &SplitConfig) -> VpnResult<()> {
        self.ensure_cgroup().await?;
        self.install_marking().await?;
        self.remove_rules().await;
        self.install_rules(config).await?;
        let routes = self.table_routes(config).await;
        state.table_routes = add_routes(self.routes.as_ref(), &routes).await?;
        Ok(())
    }

    async fn disable(&self, state: &mut LinuxState) {
        self.remove_rules().await;
        remove_routes(self.routes.as_ref(), &state.table_routes).await;
        state.table_routes.clear();
        self.remove_marking().await;
        self.release_members();
        state.roots.clear();
    }

    fn running_apps_locked(&self, state: &mut LinuxState) -> VpnResult<Vec<RunningApp>> {
        let mut apps: Vec<RunningApp> = self
            .member_pids()?
            .into_iter()
            .filter_map(|pid| read_process(&self.proc_root, pid))
            .collect();
        resolve_roots(&mut apps, &mut state.roots);
        Ok(apps)
    }
}

#[async_trait]
impl SplitTunnelBackend for CgroupBackend {
    fn name(&self) -> &'static str {
        "cgroup"
    }

    async fn apply(&self, config: &SplitConfig) -> VpnResult<()> {
        let mut state = self.state.lock().await;
        if state.applied.as_ref().is_some_and(|c| c.active) {
            self.disable(&mut state).await;
        }
        state.applied = None;
        if !config.active {
            return Ok(());
        }
        if let Err(e) = self.enable(&mut state, config).await {
            log::error!("Failed to enable split tunnel: {}", e);
            self.disable(&mut state).await;
            return Err(e);
        }
        log::info!(
            "Split tunnel enabled (inverse: {}, blackhole: {})",
            config.inverse,
            config.addrs.is_blackhole()
        );
        state.applied = Some(config.clone());
        Ok(())
    }

    async fn add_pid(&self, pid: u32, command: &str) -> VpnResult<()> {
        let mut state = self.state.lock().await;
        if !state.applied.as_ref().is_some_and(|c| c.active) {
            return Err(VpnError::conflict("split tunnel is not enabled"));
        }
        fs::write(self.cgroup_dir().join("cgroup.procs"), pid.to_string())?;
        state.roots.insert(pid, command.to_string());
        Ok(())
    }

    async fn remove_pid(&self, pid: u32) -> VpnResult<()> {
        let mut state = self.state.lock().await;
        let apps = self.running_apps_locked(&mut state)?;
        let mut result = Ok(());
        for member in descendants(&apps, pid) {
            log::info!("Removing PID {} from split tunnel", member);
            match self.move_to_root(member) {
                Ok(()) => {
                    state.roots.remove(&member);
                }
                Err(e) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        result
    }

    async fn running_apps(&self) -> VpnResult<Vec<RunningApp>> {
        let mut state = self.state.lock().await;
        self.running_apps_locked(&mut state)
    }

    async fn reapply_routes(&self) -> VpnResult<()> {
        let mut state = self.state.lock().await;
        let Some(config) = state.applied.clone().filter(|c| c.active) else {
            return Ok(());
        };
        let wanted = self.table_routes(&config).await;
        let stale: Vec<RouteEntry> = state
            .table_routes
            .iter()
            .filter(|r| !wanted.contains(r))
            .cloned()
            .collect();
        remove_routes(self.routes.as_ref(), &stale).await;
        // The kernel may have dropped routes we still believe installed.
        for route in &wanted {
            if let Err(e) = self.routes.add_route(route).await {
                log::warn!("Failed to re-install split route {}: {}", route, e);
            }
        }
        state.table_routes = wanted;
        Ok(())
    }

    async fn reset(&self) -> VpnResult<()> {
        let mut state = self.state.lock().await;
        self.disable(&mut state).await;
        self.flush_tables().await;
        state.applied = None;
        Ok(())
    }
}
