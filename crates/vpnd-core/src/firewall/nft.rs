//! Linux backend: nftables, with an iptables-restore fallback.
//!
//! The kill-switch lives in its own `inet` table, replaced wholesale by a
//! single `nft -f -` transaction. Hosts without nftables get two user chains
//! per family loaded through `iptables-restore --noflush`.

use super::rules::{Action, Direction, Protocol, Rule, RuleSet};
use super::FirewallBackend;
use crate::error::VpnResult;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use vpnd_common::config::BinaryPaths;
use vpnd_common::net::Family;
use vpnd_common::{CommandRunner, ShellCommand};

pub const FIREWALL_TABLE: &str = "vpnd_firewall";
pub const DNS_TABLE: &str = "vpnd_dns";

const CHAIN_OUT: &str = "VPND_OUT";
const CHAIN_IN: &str = "VPND_IN";
const CHAIN_DNS: &str = "VPND_DNS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Nft,
    Iptables,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    Output,
    Input,
}

impl Hook {
    fn carries(self, direction: Direction) -> bool {
        match direction {
            Direction::Both => true,
            Direction::Out => self == Hook::Output,
            Direction::In => self == Hook::Input,
        }
    }
}

pub struct NftBackend {
    runner: Arc<dyn CommandRunner>,
    nft: PathBuf,
    iptables: [PathBuf; 2],
    restore: [PathBuf; 2],
    mode: OnceCell<Mode>,
}

impl NftBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, binaries: &BinaryPaths) -> Self {
        Self {
            runner,
            nft: binaries.nft.clone(),
            iptables: [binaries.iptables.clone(), binaries.ip6tables.clone()],
            restore: [
                binaries.iptables_restore.clone(),
                binaries.ip6tables_restore.clone(),
            ],
            mode: OnceCell::new(),
        }
    }

    async fn mode(&self) -> Mode {
        *self
            .mode
            .get_or_init(|| async {
                let probe = ShellCommand::tool(&self.nft).args(["list", "tables"]);
                match self.runner.output(&probe).await {
                    Ok(out) if out.success() => Mode::Nft,
                    _ => {
                        log::warn!("nftables unavailable, using iptables for the kill-switch");
                        Mode::Iptables
                    }
                }
            })
            .await
    }

    async fn nft_script(&self, script: String) -> VpnResult<()> {
        let cmd = ShellCommand::tool(&self.nft).args(["-f", "-"]).stdin(script);
        self.runner.exec(&cmd).await?;
        Ok(())
    }

    async fn iptables(&self, family: Family, args: &[&str]) -> VpnResult<bool> {
        let cmd = ShellCommand::tool(&self.iptables[family_index(family)]).args(args.iter().copied());
        Ok(self.runner.output(&cmd).await?.success())
    }

    async fn iptables_load(&self, family: Family, body: String) -> VpnResult<()> {
        let cmd = ShellCommand::tool(&self.restore[family_index(family)])
            .arg("--noflush")
            .stdin(body);
        self.runner.exec(&cmd).await?;
        Ok(())
    }

    /// Make sure `builtin` jumps to `chain` exactly once, at the top.
    async fn iptables_hook(&self, family: Family, builtin: &str, chain: &str) -> VpnResult<()> {
        if !self.iptables(family, &["-C", builtin, "-j", chain]).await? {
            let cmd = ShellCommand::tool(&self.iptables[family_index(family)])
                .args(["-I", builtin, "1", "-j", chain]);
            self.runner.exec(&cmd).await?;
        }
        Ok(())
    }

    async fn iptables_drop(&self, family: Family, builtin: &str, chain: &str) {
        let _ = self.iptables(family, &["-D", builtin, "-j", chain]).await;
        let _ = self.iptables(family, &["-F", chain]).await;
        let _ = self.iptables(family, &["-X", chain]).await;
    }
}

fn family_index(family: Family) -> usize {
    match family {
        Family::V4 => 0,
        Family::V6 => 1,
    }
}

#[async_trait]
impl FirewallBackend for NftBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    async fn apply(&self, rules: &RuleSet) -> VpnResult<()> {
        match self.mode().await {
            Mode::Nft => self.nft_script(render_table(FIREWALL_TABLE, rules, true)).await,
            Mode::Iptables => {
                for family in [Family::V4, Family::V6] {
                    let body = render_iptables(family, rules, &[(Hook::Output, CHAIN_OUT), (Hook::Input, CHAIN_IN)]);
                    self.iptables_load(family, body).await?;
                    self.iptables_hook(family, "OUTPUT", CHAIN_OUT).await?;
                    self.iptables_hook(family, "INPUT", CHAIN_IN).await?;
                }
                Ok(())
            }
        }
    }

    async fn remove(&self) -> VpnResult<()> {
        match self.mode().await {
            Mode::Nft => self.nft_script(render_delete(FIREWALL_TABLE)).await,
            Mode::Iptables => {
                for family in [Family::V4, Family::V6] {
                    self.iptables_drop(family, "OUTPUT", CHAIN_OUT).await;
                    self.iptables_drop(family, "INPUT", CHAIN_IN).await;
                }
                Ok(())
            }
        }
    }

    async fn is_installed(&self) -> VpnResult<bool> {
        match self.mode().await {
            Mode::Nft => {
                let cmd = ShellCommand::tool(&self.nft).args(["list", "table", "inet", FIREWALL_TABLE]);
                Ok(self.runner.output(&cmd).await?.success())
            }
            Mode::Iptables => self.iptables(Family::V4, &["-C", "OUTPUT", "-j", CHAIN_OUT]).await,
        }
    }

    async fn set_single_dns_rule(&self, rules: Option<&RuleSet>) -> VpnResult<()> {
        match (self.mode().await, rules) {
            (Mode::Nft, Some(rules)) => self.nft_script(render_table(DNS_TABLE, rules, false)).await,
            (Mode::Nft, None) => self.nft_script(render_delete(DNS_TABLE)).await,
            (Mode::Iptables, Some(rules)) => {
                for family in [Family::V4, Family::V6] {
                    let body = render_iptables(family, rules, &[(Hook::Output, CHAIN_DNS)]);
                    self.iptables_load(family, body).await?;
                    self.iptables_hook(family, "OUTPUT", CHAIN_DNS).await?;
                }
                Ok(())
            }
            (Mode::Iptables, None) => {
                for family in [Family::V4, Family::V6] {
                    self.iptables_drop(family, "OUTPUT", CHAIN_DNS).await;
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// nftables rendering
// ============================================================================

/// Deleting a table that may not exist: declare it first so the delete
/// never fails.
fn render_delete(table: &str) -> String {
    format!("table inet {table}\ndelete table inet {table}\n")
}

/// Full replacement script for `table`.
fn render_table(table: &str, rules: &RuleSet, with_input: bool) -> String {
    let mut script = render_delete(table);
    let _ = writeln!(script, "table inet {table} {{");
    let hooks: &[Hook] = if with_input {
        &[Hook::Output, Hook::Input]
    } else {
        &[Hook::Output]
    };
    for hook in hooks {
        let (name, hook_name) = match hook {
            Hook::Output => ("output", "output"),
            Hook::Input => ("input", "input"),
        };
        let _ = writeln!(script, "    chain {name} {{");
        let _ = writeln!(script, "        type filter hook {hook_name} priority 0; policy accept;");
        for rule in rules.ordered() {
            if !hook.carries(rule.direction) {
                continue;
            }
            for line in nft_rule(rule, *hook) {
                let _ = writeln!(script, "        {line}");
            }
        }
        let _ = writeln!(script, "    }}");
    }
    script.push_str("}\n");
    script
}

fn nft_addr(family: Family) -> &'static str {
    match family {
        Family::V4 => "ip",
        Family::V6 => "ip6",
    }
}

fn l4_protocols(protocol: Protocol, family: Option<Family>) -> Vec<&'static str> {
    match protocol {
        Protocol::Any => vec![],
        Protocol::Tcp => vec!["tcp"],
        Protocol::Udp => vec!["udp"],
        Protocol::Icmp => match family {
            Some(Family::V4) => vec!["icmp"],
            Some(Family::V6) => vec!["ipv6-icmp"],
            None => vec!["icmp", "ipv6-icmp"],
        },
    }
}

/// nft statements for one rule in one chain. Executable-scoped rules have
/// no nftables equivalent and render to nothing.
fn nft_rule(rule: &Rule, hook: Hook) -> Vec<String> {
    if rule.application.is_some() {
        return Vec::new();
    }
    let family = rule.effective_family();
    let mut matches = Vec::new();

    if rule.local.is_none() && rule.remote.is_none() {
        if let Some(f) = family {
            matches.push(format!(
                "meta nfproto {}",
                if f == Family::V4 { "ipv4" } else { "ipv6" }
            ));
        }
    }
    let (local_dir, remote_dir) = match hook {
        Hook::Output => ("saddr", "daddr"),
        Hook::Input => ("daddr", "saddr"),
    };
    if let Some(net) = &rule.local {
        matches.push(format!("{} {} {}", nft_addr(Family::of(&net.addr())), local_dir, net));
    }
    if let Some(net) = &rule.remote {
        matches.push(format!("{} {} {}", nft_addr(Family::of(&net.addr())), remote_dir, net));
    }

    let (local_port, remote_port) = match hook {
        Hook::Output => ("sport", "dport"),
        Hook::Input => ("dport", "sport"),
    };
    let mut ports = Vec::new();
    if let Some(p) = rule.local_port {
        ports.push(format!("th {} {}", local_port, p));
    }
    if let Some(p) = rule.remote_port {
        ports.push(format!("th {} {}", remote_port, p));
    }

    let verdict = match rule.action {
        Action::Allow => "accept",
        Action::Block => "drop",
    };
    let tail = format!("{} comment \"{}\"", verdict, rule.tag);

    let protocols = l4_protocols(rule.protocol, family);
    if protocols.is_empty() {
        let mut parts = matches;
        parts.extend(ports);
        parts.push(tail);
        return vec![parts.join(" ")];
    }
    protocols
        .into_iter()
        .map(|proto| {
            let mut parts = matches.clone();
            parts.push(format!("meta l4proto {}", proto));
            parts.extend(ports.iter().cloned());
            parts.push(tail.clone());
            parts.join(" ")
        })
        .collect()
}

// ============================================================================
// iptables rendering
// ============================================================================

fn render_iptables(family: Family, rules: &RuleSet, chains: &[(Hook, &str)]) -> String {
    let mut body = String::from("*filter\n");
    for (_, chain) in chains {
        let _ = writeln!(body, ":{} - [0:0]", chain);
    }
    for (hook, chain) in chains {
        for rule in rules.ordered() {
            if !hook.carries(rule.direction) {
                continue;
            }
            if rule.effective_family().is_some_and(|f| f != family) {
                continue;
            }
            for line in iptables_rule(rule, *hook, family) {
                let _ = writeln!(body, "-A {} {}", chain, line);
            }
        }
    }
    body.push_str("COMMIT\n");
    body
}

fn iptables_rule(rule: &Rule, hook: Hook, family: Family) -> Vec<String> {
    if rule.application.is_some() {
        return Vec::new();
    }
    let mut matches = Vec::new();
    let (local_flag, remote_flag) = match hook {
        Hook::Output => ("-s", "-d"),
        Hook::Input => ("-d", "-s"),
    };
    if let Some(net) = &rule.local {
        matches.push(format!("{} {}", local_flag, net));
    }
    if let Some(net) = &rule.remote {
        matches.push(format!("{} {}", remote_flag, net));
    }

    let protocols: Vec<&str> = match rule.protocol {
        Protocol::Any if rule.local_port.is_some() || rule.remote_port.is_some() => vec!["tcp", "udp"],
        Protocol::Any => vec![],
        Protocol::Tcp => vec!["tcp"],
        Protocol::Udp => vec!["udp"],
        Protocol::Icmp if family == Family::V4 => vec!["icmp"],
        Protocol::Icmp => vec!["ipv6-icmp"],
    };
    let (local_port, remote_port) = match hook {
        Hook::Output => ("--sport", "--dport"),
        Hook::Input => ("--dport", "--sport"),
    };
    let mut ports = Vec::new();
    if let Some(p) = rule.local_port {
        ports.push(format!("{} {}", local_port, p));
    }
    if let Some(p) = rule.remote_port {
        ports.push(format!("{} {}", remote_port, p));
    }
    let target = match rule.action {
        Action::Allow => "ACCEPT",
        Action::Block => "DROP",
    };
    let tail = format!("-m comment --comment {} -j {}", rule.tag, target);

    if protocols.is_empty() {
        let mut parts = matches;
        parts.push(tail);
        return vec![parts.join(" ")];
    }
    protocols
        .into_iter()
        .map(|proto| {
            let mut parts = matches.clone();
            parts.push(format!("-p {}", proto));
            parts.extend(ports.iter().cloned());
            parts.push(tail.clone());
            parts.join(" ")
        })
        .collect()
}
