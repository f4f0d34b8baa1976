//! macOS backend: a dedicated PF anchor.
//!
//! The stock `/etc/pf.conf` evaluates `com.apple/*`, so rules loaded into a
//! sub-anchor there take effect without touching the main ruleset. Loading
//! with `pfctl -a <anchor> -f -` replaces the anchor atomically.

use super::rules::{Action, Direction, Protocol, Rule, RuleSet};
use super::FirewallBackend;
use crate::error::VpnResult;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use vpnd_common::config::BinaryPaths;
use vpnd_common::net::Family;
use vpnd_common::{CommandRunner, ShellCommand};

pub const FIREWALL_ANCHOR: &str = "com.apple/250.VpndFirewall";
pub const DNS_ANCHOR: &str = "com.apple/251.VpndDns";

pub struct PfBackend {
    runner: Arc<dyn CommandRunner>,
    pfctl: PathBuf,
    /// Reference from `pfctl -E`, released on removal.
    token: Mutex<Option<String>>,
}

impl PfBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, binaries: &BinaryPaths) -> Self {
        Self {
            runner,
            pfctl: binaries.pfctl.clone(),
            token: Mutex::new(None),
        }
    }

    async fn load(&self, anchor: &str, rules: String) -> VpnResult<()> {
        let cmd = ShellCommand::tool(&self.pfctl)
            .args(["-a", anchor, "-f", "-"])
            .stdin(rules);
        self.runner.exec(&cmd).await?;
        self.enable_pf().await
    }

    async fn flush(&self, anchor: &str) -> VpnResult<()> {
        let cmd = ShellCommand::tool(&self.pfctl).args(["-a", anchor, "-F", "all"]);
        self.runner.exec(&cmd).await?;
        Ok(())
    }

    async fn enable_pf(&self) -> VpnResult<()> {
        let mut token = self.token.lock().await;
        if token.is_some() {
            return Ok(());
        }
        let out = self.runner.exec(&ShellCommand::tool(&self.pfctl).arg("-E")).await?;
        *token = parse_token(&out.stderr).or_else(|| parse_token(&out.stdout));
        log::debug!("PF enabled (token {:?})", *token);
        Ok(())
    }

    async fn release_pf(&self) {
        if let Some(token) = self.token.lock().await.take() {
            let cmd = ShellCommand::tool(&self.pfctl).args(["-X", &token]);
            if let Err(e) = self.runner.exec(&cmd).await {
                log::warn!("Failed to release PF reference: {}", e);
            }
        }
    }

    async fn anchor_has_rules(&self, anchor: &str) -> VpnResult<bool> {
        let cmd = ShellCommand::tool(&self.pfctl).args(["-a", anchor, "-s", "rules"]);
        let out = self.runner.output(&cmd).await?;
        Ok(out.success() && !out.stdout.trim().is_empty())
    }
}

#[async_trait]
impl FirewallBackend for PfBackend {
    fn name(&self) -> &'static str {
        "pf"
    }

    async fn apply(&self, rules: &RuleSet) -> VpnResult<()> {
        self.load(FIREWALL_ANCHOR, render_anchor(rules)).await
    }

    async fn remove(&self) -> VpnResult<()> {
        self.flush(FIREWALL_ANCHOR).await?;
        if !self.anchor_has_rules(DNS_ANCHOR).await.unwrap_or(false) {
            self.release_pf().await;
        }
        Ok(())
    }

    async fn is_installed(&self) -> VpnResult<bool> {
        self.anchor_has_rules(FIREWALL_ANCHOR).await
    }

    async fn set_single_dns_rule(&self, rules: Option<&RuleSet>) -> VpnResult<()> {
        match rules {
            Some(rules) => self.load(DNS_ANCHOR, render_anchor(rules)).await,
            None => self.flush(DNS_ANCHOR).await,
        }
    }
}

/// `pfctl -E` prints `Token : <n>`.
fn parse_token(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "Token").then(|| value.trim().to_string())
    })
}

fn render_anchor(rules: &RuleSet) -> String {
    let mut out = String::new();
    for rule in rules.ordered() {
        for line in pf_rule(rule) {
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

fn pf_rule(rule: &Rule) -> Vec<String> {
    if rule.application.is_some() {
        return Vec::new();
    }
    let directions: &[Direction] = match rule.direction {
        Direction::Both => &[Direction::Out, Direction::In],
        Direction::Out => &[Direction::Out],
        Direction::In => &[Direction::In],
    };
    let families: Vec<Family> = match rule.effective_family() {
        Some(f) => vec![f],
        None if rule.protocol == Protocol::Icmp => vec![Family::V4, Family::V6],
        None => vec![],
    };

    let mut lines = Vec::new();
    for direction in directions {
        if families.is_empty() {
            lines.push(pf_line(rule, *direction, None));
        }
        for family in &families {
            lines.push(pf_line(rule, *direction, Some(*family)));
        }
    }
    lines
}

fn pf_line(rule: &Rule, direction: Direction, family: Option<Family>) -> String {
    let mut parts = vec![match rule.action {
        Action::Allow => "pass",
        Action::Block => "block drop",
    }
    .to_string()];
    parts.push(if direction == Direction::In { "in" } else { "out" }.to_string());
    parts.push("quick".into());
    if let Some(f) = family {
        parts.push(if f == Family::V4 { "inet" } else { "inet6" }.into());
    }
    match rule.protocol {
        Protocol::Any => {}
        Protocol::Tcp => parts.push("proto tcp".into()),
        Protocol::Udp => parts.push("proto udp".into()),
        Protocol::Icmp if family == Some(Family::V6) => parts.push("proto icmp6".into()),
        Protocol::Icmp => parts.push("proto icmp".into()),
    }

    let endpoint = |net: Option<&ipnet::IpNet>, port: Option<u16>| {
        let mut s = net.map(|n| n.to_string()).unwrap_or_else(|| "any".into());
        if let Some(p) = port {
            s.push_str(&format!(" port {}", p));
        }
        s
    };
    let local = endpoint(rule.local.as_ref(), rule.local_port);
    let remote = endpoint(rule.remote.as_ref(), rule.remote_port);
    let (from, to) = if direction == Direction::In {
        (remote, local)
    } else {
        (local, remote)
    };
    if from == "any" && to == "any" {
        parts.push("all".into());
    } else {
        parts.push(format!("from {} to {}", from, to));
    }
    parts.push(format!("label \"{}\"", rule.tag));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::rules::{build_rules, RuleContext};
    use crate::firewall::{FirewallState, HostException};
    use vpnd_common::shell::ScriptedRunner;
    use vpnd_common::CommandOutput;

    fn rules() -> RuleSet {
        let mut state = FirewallState {
            enabled: true,
            allow_lan: true,
            ..Default::default()
        };
        state.host_exceptions.insert(
            "185.253.97.12".parse().unwrap(),
            HostException {
                persistent: false,
                icmp_only: true,
            },
        );
        let ctx = RuleContext {
            lan: vec!["192.168.1.0/24".parse().unwrap()],
            applications: vec![],
        };
        build_rules(&state, &ctx)
    }

    #[test]
    fn test_render_anchor() {
        let text = render_anchor(&rules());
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines.contains(&"pass out quick inet from 127.0.0.0/8 to any label \"loopback\""));
        assert!(lines.contains(&"pass in quick inet from any to 127.0.0.0/8 label \"loopback\""));
        assert!(lines.contains(&"block drop out quick proto udp from any to any port 53 label \"dns-block\""));
        assert!(lines.contains(&"pass out quick inet from any to 192.168.1.0/24 label \"lan\""));
        assert!(lines.contains(&"pass out quick inet proto icmp from any to 185.253.97.12/32 label \"icmp-exception\""));
        assert_eq!(lines.last(), Some(&"block drop in quick inet6 all label \"block-all\""));
        let dns_block = lines.iter().position(|l| l.contains("dns-block")).unwrap();
        let lan = lines.iter().position(|l| l.contains("\"lan\"")).unwrap();
        assert!(dns_block < lan);
    }

    #[test]
    fn test_parse_token() {
        assert_eq!(
            parse_token("No ALTQ support in kernel\nToken : 15307652312\n"),
            Some("15307652312".to_string())
        );
        assert_eq!(parse_token("pf enabled"), None);
    }

    #[tokio::test]
    async fn test_apply_enables_pf_once_and_releases_token() {
        let runner = ScriptedRunner::new();
        runner.on(
            "/sbin/pfctl",
            &["-E"],
            CommandOutput {
                stderr: "pf enabled\nToken : 42\n".into(),
                ..CommandOutput::ok("")
            },
        );
        let backend = PfBackend::new(runner.shared(), &BinaryPaths::default());
        backend.apply(&rules()).await.unwrap();
        backend.apply(&rules()).await.unwrap();
        backend.remove().await.unwrap();

        let lines = runner.lines();
        assert_eq!(lines.iter().filter(|l| l.ends_with("-E")).count(), 1);
        assert!(lines.contains(&"/sbin/pfctl -a com.apple/250.VpndFirewall -F all".to_string()));
        assert!(lines.contains(&"/sbin/pfctl -X 42".to_string()));
    }

    #[tokio::test]
    async fn test_is_installed_reads_anchor() {
        let runner = ScriptedRunner::new();
        let backend = PfBackend::new(runner.shared(), &BinaryPaths::default());
        assert!(!backend.is_installed().await.unwrap());
        runner.on(
            "/sbin/pfctl",
            &["-a", FIREWALL_ANCHOR, "-s"],
            CommandOutput::ok("block drop out quick inet all label \"block-all\"\n"),
        );
        assert!(backend.is_installed().await.unwrap());
    }
}
