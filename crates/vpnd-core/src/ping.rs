//! Server latency probes through the platform `ping` helper.

use crate::servers::ServerCatalogue;
use crate::types::VpnType;
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use vpnd_common::{CommandRunner, ShellCommand};

pub const PING_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_CONCURRENT_PINGS: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResult {
    pub host: IpAddr,
    pub rtt_ms: u32,
}

/// Hosts to probe: every host when `all_hosts`, otherwise one random host
/// per server. `prefer` limits the list to one protocol's servers.
pub fn hosts_to_ping<R: Rng + ?Sized>(
    catalogue: &ServerCatalogue,
    all_hosts: bool,
    prefer: Option<VpnType>,
    rng: &mut R,
) -> Vec<IpAddr> {
    let types: &[VpnType] = match prefer {
        Some(VpnType::WireGuard) => &[VpnType::WireGuard],
        Some(VpnType::OpenVpn) => &[VpnType::OpenVpn],
        None => &[VpnType::WireGuard, VpnType::OpenVpn],
    };
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();
    for vpn_type in types {
        for server in catalogue.servers(*vpn_type) {
            if all_hosts {
                hosts.extend(server.hosts.iter().map(|h| h.host).filter(|ip| seen.insert(*ip)));
            } else if let Some(host) = ServerCatalogue::pick_host(server, rng) {
                if seen.insert(host.host) {
                    hosts.push(host.host);
                }
            }
        }
    }
    hosts
}

/// Round-trip time from one `ping` reply, e.g. `time=23.4 ms` or `time<1ms`.
pub fn parse_rtt(output: &str) -> Option<u32> {
    let start = output.find("time=").or_else(|| output.find("time<"))? + "time=".len();
    let value: String = output[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let ms: f64 = value.parse().ok()?;
    Some((ms.round() as u32).max(1))
}

fn ping_command(binary: &Path, host: IpAddr) -> ShellCommand {
    #[cfg(windows)]
    let probe = ["-n", "1", "-w", "1000"];
    #[cfg(target_os = "macos")]
    let probe = ["-c", "1", "-t", "1"];
    #[cfg(not(any(windows, target_os = "macos")))]
    let probe = ["-c", "1", "-W", "1"];
    ShellCommand::tool(binary)
        .args(probe)
        .arg(host.to_string())
        .timeout(PING_TIMEOUT + Duration::from_secs(1))
}

pub struct Pinger {
    runner: Arc<dyn CommandRunner>,
    binary: PathBuf,
}

impl Pinger {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: PathBuf) -> Self {
        Self { runner, binary }
    }

    /// Probe one host. `None` when it did not answer in time.
    pub async fn ping(&self, host: IpAddr) -> Option<PingResult> {
        let cmd = ping_command(&self.binary, host);
        match self.runner.output(&cmd).await {
            Ok(out) if out.success() => parse_rtt(&out.stdout).map(|rtt_ms| PingResult { host, rtt_ms }),
            Ok(_) => None,
            Err(e) => {
                log::debug!("ping {} failed: {}", host, e);
                None
            }
        }
    }

    /// Probe `hosts`, at most [`MAX_CONCURRENT_PINGS`] at a time. Each answer
    /// is handed to `on_result` as it arrives.
    pub async fn ping_all<F>(&self, hosts: Vec<IpAddr>, on_result: F) -> Vec<PingResult>
    where
        F: Fn(&PingResult),
    {
        let total = hosts.len();
        let results: Vec<PingResult> = stream::iter(hosts)
            .map(|host| self.ping(host))
            .buffer_unordered(MAX_CONCURRENT_PINGS)
            .filter_map(|r| async move { r })
            .inspect(|r| on_result(r))
            .collect()
            .await;
        log::info!("Pinged {} servers ({} answered)", total, results.len());
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::servers::tests::catalogue;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::sync::Mutex;
    use vpnd_common::shell::ScriptedRunner;
    use vpnd_common::CommandOutput;

    #[test]
    fn test_parse_rtt() {
        let linux = "64 bytes from 185.253.97.12: icmp_seq=1 ttl=54 time=23.6 ms";
        assert_eq!(parse_rtt(linux), Some(24));
        let windows = "Reply from 185.253.97.12: bytes=32 time=41ms TTL=54";
        assert_eq!(parse_rtt(windows), Some(41));
        assert_eq!(parse_rtt("Reply from 10.0.0.1: bytes=32 time<1ms TTL=128"), Some(1));
        assert_eq!(parse_rtt("Request timed out."), None);
    }

    #[test]
    fn test_hosts_to_ping_one_per_server() {
        let cat = catalogue();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let hosts = hosts_to_ping(&cat, false, Some(VpnType::WireGuard), &mut rng);
        assert_eq!(hosts.len(), cat.wireguard.len());
        for (server, host) in cat.wireguard.iter().zip(&hosts) {
            assert!(server.hosts.iter().any(|h| h.host == *host));
        }
    }

    #[test]
    fn test_hosts_to_ping_all_hosts_deduplicated() {
        let cat = catalogue();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let hosts = hosts_to_ping(&cat, true, None, &mut rng);
        let unique: HashSet<_> = hosts.iter().collect();
        assert_eq!(unique.len(), hosts.len());
        let expected: HashSet<_> = cat
            .wireguard
            .iter()
            .chain(&cat.openvpn)
            .flat_map(|s| s.hosts.iter().map(|h| h.host))
            .collect();
        assert_eq!(hosts.len(), expected.len());
    }

    #[tokio::test]
    async fn test_ping_all_reports_answers_only() {
        let runner = ScriptedRunner::new();
        runner.on_match(
            |cmd| cmd.get_args().iter().any(|a| a == "185.253.97.12"),
            vec![CommandOutput::ok(
                "64 bytes from 185.253.97.12: icmp_seq=1 ttl=54 time=18.2 ms\n",
            )],
        );
        runner.on_match(
            |cmd| cmd.get_args().iter().any(|a| a == "185.253.97.13"),
            vec![CommandOutput::failed(1, "")],
        );
        let pinger = Pinger::new(runner.shared(), "ping".into());
        let seen = Mutex::new(Vec::new());
        let results = pinger
            .ping_all(
                vec!["185.253.97.12".parse().unwrap(), "185.253.97.13".parse().unwrap()],
                |r| seen.lock().unwrap().push(r.clone()),
            )
            .await;
        assert_eq!(
            results,
            vec![PingResult {
                host: "185.253.97.12".parse().unwrap(),
                rtt_ms: 18
            }]
        );
        assert_eq!(seen.into_inner().unwrap(), results);
    }

    #[test]
    fn test_ping_result_wire_names() {
        let r = PingResult {
            host: "1.2.3.4".parse().unwrap(),
            rtt_ms: 5,
        };
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            serde_json::json!({"host": "1.2.3.4", "rttMs": 5})
        );
    }
}
