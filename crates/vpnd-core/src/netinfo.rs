//! Default-gateway discovery.
//!
//! Each platform exposes its routing table through a different helper; the
//! parsers below are pure so they can be tested on any host.

use crate::error::{VpnError, VpnResult};
use std::net::IpAddr;
use std::sync::Arc;
use vpnd_common::config::BinaryPaths;
use vpnd_common::net::Family;
use vpnd_common::{CommandRunner, ShellCommand};

/// A default route as reported by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    pub gateway: IpAddr,
    pub interface: Option<String>,
    pub metric: u32,
}

/// Queries the OS for its current default gateway.
pub struct GatewayProbe {
    runner: Arc<dyn CommandRunner>,
    binaries: BinaryPaths,
}

impl GatewayProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, binaries: BinaryPaths) -> Self {
        Self { runner, binaries }
    }

    /// Default gateway for `family`; the lowest metric wins when several exist.
    pub async fn default_gateway(&self, family: Family) -> VpnResult<IpAddr> {
        self.default_route(family).await.map(|r| r.gateway)
    }

    pub async fn default_route(&self, family: Family) -> VpnResult<DefaultRoute> {
        let routes = self.default_routes(family).await?;
        routes
            .into_iter()
            .min_by_key(|r| r.metric)
            .ok_or_else(|| VpnError::not_available("default gateway"))
    }

    /// True when the interface named `name` carries a default route.
    pub async fn is_default_interface(&self, name: &str) -> VpnResult<bool> {
        let routes = self.default_routes(Family::V4).await?;
        Ok(routes
            .iter()
            .any(|r| r.interface.as_deref() == Some(name)))
    }

    async fn default_routes(&self, family: Family) -> VpnResult<Vec<DefaultRoute>> {
        if cfg!(target_os = "linux") {
            let mut cmd = ShellCommand::tool(&self.binaries.ip);
            if family == Family::V6 {
                cmd = cmd.arg("-6");
            }
            let out = self.runner.exec(&cmd.arg("route")).await?;
            Ok(parse_linux_routes(&out.stdout, family))
        } else if cfg!(target_os = "macos") {
            let af = match family {
                Family::V4 => "inet",
                Family::V6 => "inet6",
            };
            let cmd = ShellCommand::new("/usr/sbin/netstat").args(["-nr", "-f", af]);
            let out = self.runner.exec(&cmd).await?;
            Ok(parse_netstat_routes(&out.stdout, family))
        } else {
            let flag = match family {
                Family::V4 => "-4",
                Family::V6 => "-6",
            };
            let cmd = ShellCommand::tool(&self.binaries.route).args(["print", flag]);
            let out = self.runner.exec(&cmd).await?;
            Ok(parse_route_print(&out.stdout, family))
        }
    }
}

fn family_matches(ip: &IpAddr, family: Family) -> bool {
    Family::of(ip) == family
}

// ============================================================================
// Parsers
// ============================================================================

/// Parse `ip route` output.
///
/// ```text
/// default via 192.168.1.1 dev enp0s3 proto dhcp metric 100
/// ```
/// A missing metric counts as 0.
pub fn parse_linux_routes(text: &str, family: Family) -> Vec<DefaultRoute> {
    let mut routes = Vec::new();
    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"default") {
            continue;
        }
        let value_after = |key: &str| {
            tokens
                .iter()
                .position(|t| *t == key)
                .and_then(|i| tokens.get(i + 1))
                .copied()
        };
        let Some(gateway) = value_after("via").and_then(|v| v.parse::<IpAddr>().ok()) else {
            continue;
        };
        if !family_matches(&gateway, family) {
            continue;
        }
        let metric = value_after("metric")
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);
        routes.push(DefaultRoute {
            gateway,
            interface: value_after("dev").map(str::to_string),
            metric,
        });
    }
    routes
}

/// Parse `netstat -nr` output.
///
/// ```text
/// Destination        Gateway            Flags        Netif Expire
/// default            192.168.1.1        UGScg          en0
/// default            link#17            UCSIg        utun3
/// ```
/// Interface-scoped (`I`) entries are ignored; the table order stands in for
/// the metric.
pub fn parse_netstat_routes(text: &str, family: Family) -> Vec<DefaultRoute> {
    let mut routes = Vec::new();
    for line in text.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 4 || cols[0] != "default" {
            continue;
        }
        if cols[2].contains('I') {
            continue;
        }
        // fe80::1%en0
        let gw_text = cols[1].split('%').next().unwrap_or(cols[1]);
        let Ok(gateway) = gw_text.parse::<IpAddr>() else {
            continue;
        };
        if !family_matches(&gateway, family) {
            continue;
        }
        routes.push(DefaultRoute {
            gateway,
            interface: Some(cols[3].to_string()),
            metric: routes.len() as u32,
        });
    }
    routes
}

/// Parse `route print -4` / `route print -6` output.
///
/// ```text
/// Network Destination        Netmask          Gateway       Interface  Metric
///           0.0.0.0          0.0.0.0      192.168.1.1    192.168.1.57     25
/// ```
/// IPv6 rows read `If Metric Network Destination Gateway`.
pub fn parse_route_print(text: &str, family: Family) -> Vec<DefaultRoute> {
    let mut routes = Vec::new();
    for line in text.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let parsed = match family {
            Family::V4 if cols.len() >= 5 && cols[0] == "0.0.0.0" && cols[1] == "0.0.0.0" => cols[2]
                .parse::<IpAddr>()
                .ok()
                .zip(cols[4].parse::<u32>().ok())
                .map(|(gw, metric)| (gw, metric, Some(cols[3].to_string()))),
            Family::V6 if cols.len() >= 4 && cols[2] == "::/0" => cols[3]
                .parse::<IpAddr>()
                .ok()
                .zip(cols[1].parse::<u32>().ok())
                .map(|(gw, metric)| (gw, metric, Some(cols[0].to_string()))),
            _ => None,
        };
        if let Some((gateway, metric, interface)) = parsed {
            if family_matches(&gateway, family) && !gateway.is_unspecified() {
                routes.push(DefaultRoute {
                    gateway,
                    interface,
                    metric,
                });
            }
        }
    }
    routes
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpnd_common::shell::ScriptedRunner;
    use vpnd_common::CommandOutput;

    #[test]
    fn test_linux_lowest_metric_wins() {
        let out = "default via 192.168.1.1 dev enp0s3 proto dhcp metric 600\n\
                   default via 10.0.0.1 dev wlan0 proto dhcp metric 100\n\
                   192.168.1.0/24 dev enp0s3 proto kernel scope link src 192.168.1.57 metric 100\n";
        let routes = parse_linux_routes(out, Family::V4);
        assert_eq!(routes.len(), 2);
        let best = routes.iter().min_by_key(|r| r.metric).unwrap();
        assert_eq!(best.gateway, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(best.interface.as_deref(), Some("wlan0"));
    }

    #[test]
    fn test_linux_missing_metric_is_zero_and_device_routes_skipped() {
        let out = "default dev wgivpn scope link\ndefault via 192.168.1.1 dev eth0\n";
        let routes = parse_linux_routes(out, Family::V4);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].metric, 0);
    }

    #[test]
    fn test_netstat_skips_scoped_routes() {
        let out = "Routing tables\n\nInternet:\n\
                   Destination        Gateway            Flags        Netif Expire\n\
                   default            192.168.1.1        UGScIg         en1\n\
                   default            192.168.0.1        UGScg          en0\n\
                   127                127.0.0.1          UCS            lo0\n";
        let routes = parse_netstat_routes(out, Family::V4);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].gateway, "192.168.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(routes[0].interface.as_deref(), Some("en0"));
    }

    #[test]
    fn test_netstat_v6_strips_scope() {
        let out = "default                                 fe80::1%en0                     UGcg                en0\n";
        let routes = parse_netstat_routes(out, Family::V6);
        assert_eq!(routes[0].gateway, "fe80::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_route_print_v4_and_v6() {
        let v4 = "Network Destination        Netmask          Gateway       Interface  Metric\n\
                  0.0.0.0          0.0.0.0      192.168.1.1    192.168.1.57     35\n\
                  0.0.0.0          0.0.0.0         10.0.0.1       10.0.0.7     25\n";
        let routes = parse_route_print(v4, Family::V4);
        assert_eq!(routes.iter().min_by_key(|r| r.metric).unwrap().gateway, "10.0.0.1".parse::<IpAddr>().unwrap());

        let v6 = " If Metric Network Destination      Gateway\n 11    281 ::/0                     fe80::1\n";
        let routes = parse_route_print(v6, Family::V6);
        assert_eq!(routes[0].metric, 281);
        assert_eq!(routes[0].interface.as_deref(), Some("11"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_probe_reports_missing_gateway() {
        let runner = ScriptedRunner::new();
        runner.on("/sbin/ip", &["route"], CommandOutput::ok("10.0.0.0/8 dev eth0\n"));
        let probe = GatewayProbe::new(runner.shared(), BinaryPaths::default());
        let err = probe.default_gateway(Family::V4).await.unwrap_err();
        assert!(matches!(err, VpnError::NotAvailable { .. }));

        runner.on("/sbin/ip", &["route"], CommandOutput::ok("default via 192.168.1.1 dev eth0\n"));
        assert!(probe.is_default_interface("eth0").await.unwrap());
    }
}
