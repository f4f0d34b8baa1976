//! Portable kill-switch rule model.
//!
//! [`build_rules`] turns a [`FirewallState`] into a priority-ordered list of
//! allow/block rules. Every native backend renders the same list, and
//! [`RuleSet::classify`] evaluates it against synthetic packets: the matching
//! rule with the highest priority decides, ties going to the earlier rule.

use super::FirewallState;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use vpnd_common::net::{host_net, multicast, Family};

/// DHCP client port.
pub const DHCP_CLIENT_PORT: u16 = 68;
/// DHCP server port.
pub const DHCP_SERVER_PORT: u16 = 67;
/// Plain DNS port.
pub const DNS_PORT: u16 = 53;

/// Rule priority bands, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Band {
    DefaultBlock,
    IcmpOnly,
    Exceptions,
    Tunnel,
    DnsBlock,
    Prioritized,
    Base,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Out,
    In,
    Both,
}

impl Direction {
    fn covers(self, other: Direction) -> bool {
        self == Direction::Both || self == other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Any,
    Tcp,
    Udp,
    Icmp,
}

/// One rule. Unset match fields match anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub band: Band,
    pub action: Action,
    pub direction: Direction,
    /// Restricts the rule to one address family when no address pins it.
    pub family: Option<Family>,
    pub local: Option<IpNet>,
    pub remote: Option<IpNet>,
    pub protocol: Protocol,
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
    pub application: Option<PathBuf>,
    /// Short tag used in rendered rule comments.
    pub tag: &'static str,
}

impl Rule {
    fn new(band: Band, action: Action, tag: &'static str) -> Self {
        Self {
            band,
            action,
            direction: Direction::Both,
            family: None,
            local: None,
            remote: None,
            protocol: Protocol::Any,
            local_port: None,
            remote_port: None,
            application: None,
            tag,
        }
    }

    fn allow(band: Band, tag: &'static str) -> Self {
        Self::new(band, Action::Allow, tag)
    }

    fn block(band: Band, tag: &'static str) -> Self {
        Self::new(band, Action::Block, tag)
    }

    fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    fn family(mut self, family: Family) -> Self {
        self.family = Some(family);
        self
    }

    fn local(mut self, net: IpNet) -> Self {
        self.local = Some(net);
        self
    }

    fn remote(mut self, net: IpNet) -> Self {
        self.remote = Some(net);
        self
    }

    fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    fn remote_port(mut self, port: u16) -> Self {
        self.remote_port = Some(port);
        self
    }

    /// Address family the rule is limited to, if any.
    pub fn effective_family(&self) -> Option<Family> {
        self.family
            .or_else(|| self.remote.map(|n| Family::of(&n.addr())))
            .or_else(|| self.local.map(|n| Family::of(&n.addr())))
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        if !self.direction.covers(packet.direction) {
            return false;
        }
        if let Some(family) = self.effective_family() {
            if family != Family::of(&packet.remote) {
                return false;
            }
        }
        if let Some(net) = &self.remote {
            if !net.contains(&packet.remote) {
                return false;
            }
        }
        if let Some(net) = &self.local {
            if !net.contains(&packet.local) {
                return false;
            }
        }
        if self.protocol != Protocol::Any && self.protocol != packet.protocol {
            return false;
        }
        if self.local_port.is_some() && self.local_port != Some(packet.local_port) {
            return false;
        }
        if self.remote_port.is_some() && self.remote_port != Some(packet.remote_port) {
            return false;
        }
        if let Some(app) = &self.application {
            if packet.application.as_ref() != Some(app) {
                return false;
            }
        }
        true
    }
}

/// A flow as seen by the firewall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub direction: Direction,
    pub local: IpAddr,
    pub remote: IpAddr,
    pub protocol: Protocol,
    pub local_port: u16,
    pub remote_port: u16,
    pub application: Option<PathBuf>,
}

impl Packet {
    /// Outbound flow from an unspecified local address and port.
    pub fn outbound(remote: IpAddr, protocol: Protocol, remote_port: u16) -> Self {
        let local = match remote {
            IpAddr::V4(_) => IpAddr::from([192, 168, 1, 57]),
            IpAddr::V6(_) => IpAddr::from([0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x57]),
        };
        Self {
            direction: Direction::Out,
            local,
            remote,
            protocol,
            local_port: 50000,
            remote_port,
            application: None,
        }
    }

    pub fn from_local(mut self, local: IpAddr) -> Self {
        self.local = local;
        self
    }

    pub fn from_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    pub fn inbound(mut self) -> Self {
        self.direction = Direction::In;
        self
    }

    pub fn by(mut self, application: impl Into<PathBuf>) -> Self {
        self.application = Some(application.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Drop,
}

/// Rules ready to install.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    /// Rules must survive reboot (boot-time layer where available).
    pub persistent: bool,
}

impl RuleSet {
    /// Rules ordered highest band first, stable within a band.
    pub fn ordered(&self) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self.rules.iter().collect();
        rules.sort_by(|a, b| b.band.cmp(&a.band));
        rules
    }

    /// Verdict for `packet`; an empty set lets everything through.
    pub fn classify(&self, packet: &Packet) -> Verdict {
        match self.ordered().into_iter().find(|r| r.matches(packet)) {
            Some(rule) if rule.action == Action::Block => Verdict::Drop,
            _ => Verdict::Allow,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Runtime inputs not stored in the firewall state.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    /// Local non-routable networks on up interfaces.
    pub lan: Vec<IpNet>,
    /// Helper executables allowed unconditionally.
    pub applications: Vec<PathBuf>,
}

fn both_families() -> [Family; 2] {
    [Family::V4, Family::V6]
}

fn loopback_nets() -> [IpNet; 2] {
    [
        IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::LOCALHOST, 8).trunc()),
        host_net(IpAddr::V6(Ipv6Addr::LOCALHOST)),
    ]
}

fn link_local_v6() -> IpNet {
    IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10))
}

fn endpoint_protocol(tcp: bool) -> Protocol {
    if tcp {
        Protocol::Tcp
    } else {
        Protocol::Udp
    }
}

/// Build the full kill-switch rule list for an enabled firewall.
pub fn build_rules(state: &FirewallState, ctx: &RuleContext) -> RuleSet {
    let mut rules = Vec::new();

    // Base allows.
    for net in loopback_nets() {
        rules.push(Rule::allow(Band::Base, "loopback").local(net));
        rules.push(Rule::allow(Band::Base, "loopback").remote(net));
    }
    rules.push(
        Rule::allow(Band::Base, "dhcp")
            .family(Family::V4)
            .protocol(Protocol::Udp)
            .local_port(DHCP_CLIENT_PORT),
    );
    rules.push(Rule::allow(Band::Base, "link-local").remote(link_local_v6()));
    for app in &ctx.applications {
        let mut rule = Rule::allow(Band::Base, "application");
        rule.application = Some(app.clone());
        rules.push(rule);
    }

    // Prioritized host exceptions: above the DNS block so they work on port 53.
    if let Some(ep) = &state.client_endpoint {
        rules.push(
            Rule::allow(Band::Prioritized, "endpoint")
                .remote(host_net(ep.server_ip))
                .protocol(endpoint_protocol(ep.tcp))
                .remote_port(ep.server_port),
        );
    }
    for (ip, exception) in &state.host_exceptions {
        if !exception.icmp_only {
            rules.push(Rule::allow(Band::Prioritized, "host-exception").remote(host_net(*ip)));
        }
    }
    if state.allow_api_servers {
        for ip in &state.api_servers {
            rules.push(Rule::allow(Band::Prioritized, "api").remote(host_net(*ip)));
        }
    }
    if let Some(dns) = state.dns_pin {
        for proto in [Protocol::Udp, Protocol::Tcp] {
            rules.push(
                Rule::allow(Band::Prioritized, "dns-pin")
                    .direction(Direction::Out)
                    .remote(host_net(dns))
                    .protocol(proto)
                    .remote_port(DNS_PORT),
            );
        }
    }

    // Nothing else may reach port 53.
    for proto in [Protocol::Udp, Protocol::Tcp] {
        rules.push(
            Rule::block(Band::DnsBlock, "dns-block")
                .direction(Direction::Out)
                .protocol(proto)
                .remote_port(DNS_PORT),
        );
    }

    // Traffic sourced from the tunnel addresses.
    if let Some(ep) = &state.client_endpoint {
        rules.push(Rule::allow(Band::Tunnel, "tunnel").local(host_net(IpAddr::V4(ep.local_ip))));
        if let Some(v6) = ep.local_ip6 {
            rules.push(Rule::allow(Band::Tunnel, "tunnel").local(host_net(IpAddr::V6(v6))));
        }
    }

    if state.allow_lan {
        for net in &ctx.lan {
            rules.push(Rule::allow(Band::Exceptions, "lan").remote(*net));
        }
        if state.allow_lan_multicast {
            for family in both_families() {
                for net in multicast(family) {
                    rules.push(Rule::allow(Band::Exceptions, "multicast").remote(net));
                }
            }
        }
    }
    for net in &state.user_exceptions {
        rules.push(Rule::allow(Band::Exceptions, "user-exception").remote(*net));
    }

    for (ip, exception) in &state.host_exceptions {
        if exception.icmp_only {
            rules.push(
                Rule::allow(Band::IcmpOnly, "icmp-exception")
                    .remote(host_net(*ip))
                    .protocol(Protocol::Icmp),
            );
        }
    }

    for family in both_families() {
        rules.push(Rule::block(Band::DefaultBlock, "block-all").family(family));
    }

    RuleSet {
        rules,
        persistent: state.persistent,
    }
}

/// Lone DNS rule used while the kill-switch is off: port 53 only to `dns`
/// and to the local forwarder.
pub fn build_single_dns_rules(dns: IpAddr) -> RuleSet {
    let mut rules = Vec::new();
    for target in [dns, IpAddr::from([127, 0, 0, 1])] {
        for proto in [Protocol::Udp, Protocol::Tcp] {
            rules.push(
                Rule::allow(Band::Prioritized, "dns-single")
                    .direction(Direction::Out)
                    .remote(host_net(target))
                    .protocol(proto)
                    .remote_port(DNS_PORT),
            );
        }
    }
    for proto in [Protocol::Udp, Protocol::Tcp] {
        rules.push(
            Rule::block(Band::DnsBlock, "dns-single-block")
                .direction(Direction::Out)
                .protocol(proto)
                .remote_port(DNS_PORT),
        );
    }
    RuleSet {
        rules,
        persistent: false,
    }
}
