//! Routing-table management.
//!
//! Backends describe routes as [`RouteEntry`] values and hand them to a
//! [`RoutingTable`]. The system implementation renders each entry into the
//! platform helper's argument vector; the in-memory implementation backs the
//! tests.

use crate::error::{VpnError, VpnResult};
use crate::netinfo::GatewayProbe;
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use vpnd_common::config::BinaryPaths;
use vpnd_common::net::{host_net, Family};
use vpnd_common::{CommandOutput, CommandRunner, ShellCommand};

/// Path of the BSD `route` utility.
const MACOS_ROUTE: &str = "/sbin/route";

/// Windows interface index of the loopback pseudo-interface.
const WINDOWS_LOOPBACK_INDEX: u32 = 1;

// ============================================================================
// Route model
// ============================================================================

/// Where packets for a destination are sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NextHop {
    /// Through a gateway on the physical network.
    Gateway(IpAddr),
    /// Directly out of a named interface (the tunnel).
    Interface(String),
    /// Dropped.
    Blackhole,
}

/// A single route the daemon installs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteEntry {
    pub destination: IpNet,
    pub next_hop: NextHop,
    /// Policy-routing table (Linux only).
    pub table: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteOp {
    Add,
    Delete,
}

impl RouteEntry {
    pub fn via_gateway(destination: IpNet, gateway: IpAddr) -> Self {
        Self {
            destination,
            next_hop: NextHop::Gateway(gateway),
            table: None,
        }
    }

    pub fn via_interface(destination: IpNet, interface: impl Into<String>) -> Self {
        Self {
            destination,
            next_hop: NextHop::Interface(interface.into()),
            table: None,
        }
    }

    pub fn blackhole(destination: IpNet) -> Self {
        Self {
            destination,
            next_hop: NextHop::Blackhole,
            table: None,
        }
    }

    pub fn in_table(mut self, table: u32) -> Self {
        self.table = Some(table);
        self
    }

    pub fn family(&self) -> Family {
        Family::of(&self.destination.addr())
    }

    fn linux_args(&self, op: RouteOp) -> Vec<String> {
        let mut args = Vec::new();
        if self.family() == Family::V6 {
            args.push("-6".to_string());
        }
        args.push("route".into());
        args.push(match op {
            RouteOp::Add => "add".into(),
            RouteOp::Delete => "del".into(),
        });
        match &self.next_hop {
            NextHop::Blackhole => {
                args.push("blackhole".into());
                args.push(self.destination.to_string());
            }
            NextHop::Gateway(gw) => {
                args.push(self.destination.to_string());
                args.push("via".into());
                args.push(gw.to_string());
            }
            NextHop::Interface(dev) => {
                args.push(self.destination.to_string());
                args.push("dev".into());
                args.push(dev.clone());
            }
        }
        if let Some(table) = self.table {
            args.push("table".into());
            args.push(table.to_string());
        }
        args
    }

    fn macos_args(&self, op: RouteOp) -> Vec<String> {
        let mut args = vec![match op {
            RouteOp::Add => "add".to_string(),
            RouteOp::Delete => "delete".to_string(),
        }];
        match self.destination {
            IpNet::V4(net) => {
                args.push("-net".into());
                args.push(net.network().to_string());
                args.push("-netmask".into());
                args.push(net.netmask().to_string());
            }
            IpNet::V6(net) => {
                args.push("-inet6".into());
                args.push(net.to_string());
            }
        }
        match &self.next_hop {
            NextHop::Gateway(gw) => args.push(gw.to_string()),
            NextHop::Interface(dev) => {
                args.push("-interface".into());
                args.push(dev.clone());
            }
            NextHop::Blackhole => {
                let lo = match self.family() {
                    Family::V4 => "127.0.0.1",
                    Family::V6 => "::1",
                };
                args.push(lo.into());
                args.push("-blackhole".into());
            }
        }
        args
    }

    /// Windows uses `route.exe` for gateway routes and `netsh` otherwise.
    fn windows_command(&self, op: RouteOp, binaries: &BinaryPaths) -> ShellCommand {
        match (&self.next_hop, self.destination) {
            (NextHop::Gateway(gw), IpNet::V4(net)) => ShellCommand::tool(&binaries.route).args([
                match op {
                    RouteOp::Add => "ADD".to_string(),
                    RouteOp::Delete => "DELETE".to_string(),
                },
                net.network().to_string(),
                "MASK".into(),
                net.netmask().to_string(),
                gw.to_string(),
            ]),
            (NextHop::Gateway(gw), IpNet::V6(net)) => ShellCommand::tool(&binaries.route).args([
                match op {
                    RouteOp::Add => "ADD".to_string(),
                    RouteOp::Delete => "DELETE".to_string(),
                },
                net.to_string(),
                gw.to_string(),
            ]),
            (hop, dest) => {
                let interface = match hop {
                    NextHop::Interface(name) => name.clone(),
                    _ => WINDOWS_LOOPBACK_INDEX.to_string(),
                };
                let af = match self.family() {
                    Family::V4 => "ipv4",
                    Family::V6 => "ipv6",
                };
                ShellCommand::tool(&binaries.netsh).args([
                    "interface".to_string(),
                    af.into(),
                    match op {
                        RouteOp::Add => "add".into(),
                        RouteOp::Delete => "delete".into(),
                    },
                    "route".into(),
                    format!("prefix={}", dest),
                    format!("interface={}", interface),
                    "store=active".into(),
                ])
            }
        }
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.next_hop {
            NextHop::Gateway(gw) => write!(f, "{} via {}", self.destination, gw)?,
            NextHop::Interface(dev) => write!(f, "{} dev {}", self.destination, dev)?,
            NextHop::Blackhole => write!(f, "blackhole {}", self.destination)?,
        }
        if let Some(table) = self.table {
            write!(f, " table {}", table)?;
        }
        Ok(())
    }
}

/// The two halves that together cover a family's address space.
///
/// They are more specific than the default route, so they win without
/// touching it.
pub fn split_default_nets(family: Family) -> [IpNet; 2] {
    match family {
        Family::V4 => [
            IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::new(0, 0, 0, 0), 1)),
            IpNet::V4(Ipv4Net::new_assert(Ipv4Addr::new(128, 0, 0, 0), 1)),
        ],
        Family::V6 => [
            IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::UNSPECIFIED, 1)),
            IpNet::V6(Ipv6Net::new_assert(Ipv6Addr::new(0x8000, 0, 0, 0, 0, 0, 0, 0), 1)),
        ],
    }
}

/// Split default routes through `interface`.
pub fn split_default_routes(interface: &str, family: Family) -> Vec<RouteEntry> {
    split_default_nets(family)
        .into_iter()
        .map(|net| RouteEntry::via_interface(net, interface))
        .collect()
}

// ============================================================================
// Routing table trait
// ============================================================================

#[async_trait]
pub trait RoutingTable: Send + Sync {
    /// Install a route. An identical existing route counts as success.
    async fn add_route(&self, route: &RouteEntry) -> VpnResult<()>;

    /// Remove a route. Missing routes are logged, not reported.
    async fn delete_route(&self, route: &RouteEntry) -> VpnResult<()>;

    async fn default_gateway(&self, family: Family) -> VpnResult<IpAddr>;
}

/// Add routes in order, rolling back the ones already added if any fails.
pub async fn add_routes(table: &dyn RoutingTable, routes: &[RouteEntry]) -> VpnResult<Vec<RouteEntry>> {
    let mut added: Vec<RouteEntry> = Vec::with_capacity(routes.len());
    for route in routes {
        if let Err(e) = table.add_route(route).await {
            log::warn!("Failed to add route {}, rolling back {} route(s)", route, added.len());
            remove_routes(table, &added).await;
            return Err(e);
        }
        added.push(route.clone());
    }
    Ok(added)
}

/// Remove routes in reverse order, best-effort.
pub async fn remove_routes(table: &dyn RoutingTable, routes: &[RouteEntry]) {
    for route in routes.iter().rev() {
        if let Err(e) = table.delete_route(route).await {
            log::warn!("Failed to remove route {}: {}", route, e);
        }
    }
}

// ============================================================================
// Host pin
// ============================================================================

/// `/32` (or `/128`) route keeping the VPN server reachable through the
/// physical gateway while the split default routes point into the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPin {
    route: RouteEntry,
    /// False after a failed move; the route is then not in the table.
    installed: bool,
}

impl HostPin {
    /// Pin `server` to the current default gateway of its family.
    pub async fn install(table: &dyn RoutingTable, server: IpAddr) -> VpnResult<Self> {
        let gateway = table.default_gateway(Family::of(&server)).await?;
        Self::install_via(table, server, gateway).await
    }

    pub async fn install_via(table: &dyn RoutingTable, server: IpAddr, gateway: IpAddr) -> VpnResult<Self> {
        let route = RouteEntry::via_gateway(host_net(server), gateway);
        table.add_route(&route).await?;
        log::info!("Pinned server route {}", route);
        Ok(Self { route, installed: true })
    }

    pub fn server(&self) -> IpAddr {
        self.route.destination.addr()
    }

    pub fn gateway(&self) -> Option<IpAddr> {
        match self.route.next_hop {
            NextHop::Gateway(gw) => Some(gw),
            _ => None,
        }
    }

    pub fn route(&self) -> &RouteEntry {
        &self.route
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Point the pin at the current default gateway if it moved, or
    /// re-install it after an earlier failed move.
    ///
    /// The old route is removed before the new one is added so that at no
    /// point two host routes to the server coexist. Returns true if the pin
    /// changed.
    pub async fn refresh(&mut self, table: &dyn RoutingTable) -> VpnResult<bool> {
        let gateway = table.default_gateway(Family::of(&self.server())).await?;
        if self.installed && self.gateway() == Some(gateway) {
            return Ok(false);
        }
        let updated = RouteEntry::via_gateway(self.route.destination, gateway);
        if self.installed {
            if let Err(e) = table.delete_route(&self.route).await {
                log::warn!("Failed to remove stale server route {}: {}", self.route, e);
            }
            self.installed = false;
        }
        let previous = std::mem::replace(&mut self.route, updated);
        table.add_route(&self.route).await?;
        self.installed = true;
        log::info!("Server route moved: {} -> {}", previous, self.route);
        Ok(true)
    }

    pub async fn remove(self, table: &dyn RoutingTable) {
        if !self.installed {
            return;
        }
        if let Err(e) = table.delete_route(&self.route).await {
            log::warn!("Failed to remove server route {}: {}", self.route, e);
        }
    }
}

// ============================================================================
// System implementation
// ============================================================================

/// Detect helper errors meaning "route already present".
///
/// - iproute2: `RTNETLINK answers: File exists`
/// - BSD route: `route: writing to routing socket: File exists`
/// - netsh/route.exe: `The object already exists.`
pub fn is_already_exists_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("file exists")
        || lower.contains("eexist")
        || lower.contains("object already exists")
        || lower.contains("element already exists")
}

/// Accept only characters that can appear in an address or scoped address.
///
/// Gateways read back from helper output are passed to other helpers; this
/// rejects anything that is not hex digits, `:`, `.`, and an optional
/// `%scope` of interface-name characters.
pub fn is_valid_gateway_str(s: &str) -> bool {
    let mut parts = s.splitn(2, '%');
    let addr = parts.next().unwrap_or_default();
    if addr.is_empty()
        || !addr
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
    {
        return false;
    }
    match parts.next() {
        Some(scope) => {
            !scope.is_empty()
                && scope
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        None => true,
    }
}

fn handle_route_add_output(output: CommandOutput, route: &RouteEntry, tool: &str) -> VpnResult<()> {
    if output.success() {
        log::info!("Added route {}", route);
        return Ok(());
    }
    let stderr = output.error_text();
    if is_already_exists_error(&stderr) {
        log::warn!("Route {} already exists (treating as success): {}", route, stderr.trim());
        Ok(())
    } else {
        Err(VpnError::tool_failed(tool, output.code, stderr.trim()))
    }
}

fn handle_route_remove_output(output: CommandOutput, route: &RouteEntry) {
    if output.success() {
        log::info!("Removed route {}", route);
    } else {
        log::warn!("Failed to remove route {}: {}", route, output.error_text().trim());
    }
}

/// Routing table driven by the platform's routing helpers.
pub struct SystemRoutingTable {
    runner: Arc<dyn CommandRunner>,
    binaries: BinaryPaths,
    probe: GatewayProbe,
}

impl SystemRoutingTable {
    pub fn new(runner: Arc<dyn CommandRunner>, binaries: BinaryPaths) -> Self {
        let probe = GatewayProbe::new(runner.clone(), binaries.clone());
        Self {
            runner,
            binaries,
            probe,
        }
    }

    fn command(&self, route: &RouteEntry, op: RouteOp) -> ShellCommand {
        if cfg!(target_os = "linux") {
            ShellCommand::tool(&self.binaries.ip).args(route.linux_args(op))
        } else if cfg!(target_os = "macos") {
            ShellCommand::new(MACOS_ROUTE).args(route.macos_args(op))
        } else {
            route.windows_command(op, &self.binaries)
        }
    }
}

#[async_trait]
impl RoutingTable for SystemRoutingTable {
    async fn add_route(&self, route: &RouteEntry) -> VpnResult<()> {
        let cmd = self.command(route, RouteOp::Add);
        let output = self.runner.output(&cmd).await?;
        handle_route_add_output(output, route, cmd.program())
    }

    async fn delete_route(&self, route: &RouteEntry) -> VpnResult<()> {
        let cmd = self.command(route, RouteOp::Delete);
        let output = self.runner.output(&cmd).await?;
        handle_route_remove_output(output, route);
        Ok(())
    }

    async fn default_gateway(&self, family: Family) -> VpnResult<IpAddr> {
        self.probe.default_gateway(family).await
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct MemoryState {
    routes: Vec<RouteEntry>,
    gateways: HashMap<Family, IpAddr>,
    failing: Vec<IpNet>,
}

/// Routing table kept in memory; used by tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryRoutingTable {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default_gateway(&self, gateway: IpAddr) {
        self.lock().gateways.insert(Family::of(&gateway), gateway);
    }

    /// Make every later add for `destination` fail.
    pub fn fail_destination(&self, destination: IpNet) {
        self.lock().failing.push(destination);
    }

    /// Undo [`fail_destination`](Self::fail_destination).
    pub fn allow_destination(&self, destination: IpNet) {
        self.lock().failing.retain(|d| *d != destination);
    }

    pub fn routes(&self) -> Vec<RouteEntry> {
        self.lock().routes.clone()
    }

    /// Routes whose destination is exactly `destination`.
    pub fn routes_to(&self, destination: IpNet) -> Vec<RouteEntry> {
        self.lock()
            .routes
            .iter()
            .filter(|r| r.destination == destination)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RoutingTable for MemoryRoutingTable {
    async fn add_route(&self, route: &RouteEntry) -> VpnResult<()> {
        let mut state = self.lock();
        if state.failing.contains(&route.destination) {
            return Err(VpnError::tool_failed("route", Some(2), "Network is unreachable"));
        }
        if !state.routes.contains(route) {
            state.routes.push(route.clone());
        }
        Ok(())
    }

    async fn delete_route(&self, route: &RouteEntry) -> VpnResult<()> {
        self.lock().routes.retain(|r| r != route);
        Ok(())
    }

    async fn default_gateway(&self, family: Family) -> VpnResult<IpAddr> {
        self.lock()
            .gateways
            .get(&family)
            .copied()
            .ok_or_else(|| VpnError::not_available("default gateway"))
    }
}
