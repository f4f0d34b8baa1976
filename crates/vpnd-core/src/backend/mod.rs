//! Tunnel backends.
//!
//! A backend owns one tunnel attempt: it brings the engine up, reports state
//! transitions through a [`StateSink`], and tears everything it created down
//! again before `connect` returns, whether the tunnel ended by itself, failed,
//! or was cancelled by the manager.

pub mod openvpn;
pub mod wireguard;

use crate::error::{VpnError, VpnResult};
use crate::preferences::SessionData;
use crate::route::RoutingTable;
use crate::types::{ConnectionRequest, ConnectionState, StateInfo, VpnType};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vpnd_common::config::{BinaryPaths, OpenVpnFiles, StatePaths};
use vpnd_common::net::Family;
use vpnd_common::CommandRunner;

/// Delay between connectivity checks while no default route exists.
pub const CONNECTIVITY_RETRY: Duration = Duration::from_secs(5);

/// Receives state transitions from a running backend.
#[derive(Clone)]
pub struct StateSink(Arc<dyn Fn(StateInfo) + Send + Sync>);

impl StateSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(StateInfo) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Sink backed by a channel; handy for driving a backend directly.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StateInfo>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self::new(move |s| {
                let _ = tx.send(s);
            }),
            rx,
        )
    }

    pub fn send(&self, state: StateInfo) {
        (self.0)(state)
    }
}

#[async_trait]
pub trait TunnelBackend: Send + Sync {
    fn vpn_type(&self) -> VpnType;

    /// Address the engine dials: the VPN server, or the local obfuscation proxy.
    fn destination_ip(&self) -> IpAddr;

    /// Resolver to use when no manual DNS is configured.
    fn default_dns(&self) -> Option<IpAddr>;

    /// True when the engine itself applies the default resolver.
    fn applies_default_dns(&self) -> bool {
        false
    }

    fn is_ipv6_in_tunnel(&self) -> bool {
        false
    }

    /// Remove leftovers of a previous daemon instance.
    async fn init(&self) -> VpnResult<()> {
        Ok(())
    }

    /// Bring the tunnel up and keep it up until `cancel` fires or the tunnel
    /// ends by itself.
    ///
    /// Returns `Ok(())` when the tunnel ended on its own (an `Exiting` state
    /// has been reported), `Err(Cancelled)` when cancelled. Every route,
    /// file and process created here is removed before returning.
    async fn connect(&self, sink: StateSink, cancel: CancellationToken) -> VpnResult<()>;

    /// The default gateway may have moved.
    async fn on_routing_changed(&self) -> VpnResult<()> {
        Ok(())
    }
}

/// Everything backends need from the daemon.
#[derive(Clone)]
pub struct BackendContext {
    pub runner: Arc<dyn CommandRunner>,
    pub binaries: BinaryPaths,
    pub openvpn_files: OpenVpnFiles,
    pub paths: StatePaths,
    pub routes: Arc<dyn RoutingTable>,
}

/// Build the backend for `req`.
///
/// `req.entry` must already point at the address the engine dials, i.e. be
/// rewritten to the local proxy when obfuscation is active.
pub fn create_backend(
    ctx: &BackendContext,
    req: &ConnectionRequest,
    session: &SessionData,
) -> VpnResult<Arc<dyn TunnelBackend>> {
    match req.vpn_type {
        VpnType::WireGuard => {
            let params = wireguard::WgParams::from_request(req, session)?;
            Ok(Arc::new(wireguard::WireGuard::new(ctx, params)?))
        }
        VpnType::OpenVpn => {
            let params = openvpn::OpenVpnParams::from_request(req, session)?;
            Ok(Arc::new(openvpn::OpenVpn::new(ctx, params)))
        }
    }
}

/// Wait until the OS has a default route for `family` and return its gateway.
///
/// While there is none, `Reconnecting("No connectivity")` is reported every
/// [`CONNECTIVITY_RETRY`].
pub async fn wait_for_connectivity(
    routes: &dyn RoutingTable,
    family: Family,
    vpn_type: VpnType,
    sink: &StateSink,
    cancel: &CancellationToken,
) -> VpnResult<IpAddr> {
    loop {
        match routes.default_gateway(family).await {
            Ok(gateway) => return Ok(gateway),
            Err(e) => log::debug!("No default gateway: {}", e),
        }
        log::info!(
            "No connectivity. Waiting {} sec to retry...",
            CONNECTIVITY_RETRY.as_secs()
        );
        sink.send(StateInfo::new(ConnectionState::Reconnecting, vpn_type).with_description("No connectivity"));
        tokio::select! {
            _ = cancel.cancelled() => return Err(VpnError::Cancelled),
            _ = tokio::time::sleep(CONNECTIVITY_RETRY) => {}
        }
    }
}
