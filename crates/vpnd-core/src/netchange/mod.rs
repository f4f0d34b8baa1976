//! Routing and link change detection.
//!
//! A platform [`ChangeSource`] yields one item per raw kernel notification.
//! The detector collapses bursts into a single signal after [`DEBOUNCE`] of
//! quiet and then checks whether the protected interface still carries
//! traffic to the probe addresses.

#[cfg(target_os = "linux")]
mod linux;
mod macos;
#[cfg(windows)]
mod iphlp;

use crate::error::{VpnError, VpnResult};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vpnd_common::net::outbound_ip_for;

pub use macos::has_route_change;

/// Quiet period after the last raw notification.
pub const DEBOUNCE: Duration = Duration::from_secs(3);

/// Destinations whose outbound interface is checked after a change.
pub const PROBE_ADDRS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetChangeEvent {
    /// Traffic to the probes no longer leaves through the protected interface.
    RoutingChanged,
    /// Some routing, link or address change happened.
    RoutingUpdate,
}

/// Stream of raw change notifications.
#[async_trait]
pub trait ChangeSource: Send {
    /// Wait for the next notification. `None` means the source is closed.
    async fn next(&mut self) -> Option<()>;
}

/// Opens a fresh source for every `start`.
pub type SourceFactory = Arc<dyn Fn() -> io::Result<Box<dyn ChangeSource>> + Send + Sync>;

/// Local address used to reach a destination.
pub type RouteProbe = Arc<dyn Fn(IpAddr) -> Option<IpAddr> + Send + Sync>;

pub fn system_route_probe() -> RouteProbe {
    Arc::new(|dest| outbound_ip_for(dest).ok())
}

/// Source for the running platform.
pub fn platform_source_factory() -> SourceFactory {
    #[cfg(target_os = "linux")]
    {
        Arc::new(|| Ok(Box::new(linux::NetlinkSource::open()?) as Box<dyn ChangeSource>))
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(|| Ok(Box::new(macos::RouteSocketSource::open()?) as Box<dyn ChangeSource>))
    }
    #[cfg(windows)]
    {
        Arc::new(|| Ok(Box::new(iphlp::RouteNotifySource::open()?) as Box<dyn ChangeSource>))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        Arc::new(|| {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "routing change notifications are not supported",
            ))
        })
    }
}

/// Source fed through a channel; the sender side injects notifications.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<()>,
}

impl ChannelSource {
    pub fn new() -> (mpsc::UnboundedSender<()>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl ChangeSource for ChannelSource {
    async fn next(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

// ============================================================================
// Detector
// ============================================================================

enum DetectorState {
    Uninitialised,
    Initialised { protected: IpAddr },
    Started { cancel: CancellationToken, task: JoinHandle<()> },
}

pub struct NetChangeDetector {
    factory: SourceFactory,
    probe: RouteProbe,
    events: broadcast::Sender<NetChangeEvent>,
    state: Mutex<DetectorState>,
}

impl NetChangeDetector {
    pub fn new(factory: SourceFactory, probe: RouteProbe) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            factory,
            probe,
            events,
            state: Mutex::new(DetectorState::Uninitialised),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetChangeEvent> {
        self.events.subscribe()
    }

    /// Remember the local address of the interface that must keep carrying
    /// traffic. Stops a running watcher first.
    pub async fn init(&self, protected: IpAddr) {
        self.stop().await;
        *self.lock() = DetectorState::Initialised { protected };
    }

    pub fn is_started(&self) -> bool {
        matches!(*self.lock(), DetectorState::Started { .. })
    }

    pub fn start(&self) -> VpnResult<()> {
        let mut state = self.lock();
        let protected = match &*state {
            DetectorState::Initialised { protected } => *protected,
            DetectorState::Started { .. } => return Ok(()),
            DetectorState::Uninitialised => {
                return Err(VpnError::internal("route change detector is not initialised"))
            }
        };
        let source = (self.factory)()
            .map_err(|e| VpnError::internal(format!("failed to open route change source: {}", e)))?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watch(
            source,
            protected,
            self.probe.clone(),
            self.events.clone(),
            cancel.clone(),
        ));
        log::info!("Route change detection started (protected address {})", protected);
        *state = DetectorState::Started { cancel, task };
        Ok(())
    }

    /// Stop watching. Once this returns no further events are sent.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock(), DetectorState::Uninitialised);
        if let DetectorState::Started { cancel, task } = previous {
            cancel.cancel();
            if let Err(e) = task.await {
                log::warn!("Route change watcher ended abnormally: {}", e);
            }
            log::info!("Route change detection stopped");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn watch(
    mut source: Box<dyn ChangeSource>,
    protected: IpAddr,
    probe: RouteProbe,
    events: broadcast::Sender<NetChangeEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            raw = source.next() => if raw.is_none() {
                log::warn!("Route change source closed");
                return;
            },
        }

        // Debounce: restart the quiet period on every new notification.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                raw = source.next() => if raw.is_none() {
                    log::warn!("Route change source closed");
                    return;
                },
                _ = tokio::time::sleep(DEBOUNCE) => break,
            }
        }

        let diverged = PROBE_ADDRS.iter().any(|dest| match probe(*dest) {
            Some(local) => local != protected,
            None => true,
        });

        if cancel.is_cancelled() {
            return;
        }
        if diverged {
            log::info!("Routing changed: traffic no longer leaves through {}", protected);
            let _ = events.send(NetChangeEvent::RoutingChanged);
        } else {
            log::debug!("Routing update");
            let _ = events.send(NetChangeEvent::RoutingUpdate);
        }
    }
}
