//! IP helper route change notifications.

use super::ChangeSource;
use async_trait::async_trait;
use std::ffi::c_void;
use std::io;
use tokio::sync::mpsc;
use windows::Win32::Foundation::{BOOLEAN, HANDLE, NO_ERROR};
use windows::Win32::NetworkManagement::IpHelper::{
    CancelMibChangeNotify2, NotifyRouteChange2, MIB_IPFORWARD_ROW2, MIB_NOTIFICATION_TYPE,
};
use windows::Win32::Networking::WinSock::AF_UNSPEC;

type Notifier = mpsc::UnboundedSender<()>;

unsafe extern "system" fn on_route_change(
    context: *const c_void,
    _row: *const MIB_IPFORWARD_ROW2,
    _kind: MIB_NOTIFICATION_TYPE,
) {
    if context.is_null() {
        return;
    }
    // SAFETY: `context` is the boxed sender owned by RouteNotifySource, which
    // cancels the registration before freeing it.
    let tx = unsafe { &*(context as *const Notifier) };
    let _ = tx.send(());
}

pub struct RouteNotifySource {
    handle: HANDLE,
    context: *mut Notifier,
    rx: mpsc::UnboundedReceiver<()>,
}

// The handle and context are only touched in `open` and `drop`.
unsafe impl Send for RouteNotifySource {}

impl RouteNotifySource {
    pub fn open() -> io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = Box::into_raw(Box::new(tx));
        let mut handle = HANDLE::default();
        // SAFETY: the callback and context stay valid until
        // CancelMibChangeNotify2 returns in Drop.
        let rc = unsafe {
            NotifyRouteChange2(
                AF_UNSPEC,
                Some(on_route_change),
                Some(context as *const c_void),
                BOOLEAN(0),
                &mut handle,
            )
        };
        if rc != NO_ERROR {
            // SAFETY: registration failed, nothing else holds the pointer.
            drop(unsafe { Box::from_raw(context) });
            return Err(io::Error::from_raw_os_error(rc.0 as i32));
        }
        Ok(Self { handle, context, rx })
    }
}

impl Drop for RouteNotifySource {
    fn drop(&mut self) {
        // SAFETY: cancelling waits for in-flight callbacks, after which the
        // context is no longer referenced.
        unsafe {
            let _ = CancelMibChangeNotify2(self.handle);
            drop(Box::from_raw(self.context));
        }
    }
}

#[async_trait]
impl ChangeSource for RouteNotifySource {
    async fn next(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}
