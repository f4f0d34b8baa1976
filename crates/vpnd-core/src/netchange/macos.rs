//! BSD routing socket listener.

const RTM_ADD: u8 = 0x1;
const RTM_DELETE: u8 = 0x2;
const RTM_CHANGE: u8 = 0x3;

/// True if `buf` holds at least one route add/delete/change message.
///
/// `buf` is the raw content of one read from an `AF_ROUTE` socket; several
/// `rt_msghdr` records may be packed back to back, each starting with its
/// own length (`u16`) and carrying the message type at byte 3.
pub fn has_route_change(buf: &[u8]) -> bool {
    let mut offset = 0usize;
    while offset + 4 <= buf.len() {
        let len = u16::from_ne_bytes([buf[offset], buf[offset + 1]]) as usize;
        if matches!(buf[offset + 3], RTM_ADD | RTM_DELETE | RTM_CHANGE) {
            return true;
        }
        if len == 0 {
            break;
        }
        offset += len;
    }
    false
}

#[cfg(target_os = "macos")]
pub use source::RouteSocketSource;

#[cfg(target_os = "macos")]
mod source {
    use super::super::ChangeSource;
    use super::has_route_change;
    use async_trait::async_trait;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use tokio::io::unix::AsyncFd;
    use tokio::io::Interest;

    pub struct RouteSocketSource {
        fd: AsyncFd<OwnedFd>,
        buf: Vec<u8>,
    }

    impl RouteSocketSource {
        pub fn open() -> io::Result<Self> {
            // SAFETY: plain socket syscall; the descriptor is owned right away.
            let raw = unsafe { libc::socket(libc::AF_ROUTE, libc::SOCK_RAW, libc::AF_UNSPEC) };
            if raw < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: `raw` is a fresh, valid descriptor.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };
            // SAFETY: fcntl on a descriptor we own.
            unsafe {
                let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
                if flags < 0 || libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                    return Err(io::Error::last_os_error());
                }
                libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
            }
            Ok(Self {
                fd: AsyncFd::with_interest(fd, Interest::READABLE)?,
                buf: vec![0u8; 8 * 1024],
            })
        }

        async fn read(&mut self) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                let buf = &mut self.buf;
                let result = guard.try_io(|inner| {
                    // SAFETY: `buf` is valid for `buf.len()` bytes.
                    let n = unsafe {
                        libc::read(
                            inner.get_ref().as_raw_fd(),
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });
                if let Ok(r) = result {
                    return r;
                }
            }
        }
    }

    #[async_trait]
    impl ChangeSource for RouteSocketSource {
        async fn next(&mut self) -> Option<()> {
            loop {
                match self.read().await {
                    Ok(0) => return None,
                    Ok(n) if has_route_change(&self.buf[..n]) => return Some(()),
                    Ok(_) => continue,
                    Err(e) => {
                        log::error!("Routing socket read failed: {}", e);
                        return None;
                    }
                }
            }
        }
    }
}
