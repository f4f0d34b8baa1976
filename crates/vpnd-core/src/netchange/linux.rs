//! rtnetlink multicast listener.

use super::ChangeSource;
use async_trait::async_trait;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

const GROUPS: u32 = (libc::RTMGRP_LINK
    | libc::RTMGRP_IPV4_IFADDR
    | libc::RTMGRP_IPV6_IFADDR
    | libc::RTMGRP_IPV4_ROUTE
    | libc::RTMGRP_IPV6_ROUTE) as u32;

pub struct NetlinkSource {
    fd: AsyncFd<OwnedFd>,
    buf: Vec<u8>,
}

impl NetlinkSource {
    pub fn open() -> io::Result<Self> {
        // SAFETY: plain socket syscall; the descriptor is owned right away.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                libc::NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a fresh, valid descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain data; zeroed is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = GROUPS;
        // SAFETY: `addr` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: AsyncFd::with_interest(fd, Interest::READABLE)?,
            buf: vec![0u8; 16 * 1024],
        })
    }

    async fn recv(&mut self) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let buf = &mut self.buf;
            let result = guard.try_io(|inner| {
                // SAFETY: `buf` is valid for `buf.len()` bytes.
                let n = unsafe {
                    libc::recv(
                        inner.get_ref().as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                        0,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(r) => return r,
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl ChangeSource for NetlinkSource {
    async fn next(&mut self) -> Option<()> {
        match self.recv().await {
            Ok(0) => None,
            Ok(_) => Some(()),
            // Kernel dropped messages: something changed anyway.
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => Some(()),
            Err(e) => {
                log::error!("Netlink receive failed: {}", e);
                None
            }
        }
    }
}
