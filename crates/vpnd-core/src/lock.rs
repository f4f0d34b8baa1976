//! Single-instance lock for the daemon.
//!
//! Two daemons would fight over routes, firewall rules and DNS; the second
//! one must refuse to start.

use crate::error::{VpnError, VpnResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Exclusive lock held for the daemon's lifetime.
pub struct DaemonLock {
    path: PathBuf,
    #[allow(dead_code)]
    file: File,
}

impl DaemonLock {
    /// Acquire the lock at `path`, writing our PID into it.
    pub fn acquire(path: &Path) -> VpnResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VpnError::config_with_source("Failed to create lock directory", e))?;
        }

        // Do not truncate before the lock is held.
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| VpnError::config_with_source("Failed to open lock file", e))?;

        file.try_lock_exclusive()
            .map_err(|_| VpnError::conflict("another instance is running"))?;

        file.set_len(0)
            .map_err(|e| VpnError::config_with_source("Failed to truncate lock file", e))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| VpnError::config_with_source("Failed to seek lock file", e))?;
        writeln!(file, "{}", std::process::id())
            .map_err(|e| VpnError::config_with_source("Failed to write PID to lock file", e))?;

        log::debug!("Acquired daemon lock: {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        // The file stays on disk; unlinking it would race with a new instance.
        log::debug!("Released daemon lock: {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_acquire_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnd.lock");

        let lock = DaemonLock::acquire(&path).expect("Should acquire lock");
        let second = DaemonLock::acquire(&path);
        assert!(matches!(second, Err(VpnError::Conflict { .. })));

        drop(lock);
        let _again = DaemonLock::acquire(&path).expect("Should acquire lock again");

        let pid: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(pid, std::process::id());
    }
}
