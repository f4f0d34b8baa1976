//! On-disk record of resolver state overwritten by the daemon.

use crate::error::{VpnError, VpnResult};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use vpnd_common::config::{remove_file_if_exists, write_private_file};

/// Resolver configuration that existed before the daemon changed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PriorDns {
    /// Statically configured servers.
    Servers { servers: Vec<IpAddr> },
    /// Servers came from DHCP / router advertisement.
    Automatic,
    /// Full contents of a resolver file.
    File { contents: String },
    /// Per-link settings the resolver daemon can drop on its own.
    LinkRevert,
}

/// One target (interface, network service or file) and its prior state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub target: String,
    pub prior: PriorDns,
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalFile {
    backend: String,
    entries: Vec<JournalEntry>,
}

/// Journal stored at a fixed path; present only while DNS is overridden.
#[derive(Debug, Clone)]
pub struct DnsJournal {
    path: PathBuf,
}

impl DnsJournal {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Entries recorded by `backend`, if a journal exists.
    ///
    /// A journal written by a different backend is reported and ignored.
    pub fn load(&self, backend: &str) -> VpnResult<Option<Vec<JournalEntry>>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: JournalFile = serde_json::from_slice(&data)
            .map_err(|e| VpnError::config_with_source("Corrupt DNS journal", e))?;
        if file.backend != backend {
            log::warn!(
                "DNS journal was written by '{}', current backend is '{}'; ignoring it",
                file.backend,
                backend
            );
            return Ok(None);
        }
        Ok(Some(file.entries))
    }

    pub fn save(&self, backend: &str, entries: &[JournalEntry]) -> VpnResult<()> {
        let file = JournalFile {
            backend: backend.to_string(),
            entries: entries.to_vec(),
        };
        let data = serde_json::to_vec_pretty(&file)
            .map_err(|e| VpnError::config_with_source("Failed to encode DNS journal", e))?;
        write_private_file(&self.path, &data)?;
        log::debug!("DNS journal saved ({} entries)", entries.len());
        Ok(())
    }

    pub fn clear(&self) -> VpnResult<()> {
        remove_file_if_exists(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let journal = DnsJournal::new(&dir.path().join("dns_journal.json"));
        assert_eq!(journal.load("resolvconf").unwrap(), None);

        let entries = vec![
            JournalEntry {
                target: "Wi-Fi".into(),
                prior: PriorDns::Servers {
                    servers: vec!["192.168.1.1".parse().unwrap()],
                },
            },
            JournalEntry {
                target: "Ethernet".into(),
                prior: PriorDns::Automatic,
            },
        ];
        journal.save("networksetup", &entries).unwrap();
        assert_eq!(journal.load("networksetup").unwrap(), Some(entries));
        assert_eq!(journal.load("resolvectl").unwrap(), None);

        journal.clear().unwrap();
        assert!(!journal.exists());
    }

    #[test]
    fn test_corrupt_journal_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dns_journal.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = DnsJournal::new(&path).load("resolvconf").unwrap_err();
        assert!(matches!(err, VpnError::Config(_)));
    }
}
