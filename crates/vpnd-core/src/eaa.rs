//! Enhanced App Authentication.
//!
//! When enabled, privileged IPC requests must carry the hex SHA-256 of the
//! user's EAA password. The secret file holds a random salt and a salted
//! digest of that hash, never the hash itself.

use crate::error::{VpnError, VpnResult};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use vpnd_common::config::{remove_file_if_exists, write_private_file};

/// Hex SHA-256 of `password`, as sent by frontends.
pub fn password_hash(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn ct_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Binds the secret stored on disk to the hash frontends present.
fn derive_secret(hash: &str, salt: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(salt);
    h.update(hash.as_bytes());
    hex::encode(h.finalize())
}

/// On-disk format: `<salt-hex>:<derived-hex>`, salt being 64 random bytes.
struct Stored {
    salt: Vec<u8>,
    derived: String,
}

impl Stored {
    fn parse(text: &str) -> Option<Self> {
        let (salt, derived) = text.trim().split_once(':')?;
        Some(Self {
            salt: hex::decode(salt).ok()?,
            derived: derived.to_string(),
        })
    }

    fn encode(&self) -> String {
        format!("{}:{}", hex::encode(&self.salt), self.derived)
    }

    fn matches(&self, hash: &str) -> bool {
        ct_eq(&derive_secret(hash, &self.salt), &self.derived)
    }
}

/// Failed checks tolerated within [`LOCKOUT_WINDOW`].
pub const MAX_FAILED_ATTEMPTS: usize = 6;
pub const LOCKOUT_WINDOW: Duration = Duration::from_secs(60);

struct Inner {
    stored: Option<Stored>,
    failures: Vec<Instant>,
}

pub struct Eaa {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl Eaa {
    /// Load the secret file if present. An unreadable file disables EAA.
    pub fn load(path: &Path) -> Self {
        let stored = match std::fs::read_to_string(path) {
            Ok(text) => {
                let stored = Stored::parse(&text);
                if stored.is_none() {
                    log::warn!("Ignoring malformed EAA secret file {}", path.display());
                }
                stored
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!("Failed to read EAA secret: {}", e);
                None
            }
        };
        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                stored,
                failures: Vec::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).stored.is_some()
    }

    /// `Ok(true)` when EAA is disabled or `hash` matches the stored secret.
    ///
    /// A mismatch while the secret file has vanished means it was removed
    /// behind the daemon's back; EAA is then considered disabled. After
    /// [`MAX_FAILED_ATTEMPTS`] failures within [`LOCKOUT_WINDOW`] every
    /// check is refused until the window has passed.
    pub fn check(&self, hash: &str) -> VpnResult<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::check_locked(&self.path, &mut inner, hash)
    }

    fn check_locked(path: &Path, inner: &mut Inner, hash: &str) -> VpnResult<bool> {
        let Some(current) = inner.stored.as_ref() else {
            inner.failures.clear();
            return Ok(true);
        };

        let now = Instant::now();
        inner.failures.retain(|t| now.duration_since(*t) < LOCKOUT_WINDOW);
        if inner.failures.len() >= MAX_FAILED_ATTEMPTS {
            return Err(VpnError::conflict(
                "You have exceeded the allowed number of requests. Please wait 1 minute and try again.",
            ));
        }

        if current.matches(hash) {
            inner.failures.clear();
            return Ok(true);
        }
        if !path.exists() {
            log::warn!("EAA secret file is gone, disabling EAA");
            inner.stored = None;
            inner.failures.clear();
            return Ok(true);
        }
        inner.failures.push(now);
        Ok(false)
    }

    /// Enable, change or (with an empty `new_hash`) disable EAA.
    ///
    /// `old_hash` must match the current secret when EAA is enabled.
    pub fn set(&self, old_hash: &str, new_hash: &str) -> VpnResult<()> {
        if new_hash.trim() != new_hash {
            return Err(VpnError::bad_parameter("EAA password must not contain spaces"));
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !Self::check_locked(&self.path, &mut inner, old_hash)? {
            return Err(VpnError::AuthFailed);
        }

        if new_hash.is_empty() {
            remove_file_if_exists(&self.path)?;
            inner.stored = None;
            log::info!("EAA disabled");
            return Ok(());
        }

        let salt: [u8; 64] = rand::random();
        let next = Stored {
            derived: derive_secret(new_hash, &salt),
            salt: salt.to_vec(),
        };
        if let Err(e) = write_private_file(&self.path, next.encode().as_bytes()) {
            // Never leave an on-disk secret that disagrees with memory.
            inner.stored = None;
            let _ = remove_file_if_exists(&self.path);
            return Err(e.into());
        }
        inner.stored = Some(next);
        log::info!("EAA password set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_is_hex_sha256() {
        assert_eq!(
            password_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_disabled_accepts_anything() {
        let dir = tempfile::tempdir().unwrap();
        let eaa = Eaa::load(&dir.path().join("eaa"));
        assert!(!eaa.is_enabled());
        assert!(eaa.check("").unwrap());
    }

    #[test]
    fn test_enable_check_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eaa");
        let eaa = Eaa::load(&path);
        let hash = password_hash("hunter2");
        eaa.set("", &hash).unwrap();
        assert!(eaa.is_enabled());
        assert!(eaa.check(&hash).unwrap());
        assert!(!eaa.check(&password_hash("wrong")).unwrap());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains(&hash));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let reloaded = Eaa::load(&path);
        assert!(reloaded.is_enabled());
        assert!(reloaded.check(&hash).unwrap());
    }

    #[test]
    fn test_change_requires_old_password() {
        let dir = tempfile::tempdir().unwrap();
        let eaa = Eaa::load(&dir.path().join("eaa"));
        let first = password_hash("first");
        let second = password_hash("second");
        eaa.set("", &first).unwrap();

        let err = eaa.set(&password_hash("guess"), &second).unwrap_err();
        assert!(matches!(err, VpnError::AuthFailed));
        assert!(eaa.check(&first).unwrap());

        eaa.set(&first, &second).unwrap();
        assert!(eaa.check(&second).unwrap());
        assert!(!eaa.check(&first).unwrap());

        eaa.set(&second, "").unwrap();
        assert!(!eaa.is_enabled());
        assert!(!dir.path().join("eaa").exists());
    }

    #[test]
    fn test_deleted_file_disables_on_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eaa");
        let eaa = Eaa::load(&path);
        eaa.set("", &password_hash("pw")).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(eaa.check(&password_hash("other")).unwrap());
        assert!(!eaa.is_enabled());
    }

    #[test]
    fn test_lockout_after_repeated_failures() {
        let dir = tempfile::tempdir().unwrap();
        let eaa = Eaa::load(&dir.path().join("eaa"));
        let hash = password_hash("pw");
        eaa.set("", &hash).unwrap();

        for _ in 0..MAX_FAILED_ATTEMPTS {
            assert!(!eaa.check(&password_hash("nope")).unwrap());
        }
        let err = eaa.check(&hash).unwrap_err();
        assert!(err.to_string().contains("exceeded"), "{}", err);
    }

    #[test]
    fn test_password_with_spaces_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let eaa = Eaa::load(&dir.path().join("eaa"));
        assert!(eaa.set("", " padded ").is_err());
        assert!(!eaa.is_enabled());
    }
}
