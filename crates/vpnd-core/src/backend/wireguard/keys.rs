//! WireGuard key generation and rotation.

use crate::error::{VpnError, VpnResult};
use crate::preferences::SessionData;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::Path;
use vpnd_common::{CommandRunner, ShellCommand};

/// A freshly generated key pair. The private key never leaves the daemon.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"***")
            .finish()
    }
}

/// Result of publishing a public key to the account service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub local_ip: Ipv4Addr,
    pub preshared_key: Option<String>,
}

/// Publishes new public keys for the logged-in session.
#[async_trait]
pub trait KeyRegistrar: Send + Sync {
    /// `previous` is the key being replaced, if any.
    async fn register(
        &self,
        session: &SessionData,
        public_key: &str,
        previous: Option<&str>,
    ) -> VpnResult<Registration>;
}

/// `wg genkey | wg pubkey`, without a shell.
pub async fn generate_keypair(runner: &dyn CommandRunner, wg: &Path) -> VpnResult<KeyPair> {
    let private = runner.exec(&ShellCommand::tool(wg).arg("genkey")).await?;
    let private_key = private.stdout.trim().to_string();
    let public = runner
        .exec(
            &ShellCommand::tool(wg)
                .arg("pubkey")
                .stdin(format!("{}\n", private_key))
                .hide(private_key.clone()),
        )
        .await?;
    let pair = KeyPair {
        public_key: public.stdout.trim().to_string(),
        private_key,
    };
    super::validate_key("privateKey", &pair.private_key)?;
    super::validate_key("publicKey", &pair.public_key)?;
    Ok(pair)
}

/// True when the keys are older than the rotation interval.
pub fn needs_rotation(session: &SessionData, now: u64) -> bool {
    if session.wg_public_key.is_empty() {
        return true;
    }
    let interval = session.wg_keys_regen_interval;
    interval > 0 && now.saturating_sub(session.wg_keys_generated) >= interval
}

/// Generate, register and store a new key pair in `session`.
pub async fn rotate_keys(
    runner: &dyn CommandRunner,
    wg: &Path,
    registrar: Option<&dyn KeyRegistrar>,
    session: &mut SessionData,
    now: u64,
) -> VpnResult<()> {
    if !session.is_logged_in() {
        return Err(VpnError::NotLoggedIn);
    }
    let registrar = registrar.ok_or_else(|| VpnError::not_available("account API"))?;
    let pair = generate_keypair(runner, wg).await?;
    let previous = (!session.wg_public_key.is_empty()).then_some(session.wg_public_key.as_str());
    let reg = registrar.register(session, &pair.public_key, previous).await?;

    log::info!("WireGuard keys updated (public key {})", pair.public_key);
    session.wg_public_key = pair.public_key;
    session.wg_private_key = pair.private_key;
    session.wg_local_ip = Some(reg.local_ip);
    session.wg_preshared_key = reg.preshared_key.unwrap_or_default();
    session.wg_keys_generated = now;
    Ok(())
}
