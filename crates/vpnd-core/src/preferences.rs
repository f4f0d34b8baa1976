//! Persisted daemon preferences, account session and last connection.

use crate::dns::DnsSettings;
use crate::error::{VpnError, VpnResult};
use crate::firewall::{parse_user_exceptions, FirewallState};
use crate::types::ConnectionRequest;
use crate::wifi::WifiPolicy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use vpnd_common::config::{remove_file_if_exists, write_private_file, StatePaths};

/// Default WireGuard key rotation interval, seconds.
pub const DEFAULT_WG_KEYS_INTERVAL: u64 = 24 * 60 * 60;

pub const PREF_ENABLE_LOGGING: &str = "enable_logging";
pub const PREF_AUTOCONNECT_ON_LAUNCH: &str = "autoconnect_on_launch";
pub const PREF_AUTOCONNECT_ON_LAUNCH_DAEMON: &str = "autoconnect_on_launch_daemon";

// ============================================================================
// Session
// ============================================================================

fn default_keys_interval() -> u64 {
    DEFAULT_WG_KEYS_INTERVAL
}

/// `WGLocalIP` is stored as text; an empty string means unset.
mod local_ip {
    use super::*;

    pub fn serialize<S: Serializer>(ip: &Option<Ipv4Addr>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ip.map(|ip| ip.to_string()).unwrap_or_default())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Ipv4Addr>, D::Error> {
        let text = String::deserialize(d)?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        text.parse().map(Some).map_err(serde::de::Error::custom)
    }
}

/// Account session and the VPN credentials issued for it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionData {
    #[serde(rename = "AccountID")]
    pub account_id: String,
    #[serde(rename = "Session", skip_serializing_if = "String::is_empty")]
    pub session: String,
    #[serde(rename = "OpenVPNUser", skip_serializing_if = "String::is_empty")]
    pub openvpn_user: String,
    #[serde(rename = "OpenVPNPass", skip_serializing_if = "String::is_empty")]
    pub openvpn_pass: String,
    #[serde(rename = "WGPublicKey")]
    pub wg_public_key: String,
    #[serde(rename = "WGPrivateKey", skip_serializing_if = "String::is_empty")]
    pub wg_private_key: String,
    #[serde(rename = "WGLocalIP", with = "local_ip")]
    pub wg_local_ip: Option<Ipv4Addr>,
    #[serde(rename = "WGPreSharedKey", skip_serializing_if = "String::is_empty")]
    pub wg_preshared_key: String,
    /// Unix seconds of the last key generation; 0 = never.
    #[serde(rename = "WGKeyGenerated")]
    pub wg_keys_generated: u64,
    #[serde(rename = "WGKeysRegenInerval", default = "default_keys_interval")]
    pub wg_keys_regen_interval: u64,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            session: String::new(),
            openvpn_user: String::new(),
            openvpn_pass: String::new(),
            wg_public_key: String::new(),
            wg_private_key: String::new(),
            wg_local_ip: None,
            wg_preshared_key: String::new(),
            wg_keys_generated: 0,
            wg_keys_regen_interval: DEFAULT_WG_KEYS_INTERVAL,
        }
    }
}

impl std::fmt::Debug for SessionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionData")
            .field("account_id", &self.account_id)
            .field("logged_in", &self.is_logged_in())
            .field("openvpn_user", &self.openvpn_user)
            .field("wg_public_key", &self.wg_public_key)
            .field("wg_local_ip", &self.wg_local_ip)
            .field("wg_keys_generated", &self.wg_keys_generated)
            .finish_non_exhaustive()
    }
}

/// Local WireGuard credentials, present only when complete.
#[derive(Clone, PartialEq, Eq)]
pub struct WgCredentials {
    pub private_key: String,
    pub preshared_key: Option<String>,
    pub local_ip: Ipv4Addr,
}

impl SessionData {
    pub fn is_logged_in(&self) -> bool {
        !self.session.is_empty()
    }

    pub fn wireguard_credentials(&self) -> Option<WgCredentials> {
        let local_ip = self.wg_local_ip?;
        if self.wg_private_key.is_empty() || self.wg_public_key.is_empty() {
            return None;
        }
        Some(WgCredentials {
            private_key: self.wg_private_key.clone(),
            preshared_key: (!self.wg_preshared_key.is_empty()).then(|| self.wg_preshared_key.clone()),
            local_ip,
        })
    }

    /// Fix up values written by older or hand-edited files.
    fn normalize(&mut self) {
        if self.wireguard_credentials().is_none() {
            self.wg_keys_generated = 0;
        }
        if self.wg_keys_regen_interval == 0 {
            self.wg_keys_regen_interval = DEFAULT_WG_KEYS_INTERVAL;
        }
        for field in [
            &mut self.account_id,
            &mut self.session,
            &mut self.openvpn_user,
            &mut self.openvpn_pass,
            &mut self.wg_public_key,
            &mut self.wg_private_key,
        ] {
            let trimmed = field.trim();
            if trimmed.len() != field.len() {
                *field = trimmed.to_string();
            }
        }
    }
}

// ============================================================================
// Preferences
// ============================================================================

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Preferences {
    /// Daemon version that wrote the file.
    pub version: String,
    pub is_logging: bool,
    pub is_fw_persistant: bool,
    #[serde(rename = "IsFwAllowLAN")]
    pub is_fw_allow_lan: bool,
    #[serde(rename = "IsFwAllowLANMulticast")]
    pub is_fw_allow_lan_multicast: bool,
    #[serde(default = "default_true")]
    pub is_fw_allow_api_servers: bool,
    /// Comma or space separated `ip[/prefix]` list.
    pub fw_user_exceptions: String,
    pub is_autoconnect_on_launch: bool,
    /// Autoconnect also without a frontend attached.
    pub is_autoconnect_on_launch_daemon: bool,
    pub is_split_tunnel: bool,
    pub split_tunnel_inversed: bool,
    pub split_tunnel_allow_when_no_vpn: bool,
    pub split_tunnel_apps: Vec<String>,
    pub custom_dns_cfg: DnsSettings,
    pub antitracker: bool,
    pub antitracker_hardcore: bool,
    pub session: SessionData,
    #[serde(rename = "WiFiControl")]
    pub wifi_control: WifiPolicy,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            version: String::new(),
            is_logging: false,
            is_fw_persistant: false,
            is_fw_allow_lan: false,
            is_fw_allow_lan_multicast: false,
            is_fw_allow_api_servers: true,
            fw_user_exceptions: String::new(),
            is_autoconnect_on_launch: false,
            is_autoconnect_on_launch_daemon: false,
            is_split_tunnel: false,
            split_tunnel_inversed: false,
            split_tunnel_allow_when_no_vpn: false,
            split_tunnel_apps: Vec::new(),
            custom_dns_cfg: DnsSettings::default(),
            antitracker: false,
            antitracker_hardcore: false,
            session: SessionData::default(),
            wifi_control: WifiPolicy::default(),
        }
    }
}

impl Preferences {
    /// Kill-switch settings to restore at start-up.
    pub fn firewall_state(&self) -> FirewallState {
        let user_exceptions = match parse_user_exceptions(&self.fw_user_exceptions) {
            Ok(nets) => nets,
            Err(e) => {
                log::warn!("Ignoring stored firewall exceptions: {}", e);
                Vec::new()
            }
        };
        FirewallState {
            enabled: self.is_fw_persistant,
            persistent: self.is_fw_persistant,
            allow_lan: self.is_fw_allow_lan,
            allow_lan_multicast: self.is_fw_allow_lan_multicast,
            allow_api_servers: self.is_fw_allow_api_servers,
            user_exceptions,
            ..Default::default()
        }
    }
}

fn parse_bool(value: &str) -> VpnResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(VpnError::bad_parameter("value")),
    }
}

// ============================================================================
// Store
// ============================================================================

/// Preferences file plus the last-connection snapshot, both `0600`.
pub struct PreferencesStore {
    path: PathBuf,
    last_connection: PathBuf,
    prefs: Mutex<Preferences>,
}

impl PreferencesStore {
    /// Load from the state directory; a missing file yields defaults.
    pub fn load(paths: &StatePaths) -> VpnResult<Self> {
        let path = paths.preferences();
        let prefs = Self::read(&path)?;
        Ok(Self {
            path,
            last_connection: paths.last_connection(),
            prefs: Mutex::new(prefs),
        })
    }

    fn read(path: &Path) -> VpnResult<Preferences> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No preferences at {}, using defaults", path.display());
                return Ok(Preferences::default());
            }
            Err(e) => return Err(VpnError::config_with_source("failed to read preferences file", e)),
        };
        let mut prefs: Preferences = serde_json::from_slice(&data)
            .map_err(|e| VpnError::config_with_source("failed to parse preferences file", e))?;
        prefs.session.normalize();
        Ok(prefs)
    }

    pub fn get(&self) -> Preferences {
        self.lock().clone()
    }

    pub fn session(&self) -> SessionData {
        self.lock().session.clone()
    }

    /// Change preferences and write them out. Nothing changes in memory
    /// when the write fails.
    pub fn update<F>(&self, f: F) -> VpnResult<Preferences>
    where
        F: FnOnce(&mut Preferences),
    {
        let mut prefs = self.lock();
        let mut next = prefs.clone();
        f(&mut next);
        next.version = env!("CARGO_PKG_VERSION").to_string();
        self.write(&next)?;
        *prefs = next;
        Ok(prefs.clone())
    }

    pub fn set_session(&self, mut session: SessionData) -> VpnResult<()> {
        session.normalize();
        if !session.is_logged_in() {
            log::info!("Session cleared");
        }
        self.update(|p| {
            // The rotation interval is a device setting, not part of the login.
            if session.wg_keys_regen_interval == DEFAULT_WG_KEYS_INTERVAL {
                session.wg_keys_regen_interval = p.session.wg_keys_regen_interval;
            }
            p.session = session;
        })
        .map(|_| ())
    }

    /// Generic `key = value` setter used by frontends.
    ///
    /// Unknown keys are logged and ignored.
    pub fn set_preference(&self, key: &str, value: &str) -> VpnResult<Preferences> {
        match key {
            PREF_ENABLE_LOGGING => {
                let on = parse_bool(value)?;
                self.update(|p| p.is_logging = on)
            }
            PREF_AUTOCONNECT_ON_LAUNCH => {
                let on = parse_bool(value)?;
                self.update(|p| p.is_autoconnect_on_launch = on)
            }
            PREF_AUTOCONNECT_ON_LAUNCH_DAEMON => {
                let on = parse_bool(value)?;
                self.update(|p| p.is_autoconnect_on_launch_daemon = on)
            }
            _ => {
                log::warn!("Unknown preference key '{}'", key);
                Ok(self.get())
            }
        }
    }

    pub fn save_last_connection(&self, req: &ConnectionRequest) -> VpnResult<()> {
        let data = serde_json::to_vec_pretty(req)
            .map_err(|e| VpnError::internal(format!("failed to serialize last connection: {}", e)))?;
        write_private_file(&self.last_connection, &data)
            .map_err(|e| VpnError::config_with_source("failed to save last connection", e))
    }

    pub fn load_last_connection(&self) -> VpnResult<Option<ConnectionRequest>> {
        let data = match std::fs::read(&self.last_connection) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VpnError::config_with_source("failed to read last connection", e)),
        };
        match serde_json::from_slice(&data) {
            Ok(req) => Ok(Some(req)),
            Err(e) => {
                log::warn!("Discarding unreadable last connection: {}", e);
                Ok(None)
            }
        }
    }

    pub fn clear_last_connection(&self) -> VpnResult<()> {
        remove_file_if_exists(&self.last_connection)?;
        Ok(())
    }

    fn write(&self, prefs: &Preferences) -> VpnResult<()> {
        let data = serde_json::to_vec_pretty(prefs)
            .map_err(|e| VpnError::internal(format!("failed to serialize preferences: {}", e)))?;
        write_private_file(&self.path, &data)
            .map_err(|e| VpnError::config_with_source("failed to save preferences file", e))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Preferences> {
        self.prefs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_session, wg_request};

    fn store() -> (tempfile::TempDir, PreferencesStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferencesStore::load(&StatePaths::new(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_defaults_when_missing() {
        let (_dir, store) = store();
        let prefs = store.get();
        assert!(prefs.is_fw_allow_api_servers);
        assert!(!prefs.session.is_logged_in());
        assert_eq!(prefs.session.wg_keys_regen_interval, DEFAULT_WG_KEYS_INTERVAL);
    }

    #[test]
    fn test_update_persists_with_private_mode() {
        let (dir, store) = store();
        store.update(|p| p.is_fw_allow_lan = true).unwrap();

        let reloaded = PreferencesStore::load(&StatePaths::new(dir.path())).unwrap();
        assert!(reloaded.get().is_fw_allow_lan);
        assert!(!reloaded.get().version.is_empty());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(StatePaths::new(dir.path()).preferences())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_session_json_keys() {
        let json = serde_json::to_value(test_session()).unwrap();
        assert_eq!(json["WGLocalIP"], "172.21.0.5");
        assert!(json.get("WGKeysRegenInerval").is_some());
        assert!(json.get("WGPreSharedKey").is_none());

        let parsed: SessionData =
            serde_json::from_str(r#"{"AccountID":"i-XXXX","Session":"s","WGLocalIP":""}"#).unwrap();
        assert_eq!(parsed.wg_local_ip, None);
        assert_eq!(parsed.wg_keys_regen_interval, DEFAULT_WG_KEYS_INTERVAL);
    }

    #[test]
    fn test_session_debug_redacts_secrets() {
        let session = test_session();
        let text = format!("{:?}", session);
        assert!(!text.contains(&session.wg_private_key));
        assert!(!text.contains(&session.openvpn_pass));
        assert!(!text.contains(&session.session));
    }

    #[test]
    fn test_wireguard_credentials() {
        let mut session = test_session();
        let creds = session.wireguard_credentials().unwrap();
        assert_eq!(creds.local_ip, Ipv4Addr::new(172, 21, 0, 5));
        assert_eq!(creds.preshared_key, None);

        session.wg_preshared_key = "psk".into();
        assert_eq!(session.wireguard_credentials().unwrap().preshared_key.as_deref(), Some("psk"));

        session.wg_local_ip = None;
        assert!(session.wireguard_credentials().is_none());
    }

    #[test]
    fn test_set_session_keeps_rotation_interval() {
        let (_dir, store) = store();
        store
            .update(|p| p.session.wg_keys_regen_interval = 7 * DEFAULT_WG_KEYS_INTERVAL)
            .unwrap();
        store.set_session(test_session()).unwrap();
        assert_eq!(store.session().wg_keys_regen_interval, 7 * DEFAULT_WG_KEYS_INTERVAL);
        assert!(store.session().is_logged_in());
    }

    #[test]
    fn test_set_preference() {
        let (_dir, store) = store();
        let prefs = store.set_preference(PREF_AUTOCONNECT_ON_LAUNCH, "true").unwrap();
        assert!(prefs.is_autoconnect_on_launch);
        assert!(store.set_preference(PREF_ENABLE_LOGGING, "maybe").is_err());
        // Unknown keys leave everything as is.
        assert_eq!(store.set_preference("no_such_key", "true").unwrap(), prefs);
    }

    #[test]
    fn test_last_connection_snapshot() {
        let (_dir, store) = store();
        assert!(store.load_last_connection().unwrap().is_none());

        let mut req = wg_request();
        req.mtu = 1380;
        req.ipv6 = true;
        store.save_last_connection(&req).unwrap();
        assert_eq!(store.load_last_connection().unwrap(), Some(req));

        store.clear_last_connection().unwrap();
        assert!(store.load_last_connection().unwrap().is_none());
    }

    #[test]
    fn test_firewall_state_from_preferences() {
        let (_dir, store) = store();
        let prefs = store
            .update(|p| {
                p.is_fw_persistant = true;
                p.fw_user_exceptions = "10.0.0.0/8, 192.168.5.1".into();
            })
            .unwrap();
        let fw = prefs.firewall_state();
        assert!(fw.enabled && fw.persistent);
        assert_eq!(fw.user_exceptions.len(), 2);
        assert!(fw.allow_api_servers);
    }
}
