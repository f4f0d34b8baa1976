//! Daemon configuration file support.
//!
//! Configuration structure:
//! - top-level daemon settings (`log_level`, `state_dir`, `ipc_port`)
//! - `[binaries]` section with helper locations
//!
//! Every field has a default so an absent or empty file is valid.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

// ============================================================================
// Defaults
// ============================================================================

/// Default log filter when neither RUST_LOG nor the CLI sets one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default IPC port (0 = ephemeral, published via the connection-info file).
pub const DEFAULT_IPC_PORT: u16 = 0;

/// Name of the WireGuard interface on Linux (also the config file stem).
pub const WG_INTERFACE_NAME: &str = "wgivpn";

#[cfg(unix)]
fn default_state_dir() -> PathBuf {
    PathBuf::from("/etc/vpnd")
}

#[cfg(windows)]
fn default_state_dir() -> PathBuf {
    std::env::var_os("ProgramData")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("C:\\ProgramData"))
        .join("vpnd")
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_ipc_port() -> u16 {
    DEFAULT_IPC_PORT
}

// ============================================================================
// Configuration Structures
// ============================================================================

/// Locations of external helpers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BinaryPaths {
    pub wg: PathBuf,
    pub wg_quick: PathBuf,
    pub wireguard_go: PathBuf,
    pub wireguard_windows: PathBuf,
    pub openvpn: PathBuf,
    pub v2ray: PathBuf,
    pub dnscrypt_proxy: PathBuf,
    pub ip: PathBuf,
    pub nft: PathBuf,
    pub iptables_restore: PathBuf,
    pub ip6tables_restore: PathBuf,
    pub iptables: PathBuf,
    pub ip6tables: PathBuf,
    pub pfctl: PathBuf,
    pub route: PathBuf,
    pub netsh: PathBuf,
    pub resolvectl: PathBuf,
    pub networksetup: PathBuf,
    pub nmcli: PathBuf,
    pub ping: PathBuf,
    pub ipconfig: PathBuf,
    pub ifconfig: PathBuf,
    pub sc: PathBuf,
}

impl Default for BinaryPaths {
    fn default() -> Self {
        #[cfg(windows)]
        let (wg, wg_quick, openvpn, v2ray, dnscrypt) = (
            "C:\\Program Files\\vpnd\\WireGuard\\wg.exe",
            "",
            "C:\\Program Files\\vpnd\\OpenVPN\\openvpn.exe",
            "C:\\Program Files\\vpnd\\v2ray\\v2ray.exe",
            "C:\\Program Files\\vpnd\\dnscrypt-proxy\\dnscrypt-proxy.exe",
        );
        #[cfg(not(windows))]
        let (wg, wg_quick, openvpn, v2ray, dnscrypt) = (
            "wg",
            "wg-quick",
            "openvpn",
            "v2ray",
            "dnscrypt-proxy",
        );
        Self {
            wg: wg.into(),
            wg_quick: wg_quick.into(),
            wireguard_go: "wireguard-go".into(),
            wireguard_windows: "C:\\Program Files\\vpnd\\WireGuard\\wireguard.exe".into(),
            openvpn: openvpn.into(),
            v2ray: v2ray.into(),
            dnscrypt_proxy: dnscrypt.into(),
            ip: "/sbin/ip".into(),
            nft: "nft".into(),
            iptables_restore: "iptables-restore".into(),
            ip6tables_restore: "ip6tables-restore".into(),
            iptables: "iptables".into(),
            ip6tables: "ip6tables".into(),
            pfctl: "/sbin/pfctl".into(),
            route: "route".into(),
            netsh: "netsh".into(),
            resolvectl: "resolvectl".into(),
            networksetup: "/usr/sbin/networksetup".into(),
            nmcli: "nmcli".into(),
            ping: "ping".into(),
            ipconfig: "/usr/sbin/ipconfig".into(),
            ifconfig: "/sbin/ifconfig".into(),
            sc: "sc.exe".into(),
        }
    }
}

/// OpenVPN key material shipped with the daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenVpnFiles {
    pub ca: PathBuf,
    pub ta: PathBuf,
    /// Extra config lines; a line overrides the generated one with the same keyword.
    pub extra_parameters: String,
}

impl Default for OpenVpnFiles {
    fn default() -> Self {
        #[cfg(windows)]
        let dir = PathBuf::from("C:\\Program Files\\vpnd\\OpenVPN");
        #[cfg(not(windows))]
        let dir = PathBuf::from("/etc/vpnd/openvpn");
        Self {
            ca: dir.join("ca.crt"),
            ta: dir.join("ta.key"),
            extra_parameters: String::new(),
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Log filter used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory holding runtime state: connection info, preferences, journals.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Loopback port for the frontend IPC listener.
    #[serde(default = "default_ipc_port")]
    pub ipc_port: u16,
    #[serde(default)]
    pub binaries: BinaryPaths,
    #[serde(default)]
    pub openvpn: OpenVpnFiles,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            state_dir: default_state_dir(),
            ipc_port: default_ipc_port(),
            binaries: BinaryPaths::default(),
            openvpn: OpenVpnFiles::default(),
        }
    }
}

impl DaemonConfig {
    /// Validate values that serde cannot check.
    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            anyhow::bail!("state_dir must not be empty");
        }
        let level = self.log_level.to_ascii_lowercase();
        if !["off", "error", "warn", "info", "debug", "trace"].contains(&level.as_str()) {
            anyhow::bail!("Invalid log_level '{}'", self.log_level);
        }
        Ok(())
    }

    /// Resolve every relative or tilde path.
    pub fn resolved(mut self) -> Self {
        self.state_dir = expand_tilde(&self.state_dir);
        self.openvpn.ca = expand_tilde(&self.openvpn.ca);
        self.openvpn.ta = expand_tilde(&self.openvpn.ta);
        self
    }

    pub fn paths(&self) -> StatePaths {
        StatePaths::new(&self.state_dir)
    }
}

/// Well-known files inside the state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub dir: PathBuf,
}

impl StatePaths {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// `<port>:<secret-hex>` for frontends.
    pub fn connection_info(&self) -> PathBuf {
        self.dir.join("port.txt")
    }

    pub fn preferences(&self) -> PathBuf {
        self.dir.join("settings.json")
    }

    pub fn last_connection(&self) -> PathBuf {
        self.dir.join("last_connection")
    }

    pub fn eaa_secret(&self) -> PathBuf {
        self.dir.join("eaa")
    }

    pub fn dns_journal(&self) -> PathBuf {
        self.dir.join("dns_journal.json")
    }

    pub fn servers_cache(&self) -> PathBuf {
        self.dir.join("servers.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.dir.join("vpnd.lock")
    }

    pub fn wireguard_config(&self) -> PathBuf {
        self.dir.join(format!("{}.conf", WG_INTERFACE_NAME))
    }

    pub fn openvpn_config(&self) -> PathBuf {
        self.dir.join("openvpn.conf")
    }

    pub fn v2ray_config(&self) -> PathBuf {
        self.dir.join("v2ray.json")
    }

    pub fn dnscrypt_config(&self) -> PathBuf {
        self.dir.join("dnscrypt-proxy.toml")
    }
}

/// Write `data` to `path` readable and writable by the owner only.
///
/// Existing files are truncated and their mode tightened.
pub fn write_private_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(data)?;
    file.sync_all()
}

/// Remove a file, treating "not found" as success.
pub fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// ============================================================================
// Path Expansion
// ============================================================================

/// Expand tilde (~) in paths to the user's home directory.
///
/// - `~/...` expands to the user's home directory
/// - `~` alone expands to the home directory
/// - Other paths are returned unchanged
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    path.to_path_buf()
}

// ============================================================================
// Config Loading
// ============================================================================

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    #[cfg(windows)]
    {
        default_state_dir().join("vpnd.toml")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/etc/vpnd/vpnd.toml")
    }
}

/// Load configuration from an explicit path, or from the default location.
///
/// - `path`: Some(path) must exist and parse
/// - `path`: None loads the default file if present, otherwise defaults
pub fn load_daemon_config(path: Option<&Path>) -> Result<DaemonConfig> {
    let config = match path {
        Some(p) => load_config(&expand_tilde(p))?,
        None => {
            let default = default_config_path();
            if default.exists() {
                load_config(&default)?
            } else {
                log::debug!(
                    "No config file at {}, using defaults",
                    default.display()
                );
                DaemonConfig::default()
            }
        }
    };
    config.validate()?;
    Ok(config.resolved())
}

fn load_config(path: &Path) -> Result<DaemonConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(cfg.ipc_port, DEFAULT_IPC_PORT);
        assert_eq!(cfg.binaries.v2ray, BinaryPaths::default().v2ray);
    }

    #[test]
    fn test_partial_binaries_section() {
        let cfg: DaemonConfig = toml::from_str(
            r#"
            log_level = "debug"
            state_dir = "/var/lib/vpnd"

            [binaries]
            openvpn = "/opt/openvpn/sbin/openvpn"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.state_dir, PathBuf::from("/var/lib/vpnd"));
        assert_eq!(cfg.binaries.openvpn, PathBuf::from("/opt/openvpn/sbin/openvpn"));
        assert_eq!(cfg.binaries.wg, BinaryPaths::default().wg);
        assert_eq!(cfg.openvpn.ca, OpenVpnFiles::default().ca);
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let cfg = DaemonConfig {
            log_level: "loud".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ipc_port = 4242").unwrap();
        let cfg = load_daemon_config(Some(file.path())).unwrap();
        assert_eq!(cfg.ipc_port, 4242);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        assert!(load_daemon_config(Some(Path::new("/nonexistent/vpnd.toml"))).is_err());
    }

    #[test]
    fn test_state_paths() {
        let paths = StatePaths::new(Path::new("/etc/vpnd"));
        assert_eq!(paths.wireguard_config(), PathBuf::from("/etc/vpnd/wgivpn.conf"));
        assert_eq!(paths.connection_info(), PathBuf::from("/etc/vpnd/port.txt"));
    }

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
    }

    #[cfg(unix)]
    #[test]
    fn test_write_private_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("secret");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"old contents that are longer").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        write_private_file(&path, b"new").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        remove_file_if_exists(&path).unwrap();
        remove_file_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
