//! OpenVPN client configuration.

use crate::error::{VpnError, VpnResult};
use crate::preferences::SessionData;
use crate::types::{ConnectionRequest, ProxyKind, ProxySpec, Transport};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use vpnd_common::config::{write_private_file, OpenVpnFiles};

/// Connection parameters of one OpenVPN session.
#[derive(Clone, PartialEq, Eq)]
pub struct OpenVpnParams {
    pub username: String,
    pub password: String,
    pub transport: Transport,
    pub host_ip: IpAddr,
    pub host_port: u16,
    pub exit_hostname: String,
    pub proxy: Option<ProxySpec>,
}

impl std::fmt::Debug for OpenVpnParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenVpnParams")
            .field("username", &self.username)
            .field("transport", &self.transport)
            .field("host_ip", &self.host_ip)
            .field("host_port", &self.host_port)
            .field("exit_hostname", &self.exit_hostname)
            .finish_non_exhaustive()
    }
}

impl OpenVpnParams {
    pub fn from_request(req: &ConnectionRequest, session: &SessionData) -> VpnResult<Self> {
        if session.openvpn_user.is_empty() || session.openvpn_pass.is_empty() {
            return Err(VpnError::config("OpenVPN user credentials not defined"));
        }
        // The entry server forwards to the exit named in the username.
        let username = match &req.exit {
            Some(exit) => format!("{}@{}", exit.gateway_id, session.openvpn_user),
            None => session.openvpn_user.clone(),
        };
        Ok(Self {
            username,
            password: session.openvpn_pass.clone(),
            transport: req.entry.transport,
            host_ip: req.entry.ip,
            host_port: req.dial_port(),
            exit_hostname: req.exit_hostname(),
            proxy: req.proxy.clone(),
        })
    }

    /// Address the OpenVPN process opens its socket to.
    pub fn destination_ip(&self) -> IpAddr {
        match &self.proxy {
            Some(proxy) => proxy.address,
            None => self.host_ip,
        }
    }
}

/// Files and endpoints the generated configuration refers to.
#[derive(Debug, Clone)]
pub struct ConfigInputs<'a> {
    pub management: SocketAddr,
    pub files: &'a OpenVpnFiles,
    /// Credentials file for the proxy, written next to the config.
    pub proxy_auth_file: Option<PathBuf>,
    /// Current default gateway; required with a proxy.
    pub gateway: Option<IpAddr>,
}

/// Build the configuration lines, user overrides applied.
pub fn generate(params: &OpenVpnParams, inputs: &ConfigInputs<'_>) -> VpnResult<Vec<String>> {
    if params.host_ip.is_unspecified() {
        return Err(VpnError::bad_parameter("host"));
    }
    if params.host_port == 0 {
        return Err(VpnError::bad_parameter("port"));
    }

    let mut cfg: Vec<String> = [
        "client".to_string(),
        format!("management {} {}", inputs.management.ip(), inputs.management.port()),
        "management-client".into(),
        "management-hold".into(),
        "auth-user-pass".into(),
        "auth-nocache".into(),
        "management-query-passwords".into(),
        "management-signal".into(),
        "hand-window 6".into(),
        "keepalive 8 30".into(),
        "connect-retry 2 6".into(),
    ]
    .into();

    if let Some(proxy) = &params.proxy {
        let auth = inputs
            .proxy_auth_file
            .as_ref()
            .map(|p| format!(" \"{}\"", p.display()))
            .unwrap_or_default();
        let kind = match proxy.kind {
            ProxyKind::Http => "http",
            ProxyKind::Socks => "socks",
        };
        cfg.push(format!("{}-proxy-retry", kind));
        cfg.push(format!("{}-proxy {} {}{}", kind, proxy.address, proxy.port, auth));
    }

    cfg.push("dev tun".into());
    cfg.push(match params.transport {
        Transport::Tcp => "proto tcp-client".into(),
        Transport::Udp => "proto udp".into(),
    });
    cfg.push(format!("remote {} {}", params.host_ip, params.host_port));
    cfg.push("resolv-retry infinite".into());
    cfg.push("nobind".into());
    cfg.push("persist-key".into());

    if !inputs.files.ca.exists() {
        return Err(VpnError::config(format!("CA certificate not found: {}", inputs.files.ca.display())));
    }
    cfg.push(format!("ca \"{}\"", inputs.files.ca.display()));
    if !inputs.files.ta.exists() {
        return Err(VpnError::config(format!("TLS auth key not found: {}", inputs.files.ta.display())));
    }
    cfg.push(format!("tls-auth \"{}\" 1", inputs.files.ta.display()));

    cfg.push("cipher AES-256-CBC".into());
    cfg.push("remote-cert-tls server".into());
    cfg.push("verb 4".into());
    cfg.push("script-security 2".into());

    // Keep the proxy (or, for a local proxy, the server) off the tunnel.
    if let Some(proxy) = &params.proxy {
        let gateway = inputs
            .gateway
            .ok_or_else(|| VpnError::internal("default gateway unknown; cannot route proxy traffic"))?;
        let target = if proxy.address.is_loopback() { params.host_ip } else { proxy.address };
        if let IpAddr::V4(target) = target {
            cfg.push(format!("route {} 255.255.255.255 {}", target, gateway));
        }
    }

    apply_user_parameters(cfg, &inputs.files.extra_parameters)
}

/// Merge user-provided lines: a user line replaces every generated line
/// with the same keyword; new keywords are appended.
pub fn apply_user_parameters(mut cfg: Vec<String>, user: &str) -> VpnResult<Vec<String>> {
    for line in user.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let keyword = line.split_whitespace().next().unwrap_or_default().to_lowercase();
        if matches!(keyword.as_str(), "management" | "management-client" | "up" | "down" | "script-security") {
            return Err(VpnError::bad_parameter("openvpn.extra_parameters"));
        }
        cfg.retain(|l| l.split_whitespace().next().map(str::to_lowercase).as_deref() != Some(keyword.as_str()));
        cfg.push(line.to_string());
    }
    Ok(cfg)
}

/// Write `username\npassword` for `--<kind>-proxy ... <authfile>`.
pub fn write_proxy_auth(proxy: &ProxySpec, path: &Path) -> VpnResult<bool> {
    if proxy.username.is_empty() || proxy.password.is_empty() {
        return Ok(false);
    }
    let data = format!("{}\n{}", proxy.username, proxy.password);
    write_private_file(path, data.as_bytes())
        .map_err(|e| VpnError::config_with_source("failed to save file with proxy credentials", e))?;
    Ok(true)
}

pub fn write_config(lines: &[String], path: &Path) -> VpnResult<()> {
    let text = lines.join("\n");
    write_private_file(path, text.as_bytes())
        .map_err(|e| VpnError::config_with_source("failed to save OpenVPN configuration", e))?;
    log::info!("Configuring OpenVPN...\n=====================\n{}\n=====================", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ovpn_request, test_session};
    use crate::types::ExitHost;

    struct Files {
        _dir: tempfile::TempDir,
        files: OpenVpnFiles,
    }

    fn files() -> Files {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("ca.crt");
        let ta = dir.path().join("ta.key");
        std::fs::write(&ca, "ca").unwrap();
        std::fs::write(&ta, "ta").unwrap();
        Files {
            files: OpenVpnFiles {
                ca,
                ta,
                extra_parameters: String::new(),
            },
            _dir: dir,
        }
    }

    fn inputs(files: &OpenVpnFiles) -> ConfigInputs<'_> {
        ConfigInputs {
            management: "127.0.0.1:40001".parse().unwrap(),
            files,
            proxy_auth_file: None,
            gateway: Some("192.168.1.1".parse().unwrap()),
        }
    }

    #[test]
    fn test_generate_udp() {
        let f = files();
        let params = OpenVpnParams::from_request(&ovpn_request(), &test_session()).unwrap();
        let cfg = generate(&params, &inputs(&f.files)).unwrap();
        assert_eq!(cfg[0], "client");
        assert!(cfg.contains(&"management 127.0.0.1 40001".to_string()));
        assert!(cfg.contains(&"proto udp".to_string()));
        assert!(cfg.contains(&"remote 185.253.97.12 2049".to_string()));
        assert!(cfg.iter().any(|l| l.starts_with("tls-auth ") && l.ends_with(" 1")));
        assert!(!cfg.iter().any(|l| l.contains("proxy")));
    }

    #[test]
    fn test_multihop_username_and_port() {
        let mut req = ovpn_request();
        req.exit = Some(ExitHost {
            hostname: "nl4.gw.example.net".into(),
            gateway_id: "nl4".into(),
            multihop_port: 23001,
            public_key: None,
        });
        let params = OpenVpnParams::from_request(&req, &test_session()).unwrap();
        assert_eq!(params.username, format!("nl4@{}", test_session().openvpn_user));
        assert_eq!(params.host_port, 23001);
        assert_eq!(params.exit_hostname, "nl4.gw.example.net");
    }

    #[test]
    fn test_local_proxy_routes_server() {
        let f = files();
        let mut req = ovpn_request();
        req.entry.transport = Transport::Tcp;
        req.proxy = Some(ProxySpec {
            kind: ProxyKind::Socks,
            address: "127.0.0.1".parse().unwrap(),
            port: 1080,
            username: String::new(),
            password: String::new(),
        });
        let params = OpenVpnParams::from_request(&req, &test_session()).unwrap();
        let cfg = generate(&params, &inputs(&f.files)).unwrap();
        assert!(cfg.contains(&"socks-proxy-retry".to_string()));
        assert!(cfg.contains(&"socks-proxy 127.0.0.1 1080".to_string()));
        assert!(cfg.contains(&"proto tcp-client".to_string()));
        assert!(cfg.contains(&"route 185.253.97.12 255.255.255.255 192.168.1.1".to_string()));
        assert_eq!(params.destination_ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_user_parameters_override() {
        let cfg = vec!["verb 4".to_string(), "cipher AES-256-CBC".into()];
        let cfg = apply_user_parameters(cfg, "# comment\nverb 3\nmssfix 1300\n").unwrap();
        assert_eq!(cfg, vec!["cipher AES-256-CBC", "verb 3", "mssfix 1300"]);
        assert!(apply_user_parameters(Vec::new(), "up /tmp/evil.sh").is_err());
    }

    #[test]
    fn test_missing_ca() {
        let f = files();
        std::fs::remove_file(&f.files.ca).unwrap();
        let params = OpenVpnParams::from_request(&ovpn_request(), &test_session()).unwrap();
        let err = generate(&params, &inputs(&f.files)).unwrap_err();
        assert!(err.to_string().contains("CA certificate not found"));
    }

    #[test]
    fn test_missing_credentials() {
        let mut session = test_session();
        session.openvpn_pass.clear();
        assert!(OpenVpnParams::from_request(&ovpn_request(), &session).is_err());
    }
}
