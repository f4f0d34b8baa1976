//! OpenVPN management interface client.
//!
//! The daemon listens on loopback and OpenVPN connects to it
//! (`management-client`). Real-time messages have the form
//! `>SOURCE:payload`; everything else is a command reply.

use crate::error::{VpnError, VpnResult};
use crate::types::ConnectionState;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

/// How long the echoed secret may take to show up in OpenVPN's output.
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed `>STATE:` notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub state: ConnectionState,
    pub description: String,
    pub client_ip: Option<Ipv4Addr>,
    pub server_ip: Option<IpAddr>,
    pub is_auth_error: bool,
    pub additional_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MgmtEvent {
    State(StateUpdate),
    /// DNS server from the server's `PUSH_REPLY`.
    PushedDns(IpAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtCommand {
    /// `signal SIGTERM`: ask OpenVPN to shut down.
    Terminate,
}

/// Split `>SOURCE:payload`.
pub fn parse_message(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('>')?;
    let (source, payload) = rest.split_once(':')?;
    if source.is_empty() || !source.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return None;
    }
    Some((source, payload))
}

/// Parse the payload of `>STATE:<ts>,<state>,<desc>,<local ip>,<remote ip>,...`.
pub fn parse_state(payload: &str) -> Option<StateUpdate> {
    let params: Vec<&str> = payload.split(',').collect();
    if params.len() < 2 {
        log::error!("STATE format error: {}", payload);
        return None;
    }
    let state: ConnectionState = match params[1].parse() {
        Ok(s) => s,
        Err(_) => {
            log::error!("Unable to parse VPN state: {}", params[1]);
            return None;
        }
    };

    let mut update = StateUpdate {
        state,
        description: payload.to_string(),
        client_ip: None,
        server_ip: None,
        is_auth_error: false,
        additional_info: String::new(),
    };
    match state {
        ConnectionState::Connected => {
            update.client_ip = params.get(3).and_then(|s| s.trim().parse().ok());
            update.server_ip = params.get(4).and_then(|s| s.trim().parse().ok());
        }
        ConnectionState::Exiting => update.is_auth_error = payload.contains("auth-failure"),
        ConnectionState::Reconnecting => {
            if let Some(reason) = params.get(2).filter(|r| r.len() >= 3) {
                update.additional_info = reason.to_string();
            }
        }
        _ => {}
    }
    Some(update)
}

/// Extract the pushed options from a log line carrying
/// `... PUSH: Received control message: 'PUSH_REPLY,opt,opt,...'`.
pub fn parse_push_reply(text: &str) -> Option<Vec<String>> {
    if !text.contains("PUSH") {
        return None;
    }
    let start = text.find("'PUSH_REPLY")? + "'PUSH_REPLY".len();
    let end = text.rfind('\'')?;
    if end < start {
        return None;
    }
    let body = text[start..end].trim_start_matches([' ', ',']);
    Some(
        body.split(',')
            .map(|o| o.trim().to_lowercase())
            .filter(|o| !o.is_empty())
            .collect(),
    )
}

/// Last `dhcp-option dns <ip>` among pushed options.
pub fn pushed_dns(options: &[String]) -> Option<IpAddr> {
    options
        .iter()
        .filter_map(|o| o.strip_prefix("dhcp-option dns "))
        .filter_map(|ip| match ip.trim().parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                log::warn!("Unable to parse pushed DNS: {}", ip);
                None
            }
        })
        .last()
}

/// Escape a value for a quoted management argument.
pub fn escape_password(password: &str) -> String {
    password.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Credentials answered to `>PASSWORD:Need 'Auth' username/password`.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Listening side of the management channel.
pub struct ManagementInterface {
    listener: TcpListener,
    secret: String,
}

impl ManagementInterface {
    pub async fn bind() -> VpnResult<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let secret = format!("[VPND_SECRET_{}]", hex::encode_upper(rand::random::<[u8; 16]>()));
        Ok(Self { listener, secret })
    }

    pub fn local_addr(&self) -> VpnResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Text OpenVPN prints once our `echo` reached it.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Accept the single OpenVPN connection and serve it until it closes.
    pub async fn run(
        self,
        credentials: Credentials,
        verified: oneshot::Receiver<()>,
        events: mpsc::UnboundedSender<MgmtEvent>,
        commands: mpsc::UnboundedReceiver<MgmtCommand>,
    ) -> VpnResult<()> {
        let (stream, peer) = self.listener.accept().await?;
        // Nobody else may connect.
        drop(self.listener);
        log::info!("OpenVPN MI connected: {}", peer);
        let mut conn = Connection::new(stream);

        conn.send(&format!("echo {}", self.secret), true).await?;
        match tokio::time::timeout(VERIFY_TIMEOUT, verified).await {
            Ok(Ok(())) => log::info!("Connection verified"),
            _ => {
                log::error!("Connection NOT verified!");
                return Err(VpnError::Protocol("management connection not verified".into()));
            }
        }

        let result = conn.serve(&credentials, &events, commands).await;
        log::info!("OpenVPN MI disconnected: {}", peer);
        result
    }
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    /// Send only the first line of `command`.
    async fn send(&mut self, command: &str, loggable: bool) -> VpnResult<()> {
        let command = command.lines().next().unwrap_or_default();
        if loggable {
            log::info!("[->]: {}", command);
        }
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn serve(
        &mut self,
        credentials: &Credentials,
        events: &mpsc::UnboundedSender<MgmtEvent>,
        mut commands: mpsc::UnboundedReceiver<MgmtCommand>,
    ) -> VpnResult<()> {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(MgmtCommand::Terminate) => self.send("signal SIGTERM", true).await?,
                    None => return Ok(()),
                },
                line = self.lines.next_line() => match line? {
                    Some(line) => self.on_line(line.trim_end(), credentials, events).await?,
                    None => {
                        log::info!("Connection closed (EOF)");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn on_line(
        &mut self,
        line: &str,
        credentials: &Credentials,
        events: &mpsc::UnboundedSender<MgmtEvent>,
    ) -> VpnResult<()> {
        let Some((source, payload)) = parse_message(line) else {
            return Ok(());
        };
        if source != "PASSWORD" {
            log::debug!("[<-]: {}", line);
        }

        match source {
            "HOLD" => {
                for cmd in ["state on", "log on", "hold off", "hold release"] {
                    self.send(cmd, true).await?;
                }
            }
            "PASSWORD" => {
                if payload.starts_with("Verification Failed: 'Auth'") {
                    log::warn!("OpenVPN credentials rejected");
                } else if payload.contains("Need 'Auth' username/password") {
                    self.send(&format!("username \"Auth\" {}", credentials.username), false)
                        .await?;
                    self.send(
                        &format!("password \"Auth\" {}", escape_password(&credentials.password)),
                        false,
                    )
                    .await?;
                    log::info!("[->]: username \"Auth\" {}", credentials.username);
                    log::info!("[->]: password \"Auth\" ***");
                }
            }
            "STATE" => {
                if let Some(update) = parse_state(payload) {
                    log::info!("State changed: {}", update.state);
                    let _ = events.send(MgmtEvent::State(update));
                }
            }
            "LOG" => {
                if let Some(dns) = parse_push_reply(payload).as_deref().and_then(pushed_dns) {
                    log::info!("DNS pushed: {}", dns);
                    let _ = events.send(MgmtEvent::PushedDns(dns));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message() {
        assert_eq!(parse_message(">HOLD:Waiting for hold release:0"), Some(("HOLD", "Waiting for hold release:0")));
        assert_eq!(parse_message("SUCCESS: hold release succeeded"), None);
        assert_eq!(parse_message(">:x"), None);
    }

    #[test]
    fn test_parse_connected_state() {
        let s = parse_state("1700000000,CONNECTED,SUCCESS,10.34.0.6,185.253.97.12,1194,,").unwrap();
        assert_eq!(s.state, ConnectionState::Connected);
        assert_eq!(s.client_ip, Some(Ipv4Addr::new(10, 34, 0, 6)));
        assert_eq!(s.server_ip, Some("185.253.97.12".parse().unwrap()));
        assert!(!s.is_auth_error);
    }

    #[test]
    fn test_parse_exiting_and_reconnecting() {
        let s = parse_state("1700000000,EXITING,auth-failure,,").unwrap();
        assert!(s.is_auth_error);
        let s = parse_state("1700000000,RECONNECTING,tls-error,,").unwrap();
        assert_eq!(s.additional_info, "tls-error");
        let s = parse_state("1700000000,RECONNECTING,x,,").unwrap();
        assert!(s.additional_info.is_empty());
        let s = parse_state("1700000000,GET_CONFIG,,,").unwrap();
        assert_eq!(s.state, ConnectionState::GetConfig);
        assert!(parse_state("garbage").is_none());
    }

    #[test]
    fn test_push_reply_dns() {
        let line = "1700000000,,PUSH: Received control message: 'PUSH_REPLY,redirect-gateway def1,dhcp-option DNS 10.34.0.1,route-gateway 10.34.0.1,ifconfig 10.34.0.6 255.255.0.0'";
        let opts = parse_push_reply(line).unwrap();
        assert!(opts.contains(&"redirect-gateway def1".to_string()));
        assert_eq!(pushed_dns(&opts), Some("10.34.0.1".parse().unwrap()));
        assert!(parse_push_reply("1700000000,,Initialization Sequence Completed").is_none());
    }

    #[test]
    fn test_escape_password() {
        assert_eq!(escape_password(r#"a"b\c"#), r#"a\"b\\c"#);
    }

    #[tokio::test]
    async fn test_unverified_connection_is_dropped() {
        let mi = ManagementInterface::bind().await.unwrap();
        let addr = mi.local_addr().unwrap();
        let (_verified_tx, verified_rx) = oneshot::channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let server = tokio::spawn(mi.run(creds, verified_rx, events_tx, cmd_rx));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let echo = lines.next_line().await.unwrap().unwrap();
        assert!(echo.starts_with("echo [VPND_SECRET_"));

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, VpnError::Protocol(_)));
    }
}
