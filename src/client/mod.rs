// Copyright (C) 2024 the dvrip authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session lifecycle: connect, login, keep-alive, time sync, and the entry
//! points into live monitoring.

use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace};

use crate::conn::Connection;
use crate::error::ErrorInt;
use crate::proto::{self, sofia_hash, PacketHeader, RequestCode, StatusCode};
use crate::Error;

mod monitor;
mod parse;

pub use monitor::{Monitor, MonitorHandle, MonitorSpec};

/// Fallback keep-alive period when the device doesn't advertise one at
/// login. Real firmwares usually say 20 or 21 seconds.
const DEFAULT_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Transport underneath the packet framing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

impl Transport {
    fn default_port(self) -> u16 {
        match self {
            Transport::Tcp => proto::PORT_TCP,
            Transport::Udp => proto::PORT_UDP,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => f.pad("tcp"),
            Transport::Udp => f.pad("udp"),
        }
    }
}

impl std::str::FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "tcp" => Transport::Tcp,
            "udp" => Transport::Udp,
            _ => bail!(ErrorInt::ConfigInvalid(format!(
                "transport {s:?} not understood (expected \"tcp\" or \"udp\")"
            ))),
        })
    }
}

/// Immutable configuration for one session.
///
/// Built with consuming setters:
///
/// ```
/// use dvrip::client::Settings;
/// let settings = Settings::new("192.168.1.147").password("secret");
/// ```
#[derive(Clone)]
pub struct Settings {
    transport: Transport,
    address: String,
    username: String,
    password: String,
    password_hash: Option<String>,
    dial_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Settings {
    /// Creates settings for `address` (`host` or `host:port`) with defaults:
    /// TCP, user `admin`, empty password, one-minute timeouts.
    pub fn new(address: impl Into<String>) -> Self {
        Settings {
            transport: Transport::Tcp,
            address: address.into(),
            username: "admin".to_owned(),
            password: String::new(),
            password_hash: None,
            dial_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn transport(self, transport: Transport) -> Self {
        Self { transport, ..self }
    }

    pub fn username(self, username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..self
        }
    }

    pub fn password(self, password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            ..self
        }
    }

    /// Supplies a precomputed [`sofia_hash`] digest, so the plaintext never
    /// has to be held. Takes precedence over [`Settings::password`].
    pub fn password_hash(self, hash: impl Into<String>) -> Self {
        Self {
            password_hash: Some(hash.into()),
            ..self
        }
    }

    pub fn dial_timeout(self, dial_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            ..self
        }
    }

    pub fn read_timeout(self, read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            ..self
        }
    }

    pub fn write_timeout(self, write_timeout: Duration) -> Self {
        Self {
            write_timeout,
            ..self
        }
    }

    /// Validates and fills defaults: the address gains an explicit port and
    /// the password digest is always populated afterward.
    fn normalized(mut self) -> Result<Self, Error> {
        if self.address.is_empty() {
            bail!(ErrorInt::ConfigInvalid("address is empty".to_owned()));
        }
        if self.username.is_empty() {
            self.username = "admin".to_owned();
        }
        if self.password_hash.is_none() {
            self.password_hash = Some(sofia_hash(&self.password));
        }
        if !address_has_port(&self.address) {
            let port = self.transport.default_port();
            self.address = if !self.address.starts_with('[') && self.address.contains(':') {
                // Bare IPv6: bracket it so the port is unambiguous.
                format!("[{}]:{port}", self.address)
            } else {
                format!("{}:{port}", self.address)
            };
        }
        Ok(self)
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("transport", &self.transport)
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("dial_timeout", &self.dial_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

fn address_has_port(addr: &str) -> bool {
    match addr.rfind(']') {
        // Bracketed IPv6 literal.
        Some(end) => addr[end..].contains(':'),
        None => addr.bytes().filter(|&b| b == b':').count() == 1,
    }
}

/// One live connection to a device.
///
/// Exactly one task uses the session at a time; starting a monitor hands the
/// whole session to the media pump (see [`Session::monitor`]), which is what
/// keeps the protocol's single-reader requirement sound.
pub struct Session {
    conn: Connection,
    settings: Settings,
    session_id: u32,
    alive_interval: Duration,
    lost: bool,
}

impl Session {
    /// Dials the device. No protocol traffic happens until [`Session::login`].
    pub async fn connect(settings: Settings) -> Result<Self, Error> {
        let settings = settings.normalized()?;
        let conn = match settings.transport {
            Transport::Tcp => {
                Connection::connect_tcp(
                    &settings.address,
                    settings.dial_timeout,
                    settings.read_timeout,
                    settings.write_timeout,
                )
                .await?
            }
            Transport::Udp => {
                Connection::connect_udp(
                    &settings.address,
                    settings.dial_timeout,
                    settings.read_timeout,
                    settings.write_timeout,
                )
                .await?
            }
        };
        debug!("connected: {}", conn.ctx());
        Ok(Session {
            conn,
            settings,
            session_id: 0,
            alive_interval: DEFAULT_ALIVE_INTERVAL,
            lost: false,
        })
    }

    /// Session id assigned at login; zero beforehand.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Keep-alive period advertised by the device at login.
    pub fn alive_interval(&self) -> Duration {
        self.alive_interval
    }

    /// Authenticates with the configured credentials.
    ///
    /// Login is the one message that bypasses the JSON envelope: its body is
    /// the bare credentials object.
    pub async fn login(&mut self) -> Result<(), Error> {
        self.check_live()?;
        let hash = self
            .settings
            .password_hash
            .as_deref()
            .expect("normalized settings carry a password hash");
        let body = serde_json::to_vec(&parse::LoginRequest {
            encrypt_type: "MD5",
            login_type: "DVRIP-WEB",
            password: hash,
            username: &self.settings.username,
        })
        .expect("login body serialization is infallible");
        self.conn
            .send(RequestCode::LOGIN.0, self.session_id, body.into())
            .await?;
        let pkt = self.conn.recv().await?;
        let reply = parse::parse_reply(&pkt.body)?;
        self.check_status(reply.ret, true)?;
        let id = reply.session_id.as_deref().ok_or_else(|| {
            wrap!(ErrorInt::ProtocolError {
                description: "login reply carries no SessionID".to_owned(),
            })
        })?;
        self.session_id = parse::parse_session_id(id)?;
        match reply.alive_interval {
            Some(secs) if secs > 0.0 => {
                self.alive_interval = Duration::from_secs_f64(secs);
            }
            _ => debug!(
                "device advertised no AliveInterval; assuming {:?}",
                DEFAULT_ALIVE_INTERVAL
            ),
        }
        debug!(
            "logged in: session {} alive_interval {:?}",
            parse::session_id_hex(self.session_id),
            self.alive_interval
        );
        Ok(())
    }

    /// Sends one envelope command and awaits its reply, checking `Ret`.
    pub(crate) async fn command(
        &mut self,
        code: RequestCode,
        payload: serde_json::Value,
    ) -> Result<(PacketHeader, Bytes), Error> {
        self.check_live()?;
        let name = code.name().ok_or_else(|| {
            wrap!(ErrorInt::ProtocolError {
                description: format!("{code:?} has no envelope name"),
            })
        })?;
        let body = parse::envelope(name, self.session_id, &payload)?;
        self.conn
            .send(code.0, self.session_id, body.into())
            .await?;
        let pkt = self.conn.recv().await?;
        let reply = parse::parse_reply(&pkt.body)?;
        self.check_status(reply.ret, false)?;
        Ok((pkt.header, pkt.body))
    }

    /// Sends a single keep-alive and awaits the reply.
    ///
    /// Callers schedule this themselves (or use [`Session::run_keep_alive`]);
    /// during monitoring the pump takes over. Any failure marks the session
    /// lost: the device will drop a silent session, so there's no point
    /// continuing.
    pub async fn keep_alive(&mut self) -> Result<(), Error> {
        self.check_live()?;
        let body = parse::keep_alive_body(self.session_id);
        let session_id = self.session_id;
        let res = async {
            self.conn
                .send(RequestCode::KEEP_ALIVE.0, session_id, body.into())
                .await?;
            let pkt = self.conn.recv().await?;
            let reply = parse::parse_reply(&pkt.body)?;
            self.check_status(reply.ret, false)
        }
        .await;
        match res {
            Ok(()) => {
                trace!("keep-alive acknowledged");
                Ok(())
            }
            Err(e) => {
                self.lost = true;
                bail!(ErrorInt::SessionLost {
                    description: format!("keep-alive failed: {e}"),
                })
            }
        }
    }

    /// Re-arms [`Session::keep_alive`] every advertised interval until it
    /// fails, returning the terminal error. Race this against shutdown:
    ///
    /// ```no_run
    /// # async fn example(mut session: dvrip::client::Session) {
    /// # let shutdown = std::future::pending::<()>();
    /// tokio::select! {
    ///     e = session.run_keep_alive() => log::warn!("session lost: {e}"),
    ///     _ = shutdown => {}
    /// }
    /// # }
    /// ```
    pub async fn run_keep_alive(&mut self) -> Error {
        loop {
            tokio::time::sleep(self.alive_interval).await;
            if let Err(e) = self.keep_alive().await {
                return e;
            }
        }
    }

    /// Sets the device clock. The device interprets the bare timestamp in
    /// its own configured zone; pass whichever wall time matches.
    pub async fn set_time(&mut self, time: chrono::NaiveDateTime) -> Result<(), Error> {
        let value = serde_json::Value::String(time.format("%Y-%m-%d %H:%M:%S").to_string());
        self.command(RequestCode::OP_TIME_SETTING, value).await?;
        Ok(())
    }

    /// Sets the device clock to the current UTC time.
    pub async fn sync_time(&mut self) -> Result<(), Error> {
        self.set_time(chrono::Utc::now().naive_utc()).await
    }

    /// Shuts the transport down. Dropping the session has the same effect;
    /// this variant lets the device observe a clean close first.
    pub async fn close(mut self) {
        self.conn.shutdown().await;
    }

    fn check_live(&self) -> Result<(), Error> {
        if self.lost {
            bail!(ErrorInt::SessionLost {
                description: "a previous keep-alive failed".to_owned(),
            });
        }
        Ok(())
    }

    fn check_status(&self, ret: i64, login: bool) -> Result<(), Error> {
        match StatusCode::from_ret(ret) {
            Some(StatusCode::Ok) => Ok(()),
            Some(StatusCode::UpgradeSuccessful) if login => Ok(()),
            Some(status) if status.is_credential_failure() => {
                bail!(ErrorInt::AuthRejected { status })
            }
            Some(status) => bail!(ErrorInt::RemoteStatus {
                status: ret,
                message: status.message().to_owned(),
            }),
            None => bail!(ErrorInt::RemoteStatus {
                status: ret,
                message: "unrecognized status code".to_owned(),
            }),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conn", self.conn.ctx())
            .field("session_id", &parse::session_id_hex(self.session_id))
            .field("alive_interval", &self.alive_interval)
            .field("lost", &self.lost)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports() {
        let s = Settings::new("192.168.1.147").normalized().unwrap();
        assert_eq!(s.address, "192.168.1.147:34567");
        let s = Settings::new("cam.local")
            .transport(Transport::Udp)
            .normalized()
            .unwrap();
        assert_eq!(s.address, "cam.local:34568");
    }

    #[test]
    fn explicit_port_kept() {
        let s = Settings::new("192.168.1.147:4000").normalized().unwrap();
        assert_eq!(s.address, "192.168.1.147:4000");
    }

    #[test]
    fn ipv6_addresses() {
        let s = Settings::new("[fe80::1]:4000").normalized().unwrap();
        assert_eq!(s.address, "[fe80::1]:4000");
        let s = Settings::new("[fe80::1]").normalized().unwrap();
        assert_eq!(s.address, "[fe80::1]:34567");
        let s = Settings::new("fe80::1").normalized().unwrap();
        assert_eq!(s.address, "[fe80::1]:34567");
    }

    #[test]
    fn hash_population() {
        let s = Settings::new("h").normalized().unwrap();
        assert_eq!(s.password_hash.as_deref(), Some("tlJwpbo6"));
        let s = Settings::new("h")
            .password("ignored")
            .password_hash("AAAABBBB")
            .normalized()
            .unwrap();
        assert_eq!(s.password_hash.as_deref(), Some("AAAABBBB"));
    }

    #[test]
    fn empty_username_defaults_to_admin() {
        let s = Settings::new("h").username("").normalized().unwrap();
        assert_eq!(s.username, "admin");
    }

    #[test]
    fn empty_address_rejected() {
        assert!(Settings::new("").normalized().is_err());
    }

    #[test]
    fn transport_from_str() {
        assert_eq!("tcp".parse::<Transport>().unwrap(), Transport::Tcp);
        assert_eq!("udp".parse::<Transport>().unwrap(), Transport::Udp);
        assert!("sctp".parse::<Transport>().is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let s = Settings::new("h").password("hunter2");
        let out = format!("{s:?}");
        assert!(!out.contains("hunter2"), "{out}");
    }
}
