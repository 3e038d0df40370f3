//! Client sessions: one per virtual IRC identity.
//!
//! A session resolves an identity, builds [`ConnectionOptions`], and asks the
//! [`ConnectionBroker`] for a remote connection id. Once connected, actions
//! such as [`ClientSession::join_channel`] become fire-and-forget commands on
//! the broker's channel.
//!
//! ## Connect workflow
//!
//! ```text
//! resolve names ─► allocate IPv6 (if prefix) ─► announce ─► build options ─► create_connection
//! ```
//!
//! Each step takes the previous step's output by value or reference and
//! returns a new value; collaborators never mutate the session's config.
//! The session itself keeps an allocated IPv6 address, so a retry after a
//! failed create reuses it. State only changes inside
//! [`ClientSession::connect`].

use std::fmt;
use std::net::Ipv6Addr;
use std::sync::Arc;

use serde::Serialize;
use tracing::Instrument;

use crate::broker::ConnectionBroker;
use crate::collab::{AddressAllocator, EventSink, IdentityResolver, IrcNames};
use crate::error::{RemoteError, Result};
use crate::server::IrcServer;

/// Label value used for a session without a connection id.
pub const NOT_CONNECTED: &str = "not-connected";

// ── Identity & config ──────────────────────────────────────────────────

/// The bridge-side user a session acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeUser {
    pub user_id: String,
    pub display_name: Option<String>,
}

impl BridgeUser {
    pub fn new(user_id: impl Into<String>, display_name: Option<&str>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.map(str::to_string),
        }
    }
}

/// Per-client settings chosen by the bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConfig {
    pub desired_nick: Option<String>,
    /// Overrides the server password when set.
    pub password: Option<String>,
    /// Source address, filled in by an [`AddressAllocator`].
    pub ipv6_address: Option<Ipv6Addr>,
}

/// Strip characters IRC does not allow in nicks (RFC 2812 §2.3.1) and make
/// sure the nick starts with a letter or special character.
pub fn valid_nick(nick: &str) -> String {
    fn allowed(c: char) -> bool {
        c.is_ascii_alphanumeric() || "[]^\\{}-`_|".contains(c)
    }
    fn allowed_first(c: char) -> bool {
        c.is_ascii_alphabetic() || "[]\\`_^{|}".contains(c)
    }

    let mut n: String = nick.chars().filter(|&c| allowed(c)).collect();
    if !n.chars().next().is_some_and(allowed_first) {
        // guest ids are often all digits
        n.insert(0, 'M');
    }
    n
}

// ── Connection options ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecureOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

/// Options sent to the remote service when opening a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    pub nick: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_address: Option<Ipv6Addr>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<SecureOptions>,
    pub self_signed: bool,
    pub cert_expired: bool,
    pub sasl: bool,
    /// `Some(6)` forces IPv6; `None` leaves the choice to the service.
    pub family: Option<u8>,
    pub auto_connect: bool,
    pub auto_rejoin: bool,
    pub flood_protection: bool,
    pub retry_count: u32,
    #[serde(rename = "bustRfc3484")]
    pub bust_rfc3484: bool,
}

impl ConnectionOptions {
    /// Options carrying only a nick; everything else at its default.
    pub fn for_nick(nick: impl Into<String>) -> Self {
        Self {
            nick: nick.into(),
            user_name: None,
            real_name: None,
            password: None,
            local_address: None,
            port: 6667,
            secure: None,
            self_signed: false,
            cert_expired: false,
            sasl: false,
            family: None,
            auto_connect: false,
            auto_rejoin: false,
            flood_protection: true,
            retry_count: 0,
            bust_rfc3484: true,
        }
    }

    /// Full options for `nick` on `server`.
    pub fn build(
        server: &IrcServer,
        nick: &str,
        names: &IrcNames,
        config: &ClientConfig,
        password: Option<&str>,
    ) -> Self {
        let has_prefix = server.ipv6_prefix.is_some();
        Self {
            user_name: Some(names.username.clone()),
            real_name: Some(names.realname.clone()),
            password: password.map(str::to_string),
            local_address: if has_prefix { config.ipv6_address } else { None },
            port: server.port,
            secure: server.tls.then(|| SecureOptions {
                ca: server.ca.clone(),
            }),
            self_signed: server.self_signed,
            cert_expired: server.allow_expired_certs,
            sasl: password.is_some() && server.sasl,
            family: server.wants_ipv6().then_some(6),
            ..Self::for_nick(nick)
        }
    }
}

// ── Commands ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelJoinRequest {
    pub channel: String,
    pub key: Option<String>,
}

/// Commands a session sends over the broker's channel. The serialized
/// variant body is the frame's `content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SessionCommand {
    JoinChannel(ChannelJoinRequest),
    PartChannel { channel: String, reason: Option<String> },
    Message { target: String, text: String },
}

impl SessionCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionCommand::JoinChannel(_) => "joinchannel",
            SessionCommand::PartChannel { .. } => "partchannel",
            SessionCommand::Message { .. } => "message",
        }
    }

    pub fn content(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

// ── Session ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectState {
    NotConnected,
    Connecting,
    Connected,
    Failed { reason: String },
}

/// Diagnostic identity of a session: `<nick@domain#id> (user)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLabel {
    pub nick: String,
    pub domain: String,
    pub connection_id: Option<String>,
    pub user_id: Option<String>,
}

impl fmt::Display for SessionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{}@{}#{}>",
            self.nick,
            self.domain,
            self.connection_id.as_deref().unwrap_or(NOT_CONNECTED)
        )?;
        if let Some(user_id) = &self.user_id {
            write!(f, " ({user_id})")?;
        }
        Ok(())
    }
}

/// The collaborators a session calls during `connect()`.
#[derive(Clone)]
pub struct SessionCollaborators {
    pub identity: Arc<dyn IdentityResolver>,
    pub addresses: Arc<dyn AddressAllocator>,
    pub events: Arc<dyn EventSink>,
}

pub struct ClientSession {
    broker: Arc<ConnectionBroker>,
    server: Arc<IrcServer>,
    collab: SessionCollaborators,
    config: ClientConfig,
    user: Option<BridgeUser>,
    nick: String,
    password: Option<String>,
    is_bot: bool,
    state: ConnectState,
    connection_id: Option<String>,
    channels: parking_lot::Mutex<Vec<String>>,
    last_action_ts: parking_lot::Mutex<chrono::DateTime<chrono::Utc>>,
}

impl ClientSession {
    pub fn new(
        broker: Arc<ConnectionBroker>,
        server: Arc<IrcServer>,
        config: ClientConfig,
        user: Option<BridgeUser>,
        is_bot: bool,
        collab: SessionCollaborators,
    ) -> Self {
        let user_id = user.as_ref().map(|u| u.user_id.as_str());
        let display = user.as_ref().and_then(|u| u.display_name.as_deref());
        let nick = match config.desired_nick.as_deref() {
            Some(desired) => valid_nick(desired),
            None => valid_nick(&server.nick_for(user_id, display)),
        };
        let password = config.password.clone().or_else(|| server.password.clone());

        Self {
            broker,
            server,
            collab,
            config,
            user,
            nick,
            password,
            is_bot,
            state: ConnectState::NotConnected,
            connection_id: None,
            channels: parking_lot::Mutex::new(Vec::new()),
            last_action_ts: parking_lot::Mutex::new(chrono::Utc::now()),
        }
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn server(&self) -> &Arc<IrcServer> {
        &self.server
    }

    pub fn user(&self) -> Option<&BridgeUser> {
        self.user.as_ref()
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_bot(&self) -> bool {
        self.is_bot
    }

    pub fn state(&self) -> &ConnectState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectState::Connected
    }

    /// Remote connection id, once `connect()` has succeeded.
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Channels joined through this session, in join order.
    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().clone()
    }

    pub fn last_action_ts(&self) -> chrono::DateTime<chrono::Utc> {
        *self.last_action_ts.lock()
    }

    pub fn label(&self) -> SessionLabel {
        SessionLabel {
            nick: self.nick.clone(),
            domain: self.server.domain.clone(),
            connection_id: self.connection_id.clone(),
            user_id: self.user.as_ref().map(|u| u.user_id.clone()),
        }
    }

    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "irc_session",
            nick = %self.nick,
            server = %self.server.domain,
            conn_id = self.connection_id.as_deref().unwrap_or(NOT_CONNECTED),
            user_id = self.user.as_ref().map(|u| u.user_id.as_str()).unwrap_or("-"),
        )
    }

    /// Run the connect workflow and return the remote connection id.
    ///
    /// A connected session returns its id without doing anything. On
    /// failure the session is `Failed`, keeps no id, and may be retried.
    pub async fn connect(&mut self) -> Result<String> {
        if let (ConnectState::Connected, Some(id)) = (&self.state, &self.connection_id) {
            return Ok(id.clone());
        }

        self.state = ConnectState::Connecting;
        let span = self.span();
        match self.run_connect().instrument(span).await {
            Ok(id) => {
                self.connection_id = Some(id.clone());
                self.state = ConnectState::Connected;
                self.touch();
                tracing::info!(session = %self.label(), "Connected");
                Ok(id)
            }
            Err(e) => {
                self.connection_id = None;
                self.state = ConnectState::Failed {
                    reason: e.to_string(),
                };
                tracing::warn!(session = %self.label(), error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    async fn run_connect(&mut self) -> Result<String> {
        let server = self.server.clone();
        let server = server.as_ref();

        // 1. names
        let lookup_config = ClientConfig {
            desired_nick: Some(self.nick.clone()),
            ..self.config.clone()
        };
        let names = self
            .collab
            .identity
            .resolve(&lookup_config, self.user.as_ref())
            .await
            .map_err(RemoteError::IdentityResolution)?;

        // 2. source address, kept so a retry reuses it
        if let Some(prefix) = server.ipv6_prefix.as_deref() {
            let allocated = self
                .collab
                .addresses
                .allocate(prefix, &self.config)
                .await
                .map_err(RemoteError::AddressAllocation)?;
            self.config.ipv6_address = allocated.ipv6_address;
        }
        let config = &self.config;

        // 3. status
        tracing::info!(
            domain = %server.domain,
            nick = %self.nick,
            user = %names.username,
            "Connecting to IRC server"
        );
        self.collab.events.notify(
            &self.label(),
            &format!(
                "Connecting to the IRC network '{}' as {}...",
                server.domain, self.nick
            ),
        );

        // 4. options
        let options = ConnectionOptions::build(server, &self.nick, &names, config, self.password.as_deref());

        // 5. connection
        self.broker.create_connection(server, &options).await
    }

    pub fn join_channel(&self, channel: &str, key: Option<&str>) -> Result<()> {
        self.send(SessionCommand::JoinChannel(ChannelJoinRequest {
            channel: channel.to_string(),
            key: key.map(str::to_string),
        }))?;
        let mut channels = self.channels.lock();
        if !channels.iter().any(|c| c.eq_ignore_ascii_case(channel)) {
            channels.push(channel.to_string());
        }
        Ok(())
    }

    pub fn part_channel(&self, channel: &str, reason: Option<&str>) -> Result<()> {
        self.send(SessionCommand::PartChannel {
            channel: channel.to_string(),
            reason: reason.map(str::to_string),
        })?;
        self.channels.lock().retain(|c| !c.eq_ignore_ascii_case(channel));
        Ok(())
    }

    pub fn send_message(&self, target: &str, text: &str) -> Result<()> {
        self.send(SessionCommand::Message {
            target: target.to_string(),
            text: text.to_string(),
        })
    }

    /// Send a command for this session's connection. Refused until the
    /// session is connected, so no frame is ever addressed to a sentinel.
    pub fn send(&self, command: SessionCommand) -> Result<()> {
        let Some(id) = self.connection_id.as_deref() else {
            return Err(RemoteError::NotConnected {
                nick: self.nick.clone(),
            });
        };
        let _enter = self.span().entered();
        self.broker.send_command(id, command.kind(), command.content()?)?;
        self.touch();
        Ok(())
    }

    fn touch(&self) {
        *self.last_action_ts.lock() = chrono::Utc::now();
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("label", &self.label().to_string())
            .field("state", &self.state)
            .field("is_bot", &self.is_bot)
            .finish()
    }
}
