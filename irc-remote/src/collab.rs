//! Contracts of the bridge-side collaborators a session depends on, plus
//! small implementations usable outside the full bridge.

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::session::{BridgeUser, ClientConfig, SessionLabel, valid_nick};

/// Username/real-name pair sent at IRC registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcNames {
    pub username: String,
    pub realname: String,
}

/// Resolves the ident username and real name for a session.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, config: &ClientConfig, user: Option<&BridgeUser>) -> Result<IrcNames>;
}

/// Allocates a source address for a session from a server's IPv6 prefix.
///
/// Returns a new configuration carrying the address; the input is left as is.
#[async_trait]
pub trait AddressAllocator: Send + Sync {
    async fn allocate(&self, prefix: &str, config: &ClientConfig) -> Result<ClientConfig>;
}

/// Receives status text about a session. Must not fail or block the caller.
pub trait EventSink: Send + Sync {
    fn notify(&self, session: &SessionLabel, text: &str);
}

/// Maximum ident length accepted by most IRC daemons.
const MAX_USERNAME_LEN: usize = 10;

/// Derives the username from the nick and the real name from the bridged
/// user (display name, else user id, else the nick).
#[derive(Debug, Default, Clone, Copy)]
pub struct NickIdentity;

#[async_trait]
impl IdentityResolver for NickIdentity {
    async fn resolve(&self, config: &ClientConfig, user: Option<&BridgeUser>) -> Result<IrcNames> {
        let nick = config
            .desired_nick
            .as_deref()
            .context("client config has no nick to derive a username from")?;
        let username: String = valid_nick(nick)
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(MAX_USERNAME_LEN)
            .collect::<String>()
            .to_lowercase();
        let username = if username.is_empty() {
            "user".to_string()
        } else {
            username
        };
        let realname = user
            .and_then(|u| u.display_name.clone().or_else(|| Some(u.user_id.clone())))
            .unwrap_or_else(|| nick.to_string());
        Ok(IrcNames { username, realname })
    }
}

/// Hands out `prefix + n` for an increasing counter `n`, starting at 1.
#[derive(Debug)]
pub struct SequentialIpv6Allocator {
    next: AtomicU64,
}

impl SequentialIpv6Allocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequentialIpv6Allocator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AddressAllocator for SequentialIpv6Allocator {
    async fn allocate(&self, prefix: &str, config: &ClientConfig) -> Result<ClientConfig> {
        if config.ipv6_address.is_some() {
            return Ok(config.clone());
        }
        let base: Ipv6Addr = prefix
            .split_once('/')
            .map_or(prefix, |(addr, _len)| addr)
            .parse()
            .with_context(|| format!("invalid IPv6 prefix {prefix:?}"))?;
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let addr = Ipv6Addr::from(u128::from(base) | u128::from(n));
        tracing::debug!(%prefix, %addr, "Allocated IPv6 address");
        Ok(ClientConfig {
            ipv6_address: Some(addr),
            ..config.clone()
        })
    }
}

/// Event sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn notify(&self, session: &SessionLabel, text: &str) {
        tracing::info!(session = %session, "{text}");
    }
}
