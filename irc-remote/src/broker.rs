//! Connection broker: the single owner of remote-connection bookkeeping.
//!
//! # Lifecycle
//!
//! ```text
//! Unprimed ──prime()──► Priming ──all snapshots + channel ok──► Ready
//!                          └──────────any failure──────────► Failed
//! Failed ──prime()──► Priming ...
//! ```
//!
//! Only a `Ready` broker creates connections or sends commands. Snapshots
//! are held locally until the channel is open and are published together
//! with the `Ready` transition, so callers never see a partial snapshot.
//!
//! # Dedup
//!
//! `create_connection` is keyed by nick. A cache hit returns the cached id
//! without asking the service whether the connection is still alive; the
//! id stays trusted until the next prime. Misses for the same nick are
//! serialized on a per-nick lock and the winner writes the new id through
//! to the cache, so concurrent callers share one remote connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::api::RemoteApi;
use crate::cache::{ConnectionRecord, ConnectionStateCache};
use crate::channel::{CommandFrame, InboundHandler, LogHandler, RemoteChannel};
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::server::IrcServer;
use crate::session::ConnectionOptions;

/// One server's snapshot: domain and its connection records.
type Snapshot = (String, Vec<ConnectionRecord>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Unprimed,
    Priming,
    Ready,
    Failed,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BrokerState::Unprimed => "unprimed",
            BrokerState::Priming => "priming",
            BrokerState::Ready => "ready",
            BrokerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub struct ConnectionBroker {
    api: RemoteApi,
    handler: Arc<dyn InboundHandler>,
    state: Mutex<BrokerState>,
    cache: RwLock<ConnectionStateCache>,
    channel: RwLock<Option<Arc<RemoteChannel>>>,
    /// nick → lock held while a create request for that nick is in flight.
    pending: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionBroker {
    /// Broker whose inbound channel traffic is only logged.
    pub fn new(config: RemoteConfig) -> Result<Self> {
        Self::with_handler(config, Arc::new(LogHandler))
    }

    pub fn with_handler(config: RemoteConfig, handler: Arc<dyn InboundHandler>) -> Result<Self> {
        Ok(Self {
            api: RemoteApi::new(config)?,
            handler,
            state: Mutex::new(BrokerState::Unprimed),
            cache: RwLock::new(ConnectionStateCache::new()),
            channel: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn state(&self) -> BrokerState {
        *self.state.lock()
    }

    /// Load connection state for every server, then open the channel.
    ///
    /// Snapshot fetches run concurrently; the cache is only written once
    /// all of them succeeded, and the channel is only opened after that.
    pub async fn prime(&self, servers: &[Arc<IrcServer>]) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                BrokerState::Ready => return Err(RemoteError::AlreadyPrimed),
                BrokerState::Priming => return Err(RemoteError::NotReady(BrokerState::Priming)),
                BrokerState::Unprimed | BrokerState::Failed => *state = BrokerState::Priming,
            }
        }

        match self.prime_inner(servers).await {
            Ok((snapshots, channel)) => {
                // publish everything in one step; readers never see a half-primed cache
                let mut state = self.state.lock();
                self.cache.write().prime_all(snapshots);
                *self.channel.write() = Some(Arc::new(channel));
                *state = BrokerState::Ready;
                tracing::info!(servers = servers.len(), "Remote connection broker ready");
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = BrokerState::Failed;
                tracing::error!(error = %e, "Cannot continue setting up remote connection broker");
                Err(e)
            }
        }
    }

    /// Fetch every snapshot, then open the channel. Nothing is published here.
    async fn prime_inner(&self, servers: &[Arc<IrcServer>]) -> Result<(Vec<Snapshot>, RemoteChannel)> {
        let fetches = servers.iter().map(|server| async move {
            let domain = server.domain.clone();
            match self.api.connection_state(&domain).await {
                Ok(records) => {
                    tracing::info!(%domain, connections = records.len(), "Got connection state");
                    Ok((domain, records))
                }
                Err(source) => {
                    tracing::error!(%domain, error = %source, "Failed to fetch connection state");
                    Err(RemoteError::SnapshotFetch { domain, source })
                }
            }
        });
        let snapshots = futures::future::try_join_all(fetches).await?;

        let channel = RemoteChannel::open(self.api.config(), self.handler.clone()).await?;
        Ok((snapshots, channel))
    }

    /// Return the connection id for `options.nick`, opening a new remote
    /// connection only when none is known.
    pub async fn create_connection(&self, server: &IrcServer, options: &ConnectionOptions) -> Result<String> {
        self.ensure_ready()?;
        let nick = options.nick.as_str();

        if let Some(id) = self.lookup(nick) {
            tracing::debug!(%nick, %id, "Reusing known connection");
            return Ok(id);
        }

        let slot = self
            .pending
            .lock()
            .entry(nick.to_string())
            .or_default()
            .clone();
        let result = {
            let _guard = slot.lock().await;
            // another caller may have finished while we waited
            match self.lookup(nick) {
                Some(id) => Ok(id),
                None => self.open_connection(server, options).await,
            }
        };

        let mut pending = self.pending.lock();
        // one reference in the map, one here
        if Arc::strong_count(&slot) <= 2 {
            pending.remove(nick);
        }
        result
    }

    async fn open_connection(&self, server: &IrcServer, options: &ConnectionOptions) -> Result<String> {
        let domain = server.domain.as_str();
        let nick = options.nick.as_str();
        tracing::info!(%domain, %nick, "Creating new connection");

        let id = self
            .api
            .open_connection(domain, options)
            .await
            .map_err(|source| RemoteError::ConnectionCreate {
                domain: domain.to_string(),
                nick: nick.to_string(),
                source,
            })?;

        tracing::info!(%domain, %nick, %id, "New connection opened");
        self.cache
            .write()
            .record(domain, ConnectionRecord::new(id.clone(), nick));
        Ok(id)
    }

    /// Queue a command for the remote connection `client_id`.
    pub fn send_command(&self, client_id: &str, kind: &str, content: serde_json::Value) -> Result<()> {
        let channel = self.channel.read().clone();
        let Some(channel) = channel else {
            return match self.state() {
                // primed, then closed
                BrokerState::Ready => Err(RemoteError::ChannelClosed),
                other => Err(RemoteError::NotReady(other)),
            };
        };
        tracing::debug!(%client_id, %kind, "Sending command");
        channel.send(&CommandFrame::new(client_id, kind, content))
    }

    /// Flush queued commands and close the channel. Later commands fail
    /// with `ChannelClosed`; the cache stays readable.
    pub async fn close(&self) {
        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    /// Connection id currently cached for `nick`. Empty until primed.
    pub fn lookup(&self, nick: &str) -> Option<String> {
        self.cache.read().lookup(nick).map(str::to_string)
    }

    /// Records cached for one server, sorted by nick.
    pub fn connections(&self, domain: &str) -> Vec<ConnectionRecord> {
        let cache = self.cache.read();
        let mut records: Vec<ConnectionRecord> = cache
            .connections(domain)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.nick.cmp(&b.nick));
        records
    }

    /// Whether the command channel is still connected.
    pub fn channel_open(&self) -> bool {
        self.channel.read().as_ref().is_some_and(|c| c.is_open())
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            BrokerState::Ready => Ok(()),
            other => Err(RemoteError::NotReady(other)),
        }
    }
}
