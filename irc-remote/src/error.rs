//! Error type shared by the broker, channel and sessions.

/// Errors surfaced by the remote connection layer.
///
/// `SnapshotFetch` and `ChannelOpen` are fatal to [`prime`]; the
/// session-scoped variants (`IdentityResolution`, `AddressAllocation`,
/// `ConnectionCreate`) only fail the `connect()` call that hit them.
///
/// [`prime`]: crate::broker::ConnectionBroker::prime
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("failed to fetch connection state for {domain}: {source}")]
    SnapshotFetch {
        domain: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to open remote channel: {0}")]
    ChannelOpen(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("failed to open connection for {nick} on {domain}: {source}")]
    ConnectionCreate {
        domain: String,
        nick: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("identity resolution failed: {0:#}")]
    IdentityResolution(anyhow::Error),

    #[error("address allocation failed: {0:#}")]
    AddressAllocation(anyhow::Error),

    #[error("connection broker is not ready (state: {0})")]
    NotReady(crate::broker::BrokerState),

    #[error("connection broker is already primed")]
    AlreadyPrimed,

    #[error("session {nick} has no remote connection")]
    NotConnected { nick: String },

    #[error("remote channel is closed")]
    ChannelClosed,

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid remote configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T, E = RemoteError> = std::result::Result<T, E>;
