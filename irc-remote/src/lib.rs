//! Remote IRC connection layer for a chat bridge.
//!
//! The bridge does not speak IRC itself. An external connection service
//! holds the real IRC connections; this crate keeps local bookkeeping in
//! step with it and routes commands to it.
//!
//! - [`broker::ConnectionBroker`] primes a cache of the service's
//!   connections, creates connections idempotently per nick, and sends
//!   commands over a persistent websocket ([`channel::RemoteChannel`]).
//! - [`session::ClientSession`] is one bridged identity: it resolves names,
//!   builds connection options, obtains a connection id, and then issues
//!   fire-and-forget commands such as joining a channel.
//!
//! Bridge-side services (identity, IPv6 allocation, status events) are
//! consumed through the traits in [`collab`].

pub mod api;
pub mod broker;
pub mod cache;
pub mod channel;
pub mod collab;
pub mod config;
pub mod error;
pub mod server;
pub mod session;

pub use broker::{BrokerState, ConnectionBroker};
pub use error::{RemoteError, Result};
pub use server::IrcServer;
pub use session::{ClientConfig, ClientSession, ConnectState, ConnectionOptions};
