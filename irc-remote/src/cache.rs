//! Local mirror of the remote service's connection state.
//!
//! Two maps are kept:
//!
//! - per server domain: connection id → [`ConnectionRecord`]
//! - across all servers: nick → connection id (the dedup map used by
//!   [`ConnectionBroker::create_connection`](crate::broker::ConnectionBroker::create_connection))
//!
//! The cache is a plain data holder. Synchronization belongs to the broker,
//! which keeps it behind a lock and never hands it out.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One connection as reported by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub nick: String,
    /// Everything else the service reported for this connection.
    #[serde(flatten)]
    pub state: serde_json::Map<String, serde_json::Value>,
}

impl ConnectionRecord {
    pub fn new(id: impl Into<String>, nick: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nick: nick.into(),
            state: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionStateCache {
    servers: HashMap<String, HashMap<String, ConnectionRecord>>,
    nick_to_id: HashMap<String, String>,
}

impl ConnectionStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot for one server.
    ///
    /// Nicks that pointed at a connection of the previous snapshot are
    /// dropped before the new records are inserted.
    pub fn prime(&mut self, domain: &str, records: Vec<ConnectionRecord>) {
        if let Some(previous) = self.servers.remove(domain) {
            for record in previous.values() {
                if self.nick_to_id.get(&record.nick) == Some(&record.id) {
                    self.nick_to_id.remove(&record.nick);
                }
            }
        }

        let mut by_id = HashMap::with_capacity(records.len());
        for record in records {
            self.nick_to_id.insert(record.nick.clone(), record.id.clone());
            by_id.insert(record.id.clone(), record);
        }
        self.servers.insert(domain.to_string(), by_id);
    }

    /// Apply several server snapshots in one go.
    pub fn prime_all(&mut self, snapshots: Vec<(String, Vec<ConnectionRecord>)>) {
        for (domain, records) in snapshots {
            self.prime(&domain, records);
        }
    }

    /// Add a single connection created after priming.
    pub fn record(&mut self, domain: &str, record: ConnectionRecord) {
        self.nick_to_id.insert(record.nick.clone(), record.id.clone());
        self.servers
            .entry(domain.to_string())
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub fn lookup(&self, nick: &str) -> Option<&str> {
        self.nick_to_id.get(nick).map(String::as_str)
    }

    pub fn get(&self, domain: &str, id: &str) -> Option<&ConnectionRecord> {
        self.servers.get(domain)?.get(id)
    }

    pub fn connections(&self, domain: &str) -> Option<&HashMap<String, ConnectionRecord>> {
        self.servers.get(domain)
    }

    /// Total number of connections across all servers.
    pub fn len(&self) -> usize {
        self.servers.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.servers.clear();
        self.nick_to_id.clear();
    }
}
