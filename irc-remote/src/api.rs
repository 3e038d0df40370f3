//! Request/response client for the remote connection service.
//!
//! Used for setup only (state snapshots, opening connections). Commands for
//! live connections go over [`RemoteChannel`](crate::channel::RemoteChannel).

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::ConnectionRecord;
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};

/// Body of `GET /_irc/connections/{domain}?detail=state`.
#[derive(Debug, Deserialize)]
pub struct ConnectionsSnapshot {
    #[serde(default)]
    pub connections: Vec<ConnectionRecord>,
}

/// Body of `POST /_irc/connections/{domain}/open`.
#[derive(Debug, Deserialize)]
pub struct OpenedConnection {
    pub id: String,
}

#[derive(Clone)]
pub struct RemoteApi {
    http: reqwest::Client,
    base: String,
    config: RemoteConfig,
}

impl RemoteApi {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let base = config.endpoint("")?;
        let mut auth = HeaderValue::from_str(&config.bearer())
            .map_err(|_| RemoteError::InvalidConfig("access token is not a valid header value".into()))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| RemoteError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self { http, base, config })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Fetch the connection-state snapshot for one server.
    pub async fn connection_state(&self, domain: &str) -> Result<Vec<ConnectionRecord>, reqwest::Error> {
        let snapshot: ConnectionsSnapshot = self
            .request(Method::GET, &format!("/_irc/connections/{domain}?detail=state"), None::<&()>)
            .await?;
        Ok(snapshot.connections)
    }

    /// Ask the service to open a new connection; returns its id.
    pub async fn open_connection<B: Serialize + ?Sized>(
        &self,
        domain: &str,
        options: &B,
    ) -> Result<String, reqwest::Error> {
        let opened: OpenedConnection = self
            .request(Method::POST, &format!("/_irc/connections/{domain}/open"), Some(options))
            .await?;
        Ok(opened.id)
    }

    async fn request<T, B>(&self, method: Method, endpoint: &str, body: Option<&B>) -> Result<T, reqwest::Error>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{endpoint}", self.base);
        tracing::debug!(%method, %endpoint, "Requesting");

        let mut req = self.http.request(method, url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?.error_for_status()?;
        resp.json::<T>().await
    }
}
