//! Connection settings for the remote connection service.

use clap::Args;
use url::Url;

use crate::error::{RemoteError, Result};

/// Path of the persistent command channel on the remote service.
pub const CHANNEL_PATH: &str = "/_irc/ws";

/// Where the remote connection service lives and how to authenticate.
#[derive(Debug, Clone, Args)]
pub struct RemoteConfig {
    /// Base URL of the remote connection service (http or https).
    #[arg(long = "url", env = "IRC_REMOTE_URL")]
    pub url: String,

    /// Bearer token presented on every request and on the channel.
    #[arg(long = "access-token", env = "IRC_REMOTE_TOKEN", hide_env_values = true)]
    pub access_token: String,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_token: access_token.into(),
        }
    }

    /// Parsed base URL with any trailing slash removed from the path.
    pub fn base_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| RemoteError::InvalidConfig(format!("bad url {:?}: {e}", self.url)))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(RemoteError::InvalidConfig(format!(
                    "unsupported scheme {other:?} (expected http or https)"
                )));
            }
        }
        let trimmed = url.path().trim_end_matches('/').to_string();
        url.set_path(&trimmed);
        Ok(url)
    }

    /// Absolute URL for a request endpoint such as `/_irc/connections/x`.
    pub fn endpoint(&self, path: &str) -> Result<String> {
        let base = self.base_url()?;
        Ok(format!("{}{path}", base.as_str().trim_end_matches('/')))
    }

    /// Websocket URL of the command channel (`http` → `ws`, `https` → `wss`).
    pub fn channel_url(&self) -> Result<Url> {
        let mut url = self.base_url()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| RemoteError::InvalidConfig(format!("cannot derive {scheme} url")))?;
        let path = format!("{}{CHANNEL_PATH}", url.path().trim_end_matches('/'));
        url.set_path(&path);
        Ok(url)
    }

    /// Value of the `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}
