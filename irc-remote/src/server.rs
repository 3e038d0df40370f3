//! Read-only description of an IRC network the bridge talks to.

/// Nick template used when a server does not configure one.
pub const DEFAULT_NICK_TEMPLATE: &str = "M-$DISPLAY";

/// Immutable IRC server descriptor. Owned by the bridge and shared as
/// `Arc<IrcServer>`; nothing in this crate mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcServer {
    pub domain: String,
    pub port: u16,
    /// Connect with TLS.
    pub tls: bool,
    /// Accept self-signed certificates.
    pub self_signed: bool,
    /// Accept expired certificates.
    pub allow_expired_certs: bool,
    /// PEM CA bundle for the TLS secure context.
    pub ca: Option<String>,
    /// Authenticate with SASL when a password is available.
    pub sasl: bool,
    /// Server-wide password, overridden by a per-client password.
    pub password: Option<String>,
    /// IPv6 prefix clients get addresses allocated from.
    pub ipv6_prefix: Option<String>,
    pub ipv6_only: bool,
    /// Template for nicks of identities without a desired nick.
    /// Supports `$USERID`, `$LOCALPART` and `$DISPLAY`.
    pub nick_template: String,
}

impl IrcServer {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            port: 6667,
            tls: false,
            self_signed: false,
            allow_expired_certs: false,
            ca: None,
            sasl: false,
            password: None,
            ipv6_prefix: None,
            ipv6_only: false,
            nick_template: DEFAULT_NICK_TEMPLATE.to_string(),
        }
    }

    /// Whether clients on this server connect over IPv6 only.
    pub fn wants_ipv6(&self) -> bool {
        self.ipv6_prefix.is_some() || self.ipv6_only
    }

    /// Expand the nick template for a bridged user.
    ///
    /// `$DISPLAY` falls back to the localpart when no display name is set.
    pub fn nick_for(&self, user_id: Option<&str>, display_name: Option<&str>) -> String {
        let user_id = user_id.unwrap_or_default();
        let localpart = user_id
            .strip_prefix('@')
            .unwrap_or(user_id)
            .split(':')
            .next()
            .unwrap_or_default();
        let display = display_name
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(localpart);
        self.nick_template
            .replace("$USERID", user_id)
            .replace("$LOCALPART", localpart)
            .replace("$DISPLAY", display)
    }
}
