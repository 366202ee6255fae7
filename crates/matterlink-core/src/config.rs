// ── Runtime session configuration ──
//
// These types describe *how* to connect to a chat server.
// They carry credential data and connection tuning, but never touch disk.
// The CLI constructs a `SessionConfig` and hands it in.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::CoreError;

/// Marker for session-cookie credentials: `MMAUTHTOKEN=<value>`.
pub const SESSION_COOKIE_NAME: &str = "MMAUTHTOKEN";

/// Marker for personal access tokens: `token=<value>`.
pub const PERSONAL_TOKEN_MARKER: &str = "token=";

/// What the user handed us to log in with.
///
/// Immutable once the session starts.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Username or email. Ignored for token credentials.
    pub login: String,
    /// Raw password, `token=<pat>`, or `MMAUTHTOKEN=<session cookie>`.
    pub secret: SecretString,
    /// Name of the primary team.
    pub team: String,
    /// `host[:port]`, optionally followed by a path prefix.
    pub server: String,
    /// Use plain `http`/`ws` instead of `https`/`wss`.
    pub no_tls: bool,
    /// Accept any TLS certificate.
    pub skip_tls_verify: bool,
    /// One-time MFA code sent with password logins.
    pub mfa_token: Option<String>,
}

/// How the secret authenticates, derived from its format.
#[derive(Debug, Clone)]
pub enum AuthMode {
    /// Interactive login with login id + password.
    Password,
    /// Pre-issued personal access token. Never invalidated on logout.
    PersonalToken(SecretString),
    /// Existing browser session cookie. Never invalidated on logout.
    SessionCookie(SecretString),
}

impl AuthMode {
    /// Whether logout should invalidate the session server-side.
    pub fn owns_session(&self) -> bool {
        matches!(self, Self::Password)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::PersonalToken(_) => "personal token",
            Self::SessionCookie(_) => "session cookie",
        }
    }
}

impl Credentials {
    /// Classify the secret.
    ///
    /// `MMAUTHTOKEN` takes precedence over `token=`. A secret that mentions a
    /// marker but does not have exactly one `marker=value` split with a
    /// non-empty value is rejected with [`CoreError::InvalidToken`].
    pub fn auth_mode(&self) -> Result<AuthMode, CoreError> {
        let secret = self.secret.expose_secret();

        if secret.contains(SESSION_COOKIE_NAME) {
            let value = split_marker(secret, &format!("{SESSION_COOKIE_NAME}=")).ok_or_else(
                || CoreError::InvalidToken {
                    message: format!(
                        "incorrect {SESSION_COOKIE_NAME}, valid input is {SESSION_COOKIE_NAME}=yourtoken"
                    ),
                },
            )?;
            return Ok(AuthMode::SessionCookie(SecretString::from(value.to_owned())));
        }

        if secret.contains(PERSONAL_TOKEN_MARKER) {
            let value =
                split_marker(secret, PERSONAL_TOKEN_MARKER).ok_or_else(|| CoreError::InvalidToken {
                    message: "incorrect personal token, valid input is token=yourtoken".into(),
                })?;
            return Ok(AuthMode::PersonalToken(SecretString::from(value.to_owned())));
        }

        Ok(AuthMode::Password)
    }

    /// REST root derived from the server address and TLS flag.
    pub fn server_url(&self) -> Result<Url, CoreError> {
        let raw = self.server.trim().trim_end_matches('/');
        let candidate = if raw.contains("://") {
            raw.to_owned()
        } else if self.no_tls {
            format!("http://{raw}")
        } else {
            format!("https://{raw}")
        };
        Url::parse(&candidate).map_err(|e| CoreError::Config {
            message: format!("invalid server address '{}': {e}", self.server),
        })
    }
}

fn split_marker<'a>(secret: &'a str, marker: &str) -> Option<&'a str> {
    let mut parts = secret.split(marker);
    let _prefix = parts.next()?;
    let value = parts.next()?;
    if parts.next().is_some() || value.is_empty() {
        return None;
    }
    Some(value)
}

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store (strict).
    #[default]
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(std::path::PathBuf),
    /// Skip verification (self-signed certs).
    DangerAcceptInvalid,
}

/// Bounds of the exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(5 * 60),
        }
    }
}

/// Liveness probing cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// How often to probe.
    pub interval: Duration,
    /// Maximum age of the last pong before the stream counts as dead.
    pub pong_threshold: Duration,
    /// Wait before re-checking a failed probe.
    pub grace: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(45),
            pong_threshold: Duration::from_secs(90),
            grace: Duration::from_secs(10),
        }
    }
}

/// Periodic "mark channel viewed" to keep the account from idling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntiIdleConfig {
    /// Channel name, looked up in the primary team.
    pub channel: String,
    pub interval: Duration,
}

impl Default for AntiIdleConfig {
    fn default() -> Self {
        Self {
            channel: "town-square".into(),
            interval: Duration::from_secs(60),
        }
    }
}

/// Complete configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub credentials: Credentials,
    pub tls: TlsVerification,
    /// Per-request HTTP timeout.
    pub timeout: Duration,
    pub backoff: BackoffConfig,
    pub keepalive: KeepaliveConfig,
    /// Self-check tick of the dispatch loop.
    pub dispatch_tick: Duration,
    /// Stream silence that trips the hard timeout.
    pub ping_timeout: Duration,
    pub anti_idle: Option<AntiIdleConfig>,
    /// Override of the derived `{ws|wss}://server/api/v4/websocket` URL.
    pub stream_url: Option<Url>,
    /// Capacity of the consumer event channel.
    pub event_buffer: usize,
}

impl SessionConfig {
    /// Config with default tuning for the given credentials.
    pub fn new(credentials: Credentials) -> Self {
        let tls = if credentials.skip_tls_verify {
            TlsVerification::DangerAcceptInvalid
        } else {
            TlsVerification::SystemDefaults
        };
        Self {
            credentials,
            tls,
            timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            keepalive: KeepaliveConfig::default(),
            dispatch_tick: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(65),
            anti_idle: None,
            stream_url: None,
            event_buffer: 100,
        }
    }
}
