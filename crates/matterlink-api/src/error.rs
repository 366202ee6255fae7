use thiserror::Error;

/// Top-level error type for the `matterlink-api` crate.
///
/// Covers every failure mode across both API surfaces: authentication,
/// transport, REST status errors, rate limiting, and the WebSocket stream.
/// `matterlink-core` maps these into session-level diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login failed or the session/token was rejected (HTTP 401).
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// The server answered a login without a session token.
    #[error("Login response did not include a session token")]
    MissingToken,

    /// An authenticated request was attempted before login.
    #[error("Not logged in")]
    NotLoggedIn,

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Rate limiting ───────────────────────────────────────────────
    /// HTTP 429 with a usable `X-RateLimit-Reset` value (seconds).
    #[error("Rate limited -- retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// HTTP 429 whose reset header was missing or not an integer.
    #[error("Rate limited with unusable reset header: {value:?}")]
    RateLimitMalformed { value: Option<String> },

    // ── REST API ────────────────────────────────────────────────────
    /// Structured error body from the REST API.
    #[error("API error (HTTP {status}): {message}")]
    Api {
        message: String,
        id: Option<String>,
        status: u16,
    },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// The writer half of the stream is gone.
    #[error("WebSocket stream is closed")]
    StreamClosed,

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if the server rejected the credentials or session.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. } | Self::MissingToken | Self::NotLoggedIn
        ) || matches!(self, Self::Api { status: 401 | 403, .. })
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::RateLimited { .. } | Self::WebSocketConnect(_) => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Api { status: 404, .. } => true,
            _ => false,
        }
    }

    /// Extract the server's error id (e.g. `api.user.login.invalid_credentials`).
    pub fn api_error_id(&self) -> Option<&str> {
        match self {
            Self::Api { id, .. } => id.as_deref(),
            _ => None,
        }
    }
}
