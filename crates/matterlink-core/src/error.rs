// ── Core error types ──
//
// User-facing errors from matterlink-core. Only startup-fatal conditions
// and explicit shutdown cross the session boundary; everything transient is
// retried internally. The `From<matterlink_api::Error>` impl translates
// transport-layer errors into domain-appropriate variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to server at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Invalid token: {message}")]
    InvalidToken { message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited -- retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    // ── Session errors ───────────────────────────────────────────────
    #[error("Team '{team}' not found, valid teams: {}", valid.join(", "))]
    TeamNotFound { team: String, valid: Vec<String> },

    #[error("Channel not found: {name}")]
    ChannelNotFound { name: String },

    #[error("Session is not connected")]
    NotConnected,

    #[error("Session is already connected")]
    AlreadyConnected,

    #[error("Session closed")]
    SessionClosed,

    #[error("Event stream already taken")]
    EventsTaken,

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("API error: {message}")]
    Api {
        message: String,
        /// The server's error id (e.g., "api.post.create_post.channel_id.app_error").
        code: Option<String>,
        /// HTTP status code (if applicable).
        status: Option<u16>,
    },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<matterlink_api::Error> for CoreError {
    fn from(err: matterlink_api::Error) -> Self {
        use matterlink_api::Error as Api;

        match err {
            Api::Authentication { message } => CoreError::AuthenticationFailed { message },
            Api::MissingToken => CoreError::AuthenticationFailed {
                message: "server did not issue a session token".into(),
            },
            Api::NotLoggedIn => CoreError::NotConnected,
            Api::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        url: e
                            .url()
                            .map_or_else(|| "<unknown>".into(), ToString::to_string),
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        code: None,
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::Tls(msg) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("TLS error: {msg}"),
            },
            Api::RateLimited { retry_after_secs } => CoreError::RateLimited { retry_after_secs },
            Api::RateLimitMalformed { value } => CoreError::Api {
                message: format!("Rate limited with unusable reset header {value:?}"),
                code: Some("rate_limited".into()),
                status: Some(429),
            },
            Api::Api {
                message,
                id,
                status,
            } => CoreError::Api {
                message,
                code: id,
                status: Some(status),
            },
            Api::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket connection failed: {reason}"),
            },
            Api::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            Api::StreamClosed => CoreError::NotConnected,
            Api::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
        }
    }
}
