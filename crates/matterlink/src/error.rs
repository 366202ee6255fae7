//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` variants into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use matterlink_config::ConfigError;
use matterlink_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to server at {url}")]
    #[diagnostic(
        code(matterlink::connection_failed),
        help(
            "Check that the server is running and reachable.\n\
             Plain http servers need --no-tls, self-signed ones --insecure (-k)."
        )
    )]
    ConnectionFailed {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(matterlink::auth_failed),
        help(
            "Verify your login and secret.\n\
             Run: matterlink config set-secret --profile {profile}"
        )
    )]
    AuthFailed { profile: String, message: String },

    #[error("Malformed secret: {message}")]
    #[diagnostic(
        code(matterlink::invalid_token),
        help("Use token=<personal token> or MMAUTHTOKEN=<session cookie>.")
    )]
    InvalidToken { message: String },

    #[error("No credentials configured for profile '{profile}'")]
    #[diagnostic(
        code(matterlink::no_credentials),
        help(
            "Store one with: matterlink config set-secret\n\
             Or set the MATTERLINK_SECRET environment variable."
        )
    )]
    NoCredentials { profile: String },

    // ── Resources ────────────────────────────────────────────────────
    #[error("Team '{team}' not found")]
    #[diagnostic(
        code(matterlink::team_not_found),
        help("Teams you belong to: {valid}")
    )]
    TeamNotFound { team: String, valid: String },

    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(
        code(matterlink::not_found),
        help("Run: matterlink {list_command} to see available {resource_type}s")
    )]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    // ── API ──────────────────────────────────────────────────────────
    #[error("API error ({code}): {message}")]
    #[diagnostic(code(matterlink::api_error))]
    ApiError { code: String, message: String },

    #[error("Rate limited by the server, retry after {seconds}s")]
    #[diagnostic(code(matterlink::rate_limited))]
    RateLimited { seconds: u64 },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(matterlink::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(matterlink::profile_not_found),
        help("Available profiles: {available}")
    )]
    ProfileNotFound { name: String, available: String },

    #[error("No server configured")]
    #[diagnostic(
        code(matterlink::no_config),
        help(
            "Pass --server and --team, or add a profile to\n\
             {path}"
        )
    )]
    NoConfig { path: String },

    #[error(transparent)]
    #[diagnostic(code(matterlink::config))]
    Config(Box<ConfigError>),

    // ── Session ──────────────────────────────────────────────────────
    #[error("Session closed")]
    #[diagnostic(code(matterlink::closed))]
    SessionClosed,

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Request timed out")]
    #[diagnostic(
        code(matterlink::timeout),
        help("Increase the timeout with --timeout or check server responsiveness.")
    )]
    Timeout,

    // ── IO / Serialization ────────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } | Self::InvalidToken { .. } | Self::NoCredentials { .. } => {
                exit_code::AUTH
            }
            Self::TeamNotFound { .. } | Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Timeout => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::NoConfig { .. } | Self::ProfileNotFound { .. } => {
                exit_code::USAGE
            }
            _ => exit_code::GENERAL,
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::NoCredentials { profile } => CliError::NoCredentials { profile },
            other => CliError::Config(Box::new(other)),
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { url, reason } => CliError::ConnectionFailed {
                url,
                source: reason.into(),
            },

            CoreError::AuthenticationFailed { message } => CliError::AuthFailed {
                profile: "current".into(),
                message,
            },

            CoreError::InvalidToken { message } => CliError::InvalidToken { message },

            CoreError::Timeout => CliError::Timeout,

            CoreError::RateLimited { retry_after_secs } => CliError::RateLimited {
                seconds: retry_after_secs,
            },

            CoreError::TeamNotFound { team, valid } => CliError::TeamNotFound {
                team,
                valid: valid.join(", "),
            },

            CoreError::ChannelNotFound { name } => CliError::NotFound {
                resource_type: "channel".into(),
                identifier: name,
                list_command: "channels --all".into(),
            },

            CoreError::NotConnected
            | CoreError::AlreadyConnected
            | CoreError::SessionClosed
            | CoreError::EventsTaken => {
                CliError::SessionClosed
            }

            CoreError::Api {
                message,
                code,
                status,
            } => CliError::ApiError {
                code: code
                    .or_else(|| status.map(|s| s.to_string()))
                    .unwrap_or_default(),
                message,
            },

            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },

            CoreError::Internal(message) => CliError::ApiError {
                code: "internal".into(),
                message,
            },
        }
    }
}
