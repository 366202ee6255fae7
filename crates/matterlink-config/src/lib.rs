//! Shared configuration for matterlink tools.
//!
//! TOML profiles, secret resolution (env + keyring + plaintext), and
//! translation to `matterlink_core::SessionConfig`. The CLI layers its
//! flag overrides on top.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use matterlink_core::config::PERSONAL_TOKEN_MARKER;
use matterlink_core::{AntiIdleConfig, Credentials, SessionConfig, TlsVerification};

/// Keyring service name.
pub const KEYRING_SERVICE: &str = "matterlink";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{profile}' not found")]
    UnknownProfile { profile: String },

    #[error("no credentials configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Default profile name.
    pub default_profile: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named server profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

impl Config {
    /// Look up a profile, falling back to `default_profile`.
    pub fn profile(&self, name: Option<&str>) -> Result<(&str, &Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: name.into(),
            })
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_color")]
    pub color: String,

    #[serde(default)]
    pub insecure: bool,

    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            color: default_color(),
            insecure: false,
            timeout: default_timeout(),
        }
    }
}

fn default_color() -> String {
    "auto".into()
}
fn default_timeout() -> u64 {
    10
}

/// A named server profile.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Profile {
    /// Server address, `host[:port][/prefix]` or a full URL.
    pub server: String,

    /// Primary team name.
    pub team: String,

    /// Username or email for password logins.
    pub login: Option<String>,

    /// Password (plaintext; prefer keyring or env var).
    pub password: Option<String>,

    /// Environment variable name containing the password.
    pub password_env: Option<String>,

    /// Personal access token (plaintext; prefer keyring or env var).
    pub token: Option<String>,

    /// Environment variable name containing the personal access token.
    pub token_env: Option<String>,

    /// Use plain http/ws.
    #[serde(default)]
    pub no_tls: bool,

    /// Path to custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    /// Override insecure TLS setting.
    pub insecure: Option<bool>,

    /// Override timeout (seconds).
    pub timeout: Option<u64>,

    /// Stream endpoint override, for proxies that relocate the WebSocket.
    pub stream_url: Option<String>,

    /// Channel kept "viewed" to stay active. Unset disables anti-idle.
    pub anti_idle_channel: Option<String>,

    /// Anti-idle period (seconds).
    pub anti_idle_interval: Option<u64>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "matterlink", "matterlink").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("matterlink");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load the full Config from `path` + environment. A missing file yields
/// the defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("MATTERLINK_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Secret resolution ───────────────────────────────────────────────

/// Resolve the login secret for a profile.
///
/// Personal tokens win over passwords at every step. Tokens are returned
/// in `token=<value>` form so the session recognizes them. Order:
/// profile's `*_env` variables, then the system keyring, then plaintext.
pub fn resolve_secret(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    let token = |value: String| SecretString::from(format!("{PERSONAL_TOKEN_MARKER}{value}"));

    // 1. Env vars named by the profile
    if let Some(value) = env_lookup(profile.token_env.as_deref()) {
        return Ok(token(value));
    }
    if let Some(value) = env_lookup(profile.password_env.as_deref()) {
        return Ok(SecretString::from(value));
    }

    // 2. System keyring
    if let Some(value) = keyring_lookup(profile_name, "token") {
        return Ok(token(value));
    }
    if let Some(value) = keyring_lookup(profile_name, "password") {
        return Ok(SecretString::from(value));
    }

    // 3. Plaintext in config
    if let Some(ref value) = profile.token {
        return Ok(token(value.clone()));
    }
    if let Some(ref value) = profile.password {
        return Ok(SecretString::from(value.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

fn env_lookup(name: Option<&str>) -> Option<String> {
    name.and_then(|n| std::env::var(n).ok())
        .filter(|v| !v.is_empty())
}

fn keyring_lookup(profile_name: &str, kind: &str) -> Option<String> {
    keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/{kind}"))
        .ok()?
        .get_password()
        .ok()
}

/// Store a secret (`"password"` or `"token"`) in the system keyring.
pub fn store_secret(profile_name: &str, kind: &str, value: &str) -> Result<(), ConfigError> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/{kind}"))?;
    entry.set_password(value)?;
    Ok(())
}

// ── SessionConfig construction ──────────────────────────────────────

/// Build a `SessionConfig` from a profile, with `secret` already resolved.
pub fn profile_to_session_config(
    profile: &Profile,
    defaults: &Defaults,
    secret: SecretString,
) -> Result<SessionConfig, ConfigError> {
    if profile.server.trim().is_empty() {
        return Err(ConfigError::Validation {
            field: "server".into(),
            reason: "must not be empty".into(),
        });
    }
    if profile.team.trim().is_empty() {
        return Err(ConfigError::Validation {
            field: "team".into(),
            reason: "must not be empty".into(),
        });
    }

    let insecure = profile.insecure.unwrap_or(defaults.insecure);
    let credentials = Credentials {
        login: profile.login.clone().unwrap_or_default(),
        secret,
        team: profile.team.clone(),
        server: profile.server.clone(),
        no_tls: profile.no_tls,
        skip_tls_verify: insecure,
        mfa_token: None,
    };

    let mut config = SessionConfig::new(credentials);
    config.tls = if insecure {
        TlsVerification::DangerAcceptInvalid
    } else if let Some(ref ca_path) = profile.ca_cert {
        TlsVerification::CustomCa(ca_path.clone())
    } else {
        TlsVerification::SystemDefaults
    };
    config.timeout = Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout));

    if let Some(ref raw) = profile.stream_url {
        config.stream_url = Some(raw.parse().map_err(|_| ConfigError::Validation {
            field: "stream_url".into(),
            reason: format!("invalid URL: {raw}"),
        })?);
    }

    if let Some(ref channel) = profile.anti_idle_channel {
        let mut anti_idle = AntiIdleConfig {
            channel: channel.clone(),
            ..AntiIdleConfig::default()
        };
        if let Some(secs) = profile.anti_idle_interval {
            anti_idle.interval = Duration::from_secs(secs.max(1));
        }
        config.anti_idle = Some(anti_idle);
    }

    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    const SAMPLE: &str = r#"
default_profile = "work"

[defaults]
timeout = 20

[profiles.work]
server = "chat.example.com"
team = "eng"
login = "bridge-bot"
password = "hunter2"
anti_idle_channel = "town-square"
anti_idle_interval = 120

[profiles.lab]
server = "localhost:8065"
team = "lab"
token = "pat-abc"
no_tls = true
insecure = true
timeout = 5
stream_url = "ws://localhost:9000/ws"
"#;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.default_profile.as_deref(), Some("default"));
        assert_eq!(config.defaults.timeout, 10);
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn default_profile_is_selected() {
        let file = write_config(SAMPLE);
        let config = load_config_from(file.path()).unwrap();

        let (name, profile) = config.profile(None).unwrap();
        assert_eq!(name, "work");
        assert_eq!(profile.team, "eng");

        assert!(matches!(
            config.profile(Some("nope")),
            Err(ConfigError::UnknownProfile { .. })
        ));
    }

    #[test]
    fn password_profile_builds_session_config() {
        let file = write_config(SAMPLE);
        let config = load_config_from(file.path()).unwrap();
        let (_, profile) = config.profile(Some("work")).unwrap();

        let session =
            profile_to_session_config(profile, &config.defaults, SecretString::from("pw".to_owned())).unwrap();
        assert_eq!(session.credentials.login, "bridge-bot");
        assert_eq!(session.credentials.server, "chat.example.com");
        assert_eq!(session.timeout, Duration::from_secs(20));
        assert_eq!(session.tls, TlsVerification::SystemDefaults);
        let anti_idle = session.anti_idle.unwrap();
        assert_eq!(anti_idle.channel, "town-square");
        assert_eq!(anti_idle.interval, Duration::from_secs(120));
    }

    #[test]
    fn lab_profile_overrides_transport() {
        let file = write_config(SAMPLE);
        let config = load_config_from(file.path()).unwrap();
        let (_, profile) = config.profile(Some("lab")).unwrap();

        let session =
            profile_to_session_config(profile, &config.defaults, SecretString::from("x".to_owned())).unwrap();
        assert!(session.credentials.no_tls);
        assert_eq!(session.tls, TlsVerification::DangerAcceptInvalid);
        assert_eq!(session.timeout, Duration::from_secs(5));
        assert_eq!(
            session.stream_url.unwrap().as_str(),
            "ws://localhost:9000/ws"
        );
        assert!(session.anti_idle.is_none());
    }

    #[test]
    fn plaintext_token_is_marked() {
        let profile = Profile {
            server: "s".into(),
            team: "t".into(),
            token: Some("pat-abc".into()),
            password: Some("ignored".into()),
            ..Profile::default()
        };
        let secret = resolve_secret(&profile, "matterlink-test-unused-profile").unwrap();
        assert_eq!(secret.expose_secret(), "token=pat-abc");
    }

    #[test]
    fn empty_team_is_rejected() {
        let profile = Profile {
            server: "chat.example.com".into(),
            ..Profile::default()
        };
        let err = profile_to_session_config(&profile, &Defaults::default(), SecretString::from("pw".to_owned()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "team"));
    }
}
