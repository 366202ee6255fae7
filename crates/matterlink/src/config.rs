//! CLI configuration -- thin wrapper around `matterlink_config` shared types.
//!
//! Adds resolution that respects `GlobalOpts` flag overrides (--server,
//! --team, --secret, etc.).

use std::time::Duration;

use secrecy::SecretString;

use matterlink_core::{Credentials, SessionConfig, TlsVerification};

use crate::cli::GlobalOpts;
use crate::error::CliError;

pub use matterlink_config::{Config, Profile, config_path, load_config};

/// Resolve the active profile name from CLI flags and config.
pub fn active_profile_name(global: &GlobalOpts, config: &Config) -> String {
    global
        .profile
        .clone()
        .or_else(|| config.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

/// Build a `SessionConfig` from the config file, profile, and CLI overrides.
///
/// Flags take priority over profile values. Without a matching profile,
/// `--server`, `--team` and `--secret` must all be given.
pub fn build_session_config(global: &GlobalOpts) -> Result<SessionConfig, CliError> {
    let cfg = load_config()?;
    let profile_name = active_profile_name(global, &cfg);

    let mut session = match cfg.profiles.get(&profile_name) {
        Some(profile) => {
            let secret = match global.secret {
                Some(ref secret) => SecretString::from(secret.clone()),
                None => matterlink_config::resolve_secret(profile, &profile_name)?,
            };
            matterlink_config::profile_to_session_config(profile, &cfg.defaults, secret)?
        }
        None if global.profile.is_some() => {
            let mut available: Vec<&str> = cfg.profiles.keys().map(String::as_str).collect();
            available.sort_unstable();
            return Err(CliError::ProfileNotFound {
                name: profile_name,
                available: if available.is_empty() {
                    "(none)".into()
                } else {
                    available.join(", ")
                },
            });
        }
        None => from_flags(global, &profile_name)?,
    };

    // Flag overrides.
    let creds = &mut session.credentials;
    if let Some(ref server) = global.server {
        creds.server.clone_from(server);
    }
    if let Some(ref team) = global.team {
        creds.team.clone_from(team);
    }
    if let Some(ref login) = global.login {
        creds.login.clone_from(login);
    }
    creds.mfa_token.clone_from(&global.mfa);
    creds.no_tls |= global.no_tls;
    if global.insecure {
        creds.skip_tls_verify = true;
        session.tls = TlsVerification::DangerAcceptInvalid;
    }
    if let Some(secs) = global.timeout {
        session.timeout = Duration::from_secs(secs);
    }
    Ok(session)
}

fn from_flags(global: &GlobalOpts, profile_name: &str) -> Result<SessionConfig, CliError> {
    let (Some(server), Some(team)) = (global.server.as_ref(), global.team.as_ref()) else {
        return Err(CliError::NoConfig {
            path: config_path().display().to_string(),
        });
    };
    let secret = global
        .secret
        .as_ref()
        .ok_or_else(|| CliError::NoCredentials {
            profile: profile_name.into(),
        })?;

    Ok(SessionConfig::new(Credentials {
        login: global.login.clone().unwrap_or_default(),
        secret: SecretString::from(secret.clone()),
        team: team.clone(),
        server: server.clone(),
        no_tls: global.no_tls,
        skip_tls_verify: global.insecure,
        mfa_token: global.mfa.clone(),
    }))
}
