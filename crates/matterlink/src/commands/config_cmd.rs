//! Config subcommand handlers.

use serde::Serialize;
use tabled::Tabled;

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::config::{self, Profile};
use crate::error::CliError;
use crate::output;

#[derive(Debug, Clone, Serialize, Tabled)]
struct ProfileRow {
    #[tabled(rename = "Profile")]
    name: String,
    #[tabled(rename = "Server")]
    server: String,
    #[tabled(rename = "Team")]
    team: String,
    #[tabled(rename = "Login")]
    login: String,
    #[tabled(rename = "Secret")]
    secret: &'static str,
    #[tabled(rename = "Default")]
    default: bool,
}

fn secret_source(profile: &Profile) -> &'static str {
    if profile.token_env.is_some() || profile.password_env.is_some() {
        "env"
    } else if profile.token.is_some() || profile.password.is_some() {
        "plaintext"
    } else {
        "keyring"
    }
}

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&config::config_path().display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = config::load_config()?;
            let default = cfg.default_profile.clone().unwrap_or_default();
            let mut rows: Vec<ProfileRow> = cfg
                .profiles
                .iter()
                .map(|(name, p)| ProfileRow {
                    name: name.clone(),
                    server: p.server.clone(),
                    team: p.team.clone(),
                    login: p.login.clone().unwrap_or_default(),
                    secret: secret_source(p),
                    default: *name == default,
                })
                .collect();
            rows.sort_by(|a, b| a.name.cmp(&b.name));

            let rendered =
                output::render_list(&global.output, &rows, ProfileRow::clone, |r| r.name.clone());
            output::print_output(&rendered, global.quiet);
            Ok(())
        }

        ConfigCommand::SetSecret { kind } => {
            let cfg = config::load_config()?;
            let profile_name = config::active_profile_name(global, &cfg);
            let secret = rpassword::prompt_password(format!("{} for '{profile_name}': ", kind.as_str()))?;
            if secret.is_empty() {
                return Err(CliError::Validation {
                    field: kind.as_str().into(),
                    reason: "must not be empty".into(),
                });
            }
            matterlink_config::store_secret(&profile_name, kind.as_str(), &secret)?;
            if !global.quiet {
                eprintln!("Stored {} for profile '{profile_name}' in the keyring", kind.as_str());
            }
            Ok(())
        }
    }
}
