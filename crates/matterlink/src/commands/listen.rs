//! `listen`: print normalized events until Ctrl-C.

use owo_colors::OwoColorize;
use serde::Serialize;

use matterlink_core::{AntiIdleConfig, InboundEvent, Session, SessionConfig};

use crate::cli::{GlobalOpts, ListenArgs, OutputFormat};
use crate::error::CliError;
use crate::output;

/// Serializable view of an event for JSON output.
#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    kind: String,
    team: &'a str,
    channel: &'a str,
    channel_id: &'a str,
    username: &'a str,
    user_id: &'a str,
    text: &'a str,
    post_id: Option<&'a str>,
    root_id: Option<&'a str>,
    timestamp: String,
}

impl<'a> From<&'a InboundEvent> for EventRecord<'a> {
    fn from(event: &'a InboundEvent) -> Self {
        Self {
            kind: event.kind.to_string(),
            team: &event.team,
            channel: &event.channel,
            channel_id: &event.channel_id,
            username: &event.username,
            user_id: &event.user_id,
            text: &event.text,
            post_id: event.post.as_ref().map(|p| p.id.as_str()),
            root_id: event
                .post
                .as_ref()
                .map(|p| p.root_id.as_str())
                .filter(|r| !r.is_empty()),
            timestamp: event.timestamp.to_rfc3339(),
        }
    }
}

/// Apply listen-only options to the session config.
pub fn configure(config: &mut SessionConfig, args: &ListenArgs) {
    if let Some(ref channel) = args.anti_idle {
        config.anti_idle = Some(AntiIdleConfig {
            channel: channel.clone(),
            ..AntiIdleConfig::default()
        });
    }
}

pub async fn handle(
    session: &Session,
    args: ListenArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let mut events = session.events()?;
    let mut state = session.subscribe_state();
    session.connect().await?;

    let color = output::should_color(&global.color);
    if !global.quiet {
        let me = session
            .cache()
            .me()
            .await
            .map(|u| u.username.clone())
            .unwrap_or_default();
        eprintln!(
            "listening as {me} on {} (Ctrl-C to stop)",
            session.server_version().unwrap_or_else(|| "unknown version".into())
        );
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if !global.quiet {
                    eprintln!("session: {current}");
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if !wanted(&event, &args) {
                    continue;
                }
                output::print_output(&render(&event, &global.output, color), false);
            }
        }
    }
    Ok(())
}

fn wanted(event: &InboundEvent, args: &ListenArgs) -> bool {
    if args.messages_only && !event.is_message() {
        return false;
    }
    args.channel
        .as_deref()
        .is_none_or(|c| event.channel == c || event.channel_id == c)
}

fn render(event: &InboundEvent, format: &OutputFormat, color: bool) -> String {
    match format {
        OutputFormat::Json | OutputFormat::JsonCompact => {
            output::render_json(&EventRecord::from(event), true)
        }
        OutputFormat::Plain => event.text.clone(),
        OutputFormat::Table => render_line(event, color),
    }
}

fn render_line(event: &InboundEvent, color: bool) -> String {
    let time = event
        .timestamp
        .with_timezone(&chrono::Local)
        .format("%H:%M:%S")
        .to_string();
    let place = if event.team.is_empty() {
        event.channel.clone()
    } else {
        format!("{}/{}", event.team, event.channel)
    };
    let kind = event.kind.to_string();

    if color {
        format!(
            "{} {} {} {} {}",
            time.dimmed(),
            kind.cyan(),
            place.magenta(),
            event.username.yellow().bold(),
            event.text
        )
    } else {
        format!("{time} {kind} {place} {} {}", event.username, event.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anti_idle_flag_enables_anti_idle() {
        let mut config = SessionConfig::new(matterlink_core::Credentials {
            login: String::new(),
            secret: secrecy::SecretString::from("token=x".to_owned()),
            team: "eng".into(),
            server: "localhost".into(),
            no_tls: true,
            skip_tls_verify: false,
            mfa_token: None,
        });
        let listen = ListenArgs {
            channel: None,
            messages_only: false,
            anti_idle: Some("off-topic".into()),
        };
        configure(&mut config, &listen);
        assert_eq!(
            config.anti_idle.map(|a| a.channel).as_deref(),
            Some("off-topic")
        );
    }
}
