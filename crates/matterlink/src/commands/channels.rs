//! `channels`: list cached channels per team.

use serde::Serialize;
use tabled::Tabled;

use matterlink_core::Session;
use matterlink_core::cache::normalized_name;

use crate::cli::{ChannelsArgs, GlobalOpts};
use crate::error::CliError;
use crate::output;

#[derive(Debug, Clone, Serialize, Tabled)]
struct ChannelRow {
    #[tabled(rename = "Team")]
    team: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Display name")]
    display_name: String,
    #[tabled(rename = "Joined")]
    joined: bool,
    #[tabled(skip)]
    id: String,
}

pub async fn handle(
    session: &Session,
    args: ChannelsArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    session.connect().await?;

    let mut rows = Vec::new();
    for entry in session.cache().teams().await {
        let joined = entry.channels.iter().map(|c| (c, true));
        let more = entry
            .more_channels
            .iter()
            .filter(|_| args.all)
            .map(|c| (c, false));
        for (channel, joined) in joined.chain(more) {
            rows.push(ChannelRow {
                team: entry.team.name.clone(),
                name: normalized_name(channel),
                kind: channel.kind.to_string(),
                display_name: channel.display_name.clone(),
                joined,
                id: channel.id.clone(),
            });
        }
    }
    rows.sort_by(|a, b| (&a.team, &a.name).cmp(&(&b.team, &b.name)));

    let rendered = output::render_list(&global.output, &rows, ChannelRow::clone, |r| r.name.clone());
    output::print_output(&rendered, global.quiet);
    Ok(())
}
