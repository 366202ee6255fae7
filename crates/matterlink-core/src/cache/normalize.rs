// Channel naming rules.

use matterlink_api::models::{Channel, ChannelKind};

/// The name a bridge should use for a channel.
///
/// Group conversations have machine names, so their name is derived from
/// the display name: `", "` becomes `"-"`, then every remaining space
/// becomes `"_"`. All other kinds keep their raw name.
pub fn normalized_name(channel: &Channel) -> String {
    match channel.kind {
        ChannelKind::Group => group_name(&channel.display_name),
        ChannelKind::Open | ChannelKind::Private | ChannelKind::Direct => channel.name.clone(),
    }
}

/// `"Alice Smith, Bob"` -> `"Alice_Smith-Bob"`.
pub fn group_name(display_name: &str) -> String {
    display_name.replace(", ", "-").replace(' ', "_")
}
