// Wire records for the REST API v4.
//
// Only the fields the session engine reads are modelled. Unknown fields are
// ignored by serde, missing optional fields fall back to defaults.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A user account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub delete_at: i64,
}

impl User {
    /// `"First Last"`, or the username when no name is set.
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.username.clone()
        } else {
            full.to_owned()
        }
    }
}

/// A team (organizational scope).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

/// Channel type as encoded on the wire.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
pub enum ChannelKind {
    /// Public channel, discoverable by every team member.
    #[serde(rename = "O")]
    #[strum(serialize = "O")]
    #[default]
    Open,
    /// Private (invite-only) channel.
    #[serde(rename = "P")]
    #[strum(serialize = "P")]
    Private,
    /// One-to-one direct message channel.
    #[serde(rename = "D")]
    #[strum(serialize = "D")]
    Direct,
    /// Multi-party group message channel.
    #[serde(rename = "G")]
    #[strum(serialize = "G")]
    Group,
}

/// A conversation scope within a team.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(rename = "type", default)]
    pub kind: ChannelKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub header: String,
}

/// A message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Post {
    #[serde(default)]
    pub id: String,
    pub channel_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub root_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub post_type: String,
    #[serde(default)]
    pub create_at: i64,
    #[serde(default)]
    pub update_at: i64,
    #[serde(default)]
    pub delete_at: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub props: serde_json::Map<String, serde_json::Value>,
}

/// Body for `POST /posts`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewPost {
    pub channel_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub root_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
}

/// Membership record for a user in a channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelMember {
    pub channel_id: String,
    pub user_id: String,
    #[serde(default)]
    pub last_viewed_at: i64,
}

/// Uploaded file metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileUploadResponse {
    #[serde(default)]
    pub file_infos: Vec<FileInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileLink {
    pub link: String,
}

/// Error body returned by the API on non-2xx responses.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Presence values accepted by `PUT /users/{id}/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UserStatus {
    Online,
    Away,
    Dnd,
    Offline,
}
