// Channel endpoints

use reqwest::Method;
use serde_json::json;

use crate::error::Error;
use crate::models::{Channel, ChannelMember};
use crate::rest::client::RestClient;

impl RestClient {
    /// Channels of `team_id` the user has joined (DM and group channels
    /// included).
    pub async fn channels_for_user(
        &self,
        user_id: &str,
        team_id: &str,
    ) -> Result<Vec<Channel>, Error> {
        self.get(&format!("users/{user_id}/teams/{team_id}/channels"))
            .await
    }

    /// Public channels of a team, across all pages.
    pub async fn public_channels(&self, team_id: &str) -> Result<Vec<Channel>, Error> {
        self.get_all_pages(&format!("teams/{team_id}/channels"), &[])
            .await
    }

    /// Membership record of a user in a channel.
    pub async fn channel_member(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> Result<ChannelMember, Error> {
        self.get(&format!("channels/{channel_id}/members/{user_id}"))
            .await
    }

    /// Mark a channel as viewed by the user.
    pub async fn view_channel(&self, user_id: &str, channel_id: &str) -> Result<(), Error> {
        let body = json!({ "channel_id": channel_id });
        self.send_json(Method::POST, &format!("channels/members/{user_id}/view"), &body)
            .await?;
        Ok(())
    }
}
