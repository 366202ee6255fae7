// User endpoints
//
// Listings are paginated (`page`/`per_page`); the batch lookup takes a JSON
// array of ids.

use reqwest::Method;
use serde_json::json;
use tracing::debug;

use crate::error::Error;
use crate::models::{User, UserStatus};
use crate::rest::client::RestClient;

impl RestClient {
    /// Every user in a team, across all pages.
    pub async fn users_in_team(&self, team_id: &str) -> Result<Vec<User>, Error> {
        self.get_all_pages("users", &[("in_team", team_id.to_owned())])
            .await
    }

    /// Every user visible to the session, across all pages.
    pub async fn all_users(&self) -> Result<Vec<User>, Error> {
        self.get_all_pages("users", &[]).await
    }

    /// A single user by id.
    pub async fn user(&self, user_id: &str) -> Result<User, Error> {
        self.get(&format!("users/{user_id}")).await
    }

    /// Batch lookup by ids. Unknown ids are silently absent from the result.
    pub async fn users_by_ids(&self, ids: &[String]) -> Result<Vec<User>, Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = ids.len(), "batch user lookup");
        self.post("users/ids", &ids).await
    }

    /// Set the presence status of a user.
    pub async fn update_status(&self, user_id: &str, status: UserStatus) -> Result<(), Error> {
        let body = json!({ "user_id": user_id, "status": status });
        self.send_json(Method::PUT, &format!("users/{user_id}/status"), &body)
            .await?;
        Ok(())
    }
}
