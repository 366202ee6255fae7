use crate::error::Error;
use crate::models::Team;
use crate::rest::client::RestClient;

impl RestClient {
    /// Teams the given user belongs to.
    pub async fn teams_for_user(&self, user_id: &str) -> Result<Vec<Team>, Error> {
        self.get(&format!("users/{user_id}/teams")).await
    }
}
