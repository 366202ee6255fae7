use serde_json::json;
use tracing::debug;

use crate::error::Error;
use crate::models::{NewPost, Post};
use crate::rest::client::RestClient;

impl RestClient {
    /// Create a post.
    pub async fn create_post(&self, post: &NewPost) -> Result<Post, Error> {
        debug!(channel_id = %post.channel_id, "creating post");
        self.post("posts", post).await
    }

    /// Replace the message text of an existing post.
    pub async fn patch_post(&self, post_id: &str, message: &str) -> Result<Post, Error> {
        self.put(&format!("posts/{post_id}/patch"), &json!({ "message": message }))
            .await
    }

    /// Delete a post.
    pub async fn delete_post(&self, post_id: &str) -> Result<(), Error> {
        self.delete(&format!("posts/{post_id}")).await
    }
}
