// File endpoints
//
// Uploads are multipart (`channel_id` + one `files` part). Public links may
// be disabled server-side, in which case callers fall back to the
// authenticated download URL.

use bytes::Bytes;
use reqwest::Method;
use reqwest::multipart::{Form, Part};
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::models::{FileInfo, FileLink, FileUploadResponse};
use crate::rest::client::{RestClient, parse_json};

impl RestClient {
    /// Upload one file into a channel and return its metadata.
    pub async fn upload_file(
        &self,
        channel_id: &str,
        file_name: &str,
        data: Bytes,
    ) -> Result<FileInfo, Error> {
        let url = self.api_url("files")?;
        debug!(channel_id, file_name, size = data.len(), "uploading file");

        let form = Form::new()
            .text("channel_id", channel_id.to_owned())
            .part("files", Part::stream(data).file_name(file_name.to_owned()));

        let resp = self.request(Method::POST, url).multipart(form).send().await?;
        let uploaded: FileUploadResponse = parse_json(resp).await?;
        uploaded
            .file_infos
            .into_iter()
            .next()
            .ok_or_else(|| Error::Deserialization {
                message: "upload response contained no file_infos".into(),
                body: String::new(),
            })
    }

    /// Public link for a file.
    pub async fn file_link(&self, file_id: &str) -> Result<String, Error> {
        let link: FileLink = self.get(&format!("files/{file_id}/link")).await?;
        Ok(link.link)
    }

    /// Authenticated download URL for a file.
    pub fn file_download_url(&self, file_id: &str) -> Result<Url, Error> {
        self.api_url(&format!("files/{file_id}"))
    }
}
