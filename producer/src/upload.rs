use std::time::Duration;

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use tracing::debug;

/// Posts frames to the server's `/upload_video` endpoint.
pub struct Uploader {
    client: reqwest::Client,
    url: String,
}

impl Uploader {
    pub fn new(url: &str) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(UploadError::Http)?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    /// Send one JPEG as multipart field `video`.
    pub async fn upload(&self, seq: u64, jpeg: Bytes) -> Result<(), UploadError> {
        let size = jpeg.len();
        let part = Part::stream(jpeg)
            .file_name("frame.jpg")
            .mime_str("image/jpeg")
            .map_err(UploadError::Http)?;
        let form = Form::new().part("video", part);

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await
            .map_err(UploadError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(seq, bytes = size, "frame uploaded");
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload request failed: {0}")]
    Http(reqwest::Error),
    #[error("server rejected frame with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}
