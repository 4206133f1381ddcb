use std::path::{Path, PathBuf};

use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_types::region::Region;
use speed_trap_common::config::S3Config;
use tracing::{debug, info};

/// URL path under which locally stored evidence images are served.
pub const LOCAL_MOUNT: &str = "/overspeeding";

/// Where evidence images live. Keys are relative, `/`-separated paths such as
/// `cars/2025-03-01/01-03-2025-14-05-09-123456_4.jpeg`.
pub enum ImageStore {
    Local(LocalStore),
    S3(S3Store),
}

impl ImageStore {
    pub async fn put(&self, key: &str, jpeg: Vec<u8>) -> Result<(), StorageError> {
        check_key(key)?;
        match self {
            Self::Local(store) => store.put(key, jpeg).await,
            Self::S3(store) => store.put(key, jpeg).await,
        }
    }

    /// Remove the image. Deleting a key that does not exist succeeds.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        check_key(key)?;
        match self {
            Self::Local(store) => store.delete(key).await,
            Self::S3(store) => store.delete(key).await,
        }
    }

    /// Absolute URL a client can fetch the image from.
    pub fn public_url(&self, key: &str) -> String {
        let (base, key) = match self {
            Self::Local(store) => (store.base_url.as_str(), key),
            Self::S3(store) => (store.public_url.as_str(), key),
        };
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }
}

pub struct LocalStore {
    root: PathBuf,
    base_url: String,
}

impl LocalStore {
    /// `public_base_url` is the server's externally visible address; images
    /// are served below [`LOCAL_MOUNT`].
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Self {
        Self {
            root: root.into(),
            base_url: format!("{}{LOCAL_MOUNT}", public_base_url.trim_end_matches('/')),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn put(&self, key: &str, jpeg: Vec<u8>) -> Result<(), StorageError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Put(format!("{}: {e}", parent.display())))?;
        }
        let size = jpeg.len();
        tokio::fs::write(&path, jpeg)
            .await
            .map_err(|e| StorageError::Put(format!("{}: {e}", path.display())))?;
        debug!(key, size, "stored evidence image on disk");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.root.join(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key, "deleted evidence image from disk");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(key, "evidence image already gone");
                Ok(())
            }
            Err(e) => Err(StorageError::Delete(format!("{}: {e}", path.display()))),
        }
    }
}

/// S3-compatible object storage (MinIO, AWS).
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    public_url: String,
}

impl S3Store {
    pub async fn new(config: &S3Config) -> Self {
        let creds = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "static",
        );

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .credentials_provider(creds)
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        let public_url = config.public_url.clone().unwrap_or_else(|| {
            format!("{}/{}", config.endpoint.trim_end_matches('/'), config.bucket)
        });

        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            public_url,
        }
    }

    /// Ensure the bucket exists, creating it if necessary.
    pub async fn ensure_bucket(&self) -> Result<(), StorageError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!(bucket = self.bucket, "bucket exists");
                Ok(())
            }
            Err(_) => {
                info!(bucket = self.bucket, "creating bucket");
                self.client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .map_err(|e| StorageError::CreateBucket(e.to_string()))?;
                info!(bucket = self.bucket, "bucket created");
                Ok(())
            }
        }
    }

    async fn put(&self, key: &str, jpeg: Vec<u8>) -> Result<(), StorageError> {
        let size = jpeg.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("image/jpeg")
            .body(ByteStream::from(jpeg))
            .send()
            .await
            .map_err(|e| StorageError::Put(e.to_string()))?;
        debug!(key, size, bucket = self.bucket, "stored evidence image in bucket");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::Delete(e.to_string()))?;
        debug!(key, bucket = self.bucket, "deleted evidence image from bucket");
        Ok(())
    }
}

/// Keys must stay inside the store: relative, no `..`, no empty segments.
fn check_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to create bucket: {0}")]
    CreateBucket(String),
    #[error("failed to store image: {0}")]
    Put(String),
    #[error("failed to delete image: {0}")]
    Delete(String),
    #[error("invalid image key {0:?}")]
    InvalidKey(String),
}
