use crate::config::StorageConfig;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::profile::profile_file::{ProfileFileKind, ProfileFiles};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, instrument};

/// Image extensions accepted for upload
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["jpeg", "jpg", "png"];

/// Errors raised while pushing an image to the bucket
#[derive(Debug, Error)]
pub enum StorageError {
    /// The path is kept for logs and never rendered into the message
    #[error("Failed to upload image. File not found.")]
    FileNotFound(PathBuf),

    #[error("Unsupported file format. Only JPEG, JPG and PNG are supported.")]
    UnsupportedFormat(String),

    #[error("Failed to upload image. A server error occurred.")]
    UploadFailed,
}

/// Destination for diagnosed images
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageStorage: Send + Sync {
    /// Upload `local_path` under a key derived from `file_name` and return its public URL
    async fn upload(&self, local_path: &Path, file_name: &str) -> Result<String, StorageError>;
}

/// S3-compatible bucket client
pub struct S3ImageStorage {
    client: S3Client,
    bucket: String,
    public_host: String,
}

impl S3ImageStorage {
    /// Create a new storage client
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        // Service account credentials live in a shared credentials file
        if let Some(ref credentials_file) = config.credentials_file {
            let profile_files = ProfileFiles::builder()
                .with_file(ProfileFileKind::Credentials, credentials_file)
                .build();
            loader = loader.profile_files(profile_files);
        }

        let aws_config = loader.load().await;
        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            endpoint = ?config.endpoint_url,
            "Object storage client initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            public_host: config.public_host.clone(),
        })
    }
}

#[async_trait]
impl ImageStorage for S3ImageStorage {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn upload(&self, local_path: &Path, file_name: &str) -> Result<String, StorageError> {
        let extension = validate_source(local_path, file_name)?;
        let key = storage_key(Utc::now().timestamp_millis(), file_name);

        info!(local_path = %local_path.display(), key = %key, "Uploading image");

        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            error!(error = %e, local_path = %local_path.display(), "Failed to open image stream");
            StorageError::UploadFailed
        })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .content_type(content_type(&extension))
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, key = %key, "Failed to upload image");
                StorageError::UploadFailed
            })?;

        info!(key = %key, "Image uploaded");

        Ok(public_url(&self.public_host, &self.bucket, &key))
    }
}

/// Lowercased extension of `file_name` when it is an accepted image type
pub fn allowed_extension(file_name: &str) -> Option<String> {
    let extension = Path::new(file_name).extension()?.to_str()?.to_lowercase();

    ALLOWED_EXTENSIONS
        .contains(&extension.as_str())
        .then_some(extension)
}

/// Check the staged file exists and carries an accepted extension
fn validate_source(local_path: &Path, file_name: &str) -> Result<String, StorageError> {
    if !local_path.exists() {
        error!(local_path = %local_path.display(), "Image file not found");
        return Err(StorageError::FileNotFound(local_path.to_path_buf()));
    }

    allowed_extension(file_name).ok_or_else(|| {
        let extension = Path::new(file_name)
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        error!(extension = %extension, "Unsupported image format");
        StorageError::UnsupportedFormat(extension)
    })
}

/// Millisecond prefix keeps same-named uploads from colliding
fn storage_key(epoch_millis: i64, file_name: &str) -> String {
    format!("{}-{}", epoch_millis, file_name)
}

fn public_url(host: &str, bucket: &str, key: &str) -> String {
    format!("https://{}/{}/{}", host, bucket, key)
}

fn content_type(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}
