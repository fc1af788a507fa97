//! S3 object storage operations.

use async_trait::async_trait;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;

use super::{load_sdk_config, map_sdk_error, response_status, to_chrono};
use crate::config::{AwsConfig, AwsService};
use crate::connection::{Connector, Refreshing};
use crate::error::{require, Result, TetherError};

const MAX_KEYS_PER_PAGE: i32 = 1000;

/// Builds S3 clients, honouring a custom endpoint.
pub struct S3Connector {
    config: AwsConfig,
}

#[async_trait]
impl Connector for S3Connector {
    type Handle = Client;

    fn name(&self) -> &str {
        "s3"
    }

    async fn connect(&self) -> Result<Client> {
        let sdk_config = load_sdk_config(&self.config).await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = self.config.endpoint_for(AwsService::S3) {
            // path-style addressing is required by most S3-compatible services
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Ok(Client::from_conf(builder.build()))
    }
}

/// Listing entry with object metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSummary {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: i64,
    /// Entity tag.
    pub etag: Option<String>,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Attributes returned by a HEAD request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectAttributes {
    /// Size in bytes.
    pub content_length: Option<i64>,
    /// MIME type.
    pub content_type: Option<String>,
    /// Entity tag.
    pub etag: Option<String>,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
    /// User metadata.
    pub metadata: HashMap<String, String>,
}

/// S3 operations over a refreshing client.
#[derive(Clone)]
pub struct S3Store {
    clients: Refreshing<S3Connector>,
    region: String,
}

impl S3Store {
    /// Create a store. The client is built on first use and rebuilt after
    /// `config.expiry`.
    pub fn new(config: AwsConfig) -> Self {
        let region = config.region.clone();
        let expiry = config.expiry;
        Self {
            clients: Refreshing::new(S3Connector { config }, expiry),
            region,
        }
    }

    /// The client provider, for callers that want to run a refresher.
    pub fn clients(&self) -> &Refreshing<S3Connector> {
        &self.clients
    }

    /// Create a bucket in the configured region.
    pub async fn create_bucket(&self, bucket: &str) -> Result<()> {
        require("bucket", bucket)?;
        let region = self.region.clone();
        self.clients
            .with_handle(|client| async move {
                let mut request = client.create_bucket().bucket(bucket);
                // us-east-1 rejects an explicit location constraint
                if region != "us-east-1" {
                    request = request.create_bucket_configuration(
                        CreateBucketConfiguration::builder()
                            .location_constraint(BucketLocationConstraint::from(region.as_str()))
                            .build(),
                    );
                }
                request
                    .send()
                    .await
                    .map_err(|ref err| map_sdk_error(err, TetherError::Storage))?;
                tracing::info!(bucket, "Bucket created");
                Ok(())
            })
            .await
    }

    /// Upload bytes to `bucket/key`, returning the entity tag.
    pub async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<String> {
        require("bucket", bucket)?;
        require("key", key)?;
        self.clients
            .with_handle(|client| async move {
                let response = client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .body(ByteStream::from(body))
                    .send()
                    .await
                    .map_err(|ref err| map_sdk_error(err, TetherError::Storage))?;
                Ok(response.e_tag().map(ToString::to_string).unwrap_or_default())
            })
            .await
    }

    /// Upload a local file to `bucket/key`.
    pub async fn upload_file(&self, bucket: &str, key: &str, path: impl AsRef<Path>) -> Result<String> {
        require("bucket", bucket)?;
        require("key", key)?;
        let path = path.as_ref();
        let body = ByteStream::from_path(path).await.map_err(|e| {
            TetherError::InvalidInput(format!("cannot read {}: {e}", path.display()))
        })?;

        self.clients
            .with_handle(|client| async move {
                let response = client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .body(body)
                    .send()
                    .await
                    .map_err(|ref err| map_sdk_error(err, TetherError::Storage))?;
                tracing::debug!(bucket, key, "File uploaded");
                Ok(response.e_tag().map(ToString::to_string).unwrap_or_default())
            })
            .await
    }

    /// Download `bucket/key` into a local file. Returns `false` when the
    /// object does not exist, leaving `path` untouched.
    pub async fn download_file(&self, bucket: &str, key: &str, path: impl AsRef<Path>) -> Result<bool> {
        let Some(body) = self.get_object(bucket, key).await? else {
            return Ok(false);
        };
        tokio::fs::write(path.as_ref(), body)
            .await
            .map_err(|e| TetherError::Storage(format!("cannot write {}: {e}", path.as_ref().display())))?;
        Ok(true)
    }

    /// Fetch an object's bytes, or `None` if it does not exist.
    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        require("bucket", bucket)?;
        require("key", key)?;
        self.clients
            .with_handle(|client| async move {
                let response = match client.get_object().bucket(bucket).key(key).send().await {
                    Ok(response) => response,
                    Err(err) => {
                        let missing = matches!(err.as_service_error(), Some(GetObjectError::NoSuchKey(_)))
                            || response_status(&err) == Some(404);
                        if missing {
                            return Ok(None);
                        }
                        return Err(map_sdk_error(&err, TetherError::Storage));
                    }
                };

                let body = response
                    .body
                    .collect()
                    .await
                    .map_err(|err| TetherError::Storage(format!("Failed to read body: {err}")))?
                    .into_bytes()
                    .to_vec();
                Ok(Some(body))
            })
            .await
    }

    /// Object attributes, or `None` if it does not exist.
    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectAttributes>> {
        require("bucket", bucket)?;
        require("key", key)?;
        self.clients
            .with_handle(|client| async move {
                match client.head_object().bucket(bucket).key(key).send().await {
                    Ok(out) => Ok(Some(ObjectAttributes {
                        content_length: out.content_length(),
                        content_type: out.content_type().map(ToString::to_string),
                        etag: out.e_tag().map(ToString::to_string),
                        last_modified: out.last_modified().and_then(to_chrono),
                        metadata: out.metadata().cloned().unwrap_or_default(),
                    })),
                    Err(err) => {
                        let missing = matches!(err.as_service_error(), Some(HeadObjectError::NotFound(_)))
                            || response_status(&err) == Some(404);
                        if missing {
                            Ok(None)
                        } else {
                            Err(map_sdk_error(&err, TetherError::Storage))
                        }
                    }
                }
            })
            .await
    }

    /// Delete an object. Deleting a missing key is not an error.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        require("bucket", bucket)?;
        require("key", key)?;
        self.clients
            .with_handle(|client| async move {
                client
                    .delete_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|ref err| map_sdk_error(err, TetherError::Storage))?;
                Ok(())
            })
            .await
    }

    /// All keys under `prefix`, following continuation tokens.
    pub async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .list_objects_detailed(bucket, prefix)
            .await?
            .into_iter()
            .map(|summary| summary.key)
            .collect())
    }

    /// All objects under `prefix` with their size, tag and modification time.
    pub async fn list_objects_detailed(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        require("bucket", bucket)?;
        self.clients
            .with_handle(|client| async move {
                let mut objects = Vec::new();
                let mut continuation_token: Option<String> = None;

                loop {
                    let response = client
                        .list_objects_v2()
                        .bucket(bucket)
                        .prefix(prefix)
                        .max_keys(MAX_KEYS_PER_PAGE)
                        .set_continuation_token(continuation_token.take())
                        .send()
                        .await
                        .map_err(|ref err| map_sdk_error(err, TetherError::Storage))?;

                    objects.extend(response.contents().iter().filter_map(|obj| {
                        Some(ObjectSummary {
                            key: obj.key()?.to_string(),
                            size: obj.size().unwrap_or_default(),
                            etag: obj.e_tag().map(ToString::to_string),
                            last_modified: obj.last_modified().and_then(to_chrono),
                        })
                    }));

                    match response.next_continuation_token() {
                        Some(token) if response.is_truncated().unwrap_or(false) => {
                            continuation_token = Some(token.to_string());
                        }
                        _ => break,
                    }
                }

                Ok(objects)
            })
            .await
    }
}
