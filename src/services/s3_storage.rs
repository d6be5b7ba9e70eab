//! src/services/s3_storage.rs
//!
//! S3-compatible object storage (AWS S3, Cloudflare R2, MinIO). Uses
//! path-style addressing and a generous per-operation timeout because
//! finalized uploads can be large.

use super::object_storage::{ObjectStorage, StorageError, StorageResult, ensure_path_safe};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::{Credentials, Region, timeout::TimeoutConfig},
    primitives::ByteStream,
};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    /// Custom endpoint URL (R2, MinIO). `None` targets AWS.
    pub endpoint: Option<String>,
    pub region: String,
    /// Static credentials; when absent the default provider chain is used.
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Upper bound for a single put/get, including retries.
    pub operation_timeout: Duration,
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

pub struct S3ObjectStorage {
    client: Client,
    bucket: String,
}

impl S3ObjectStorage {
    pub async fn new(settings: S3Settings) -> Self {
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .operation_timeout(settings.operation_timeout)
            .build();

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()))
            .force_path_style(true)
            .timeout_config(timeouts);

        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        match (&settings.access_key, &settings.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "ephemeral-transfer");
                builder = builder.credentials_provider(credentials);
            }
            _ => {
                let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
                if let Some(provider) = sdk_config.credentials_provider() {
                    builder = builder.credentials_provider(provider);
                }
            }
        }

        let client = Client::from_conf(builder.build());
        match client.head_bucket().bucket(&settings.bucket).send().await {
            Ok(_) => info!("Connected to S3 bucket: {}", settings.bucket),
            Err(err) => warn!(
                "Could not verify bucket {}: {}. Will attempt operations anyway.",
                settings.bucket, err
            ),
        }

        Self {
            client,
            bucket: settings.bucket,
        }
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn upload(&self, content: Bytes, path: &str) -> StorageResult<String> {
        ensure_path_safe(path)?;
        let len = content.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(content))
            .send()
            .await
            .map_err(|err| StorageError::Remote(format!("put {path}: {err}")))?;
        debug!("uploaded {} bytes to s3://{}/{}", len, self.bucket, path);
        Ok(path.to_string())
    }

    async fn get(&self, path: &str) -> StorageResult<Bytes> {
        ensure_path_safe(path)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(|service_err| service_err.is_no_such_key())
                {
                    StorageError::NotFound(path.to_string())
                } else {
                    StorageError::Remote(format!("get {path}: {err}"))
                }
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|err| StorageError::Remote(format!("read {path}: {err}")))?;
        Ok(data.into_bytes())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        ensure_path_safe(path)?;
        // DeleteObject succeeds for keys that do not exist.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|err| StorageError::Remote(format!("delete {path}: {err}")))?;
        Ok(())
    }

    async fn probe(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| StorageError::Remote(format!("head bucket: {err}")))?;
        Ok(())
    }
}
