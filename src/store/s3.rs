use super::BlobStore;
use crate::config::S3Config;
use crate::error::AppResult;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::sync::Arc;

/// Attachment blobs in an S3 bucket
#[derive(Clone)]
pub struct S3BlobStore {
    client: Arc<Client>,
    config: S3Config,
}

impl S3BlobStore {
    pub fn new(client: Arc<Client>, config: S3Config) -> Self {
        Self { client, config }
    }

    /// Build a client from the ambient AWS configuration, honouring a custom endpoint
    pub async fn from_config(config: S3Config) -> Self {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());
        tracing::info!(bucket = %config.bucket, region = %config.region, "s3 blob store ready");
        Self::new(Arc::new(client), config)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, path: &str, content_type: &str, bytes: Bytes) -> AppResult<String> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(path)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await?;
        Ok(self.config.object_url(path))
    }

    async fn delete(&self, path: &str) -> AppResult<()> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(path)
            .send()
            .await?;
        Ok(())
    }
}
