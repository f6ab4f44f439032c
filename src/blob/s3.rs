//! S3-compatible blob store (MinIO, garage, AWS).

use aws_config::BehaviorVersion;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::delete_object::DeleteObjectError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::{ByteStream, ByteStreamError};
use bytes::Bytes;

use super::BlobStore;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("put object: {0}")]
    Put(SdkError<PutObjectError>),
    #[error("get object: {0}")]
    Get(SdkError<GetObjectError>),
    #[error("delete object: {0}")]
    Delete(SdkError<DeleteObjectError>),
    #[error("failed to aggregate body: {0}")]
    AggregateBody(ByteStreamError),
}

/// Path-style addressing keeps self-hosted endpoints working.
pub async fn create_client(endpoint: &str, access_key: &str, secret_key: &str) -> aws_sdk_s3::Client {
    let config = aws_config::defaults(BehaviorVersion::latest())
        .endpoint_url(endpoint)
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "static",
        ))
        .region("garage")
        .load()
        .await;
    let config = aws_sdk_s3::config::Builder::from(&config)
        .force_path_style(true)
        .build();
    aws_sdk_s3::Client::from_conf(config)
}

#[derive(Clone)]
pub struct S3Blob {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Blob {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

impl BlobStore for S3Blob {
    type Error = Error;

    async fn upload(
        &self,
        key: String,
        body: ByteStream,
        content_type: String,
        size: i64,
    ) -> Result<(), Error> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .content_length(size)
            .send()
            .await
            .map_err(Error::Put)?;
        Ok(())
    }

    async fn upload_bytes(&self, key: String, data: Bytes, content_type: String) -> Result<(), Error> {
        let size = data.len() as i64;
        self.upload(key, ByteStream::from(data), content_type, size)
            .await
    }

    async fn download(&self, key: String) -> Result<ByteStream, Error> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(Error::Get)?;
        Ok(output.body)
    }

    async fn download_bytes(&self, key: String) -> Result<Bytes, Error> {
        let body = self.download(key).await?;
        let data = body.collect().await.map_err(Error::AggregateBody)?;
        Ok(data.into_bytes())
    }

    async fn delete(&self, key: String) -> Result<(), Error> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(Error::Delete)?;
        Ok(())
    }
}
