//! Blob store capability: an opaque key → bytes namespace.

use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

pub mod s3;

#[cfg(test)]
pub mod memory;

pub use s3::S3Blob;

pub trait BlobStore: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn upload(
        &self,
        key: String,
        body: ByteStream,
        content_type: String,
        size: i64,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn upload_bytes(
        &self,
        key: String,
        data: Bytes,
        content_type: String,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn download(&self, key: String) -> impl Future<Output = Result<ByteStream, Self::Error>> + Send;

    fn download_bytes(&self, key: String) -> impl Future<Output = Result<Bytes, Self::Error>> + Send;

    fn delete(&self, key: String) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
