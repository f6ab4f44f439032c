//! In-memory blob store used by the pipeline tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aws_sdk_s3::primitives::{ByteStream, ByteStreamError};
use bytes::Bytes;

use super::BlobStore;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no object at {0}")]
    Missing(String),
    #[error("failed to aggregate body: {0}")]
    AggregateBody(ByteStreamError),
}

#[derive(Clone, Default)]
pub struct MemoryBlob {
    objects: Arc<Mutex<HashMap<String, (Bytes, String)>>>,
}

impl MemoryBlob {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(data, _)| data.clone())
    }
}

impl BlobStore for MemoryBlob {
    type Error = Error;

    async fn upload(
        &self,
        key: String,
        body: ByteStream,
        content_type: String,
        _size: i64,
    ) -> Result<(), Error> {
        let data = body
            .collect()
            .await
            .map_err(Error::AggregateBody)?
            .into_bytes();
        self.objects
            .lock()
            .unwrap()
            .insert(key, (data, content_type));
        Ok(())
    }

    async fn upload_bytes(&self, key: String, data: Bytes, content_type: String) -> Result<(), Error> {
        self.objects
            .lock()
            .unwrap()
            .insert(key, (data, content_type));
        Ok(())
    }

    async fn download(&self, key: String) -> Result<ByteStream, Error> {
        let data = self.get(&key).ok_or(Error::Missing(key))?;
        Ok(ByteStream::from(data))
    }

    async fn download_bytes(&self, key: String) -> Result<Bytes, Error> {
        self.get(&key).ok_or(Error::Missing(key))
    }

    async fn delete(&self, key: String) -> Result<(), Error> {
        self.objects.lock().unwrap().remove(&key);
        Ok(())
    }
}
