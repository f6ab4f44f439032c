//! Image service: upload, processed-artifact commit, delete, and the outbox
//! passthroughs the relay drives.
//!
//! There is no transaction spanning the blob store and the metadata store.
//! The upload path writes the blob first, then commits both rows in one
//! metadata transaction, and compensates with a blob delete when the
//! transaction fails; the worst outcome is an orphan blob, never metadata
//! without its object.

use std::time::Duration;

use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::entity::{self, Image, ImageStatus, JobPayload, Operation, OutboxEvent};
use crate::store::{MetadataSession, MetadataStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError<BE> {
    #[error("metadata store: {0}")]
    Metadata(#[from] StoreError),
    #[error("blob store: {0}")]
    Blob(BE),
    #[error("encode job payload: {0}")]
    EncodePayload(#[from] serde_json::Error),
}

impl<BE> ServiceError<BE> {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Metadata(StoreError::NotFound))
    }
}

#[derive(Clone)]
pub struct ImageService<M, B> {
    metadata: M,
    blob: B,
}

impl<M: MetadataStore, B: BlobStore> ImageService<M, B> {
    pub fn new(metadata: M, blob: B) -> Self {
        Self { metadata, blob }
    }

    /// Upload an original and enqueue its transformation job.
    ///
    /// Blob first: a failure here leaks nothing. Then image row and outbox
    /// row in one transaction; when that fails the blob is deleted again.
    pub async fn upload(
        &mut self,
        data: Bytes,
        original_name: String,
        content_type: String,
        operation: Operation,
    ) -> Result<Image, ServiceError<B::Error>> {
        let id = Uuid::new_v4();
        let original_key = entity::original_key(id);
        let size = data.len() as i64;

        let image = Image {
            id,
            original_key: original_key.clone(),
            processed_key: None,
            original_name,
            content_type: content_type.clone(),
            size,
            status: ImageStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
        };
        let payload = serde_json::to_vec(&JobPayload::new(&image, &operation))?;
        let event = OutboxEvent::new(id, payload);

        self.blob
            .upload(
                original_key.clone(),
                ByteStream::from(data),
                content_type,
                size,
            )
            .await
            .map_err(ServiceError::Blob)?;

        let committed = self
            .metadata
            .within_transaction({
                let image = image.clone();
                let event = event.clone();
                move |tx| {
                    Box::pin(async move {
                        tx.create_image(&image).await?;
                        tx.create_event(&event).await?;
                        Ok(())
                    })
                }
            })
            .await;

        if let Err(error) = committed {
            // Compensate: without its rows the blob is unreachable garbage.
            if let Err(delete) = self.blob.delete(original_key).await {
                error!(%delete, image = %id, "failed to delete blob after aborted upload");
            }
            return Err(error.into());
        }

        Ok(image)
    }

    /// Commit the processed artifact. Safe under redelivery: the blob write
    /// targets a fixed key and the row update sets the same final state.
    pub async fn upload_processed(
        &mut self,
        id: Uuid,
        data: Bytes,
    ) -> Result<(), ServiceError<B::Error>> {
        let mut image = self.metadata.image(id).await?;
        let processed_key = entity::processed_key(id);

        self.blob
            .upload_bytes(processed_key.clone(), data, image.content_type.clone())
            .await
            .map_err(ServiceError::Blob)?;

        image.processed_key = Some(processed_key.clone());
        image.status = ImageStatus::Processed;
        image.processed_at = Some(Utc::now());

        if let Err(error) = self.metadata.update_image(&image).await {
            if let Err(delete) = self.blob.delete(processed_key).await {
                error!(%delete, image = %id, "failed to delete processed blob after aborted update");
            }
            return Err(error.into());
        }

        Ok(())
    }

    /// Delete an image. Metadata goes first so nothing can keep processing
    /// against the blobs; blob deletes are best effort.
    pub async fn delete(&mut self, id: Uuid) -> Result<(), ServiceError<B::Error>> {
        let image = self.metadata.image(id).await?;
        self.metadata.delete_image(id).await?;

        if let Err(error) = self.blob.delete(image.original_key.clone()).await {
            warn!(%error, key = image.original_key, "failed to delete original blob");
        }
        if let Some(processed_key) = image.processed_key {
            if let Err(error) = self.blob.delete(processed_key.clone()).await {
                warn!(%error, key = processed_key, "failed to delete processed blob");
            }
        }
        Ok(())
    }

    pub async fn download(&self, key: String) -> Result<ByteStream, ServiceError<B::Error>> {
        self.blob.download(key).await.map_err(ServiceError::Blob)
    }

    pub async fn download_bytes(&self, key: String) -> Result<Bytes, ServiceError<B::Error>> {
        self.blob
            .download_bytes(key)
            .await
            .map_err(ServiceError::Blob)
    }

    /// Current metadata row for an image.
    pub async fn image(&mut self, id: Uuid) -> Result<Image, ServiceError<B::Error>> {
        Ok(self.metadata.image(id).await?)
    }

    /// Processed key and content type, available once the controller has
    /// committed.
    pub async fn processed_artifact(
        &mut self,
        id: Uuid,
    ) -> Result<(String, String), ServiceError<B::Error>> {
        Ok(self.metadata.processed_artifact(id).await?)
    }

    pub async fn pending_events(
        &mut self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        self.metadata.pending_events(max_retries, limit).await
    }

    pub async fn mark_processing(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        self.metadata.mark_processing(ids).await
    }

    pub async fn mark_processed(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        self.metadata.mark_processed(ids).await
    }

    pub async fn increment_retry(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        self.metadata.increment_retry(ids).await
    }

    pub async fn mark_exhausted_failed(&mut self, max_retries: i32) -> Result<u64, StoreError> {
        self.metadata.mark_exhausted_failed(max_retries).await
    }

    pub async fn release_stale_claims(&mut self, lease: Duration) -> Result<u64, StoreError> {
        self.metadata.release_stale_claims(lease).await
    }

    /// Drop terminal outbox rows past the retention window.
    pub async fn cleanup_outbox(&mut self, retention: Duration) -> Result<(), StoreError> {
        let count = self.metadata.delete_terminal(retention).await?;
        if count > 0 {
            info!(count, "deleted old outbox events");
        }
        Ok(())
    }
}
