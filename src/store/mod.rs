//! Metadata store capability.
//!
//! Record-level operations live on [`MetadataSession`] so that the same code
//! runs against the connection pool or inside a transaction handle; the
//! transaction scope itself is [`MetadataStore::within_transaction`], which
//! passes the handle explicitly instead of hiding it in ambient state.

use std::pin::Pin;
use std::time::Duration;

use uuid::Uuid;

use crate::entity::{Image, OutboxEvent};

pub mod postgres;

#[cfg(test)]
pub mod memory;

pub use postgres::PgMetadata;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("metadata backend: {0}")]
    Backend(String),
}

pub type TxFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 't>>;

/// Operations on the `images` and `images_outbox` tables, available both on
/// the default pool and on a transaction handle.
pub trait MetadataSession: Send {
    fn create_image(
        &mut self,
        image: &Image,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn image(&mut self, id: Uuid) -> impl Future<Output = Result<Image, StoreError>> + Send;

    /// Persist the processed-artifact fields of an image row.
    fn update_image(
        &mut self,
        image: &Image,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Delete an image row; outbox rows cascade.
    fn delete_image(&mut self, id: Uuid) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Processed key and content type of an image, only once it has been
    /// processed.
    fn processed_artifact(
        &mut self,
        id: Uuid,
    ) -> impl Future<Output = Result<(String, String), StoreError>> + Send;

    fn create_event(
        &mut self,
        event: &OutboxEvent,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Pending events with a remaining retry budget, oldest first.
    fn pending_events(
        &mut self,
        max_retries: i32,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<OutboxEvent>, StoreError>> + Send;

    /// Claim a batch: `pending` rows become `processing` and are stamped so
    /// the claim can expire.
    fn mark_processing(
        &mut self,
        ids: &[Uuid],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn mark_processed(
        &mut self,
        ids: &[Uuid],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn mark_failed(&mut self, ids: &[Uuid])
    -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Failed publish: bump the retry counter and return the rows to
    /// `pending`.
    fn increment_retry(
        &mut self,
        ids: &[Uuid],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Sweep rows whose retry budget is exhausted into `failed`. Returns the
    /// affected count.
    fn mark_exhausted_failed(
        &mut self,
        max_retries: i32,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Return rows stuck in `processing` longer than `lease` to `pending`,
    /// counting the lost attempt against their retry budget.
    fn release_stale_claims(
        &mut self,
        lease: Duration,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Delete terminal rows older than `retention`. Returns the affected
    /// count.
    fn delete_terminal(
        &mut self,
        retention: Duration,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// A session factory with a scoped transaction primitive.
pub trait MetadataStore: MetadataSession + Clone + Send + Sync + 'static {
    type Tx: MetadataSession;

    /// Run `f` with a transaction handle. Commits when `f` returns `Ok`,
    /// rolls back when it returns `Err`; an abandoned handle (panic inside
    /// `f`) rolls back through the driver's drop guard.
    fn within_transaction<T, F>(&self, f: F) -> impl Future<Output = Result<T, StoreError>> + Send
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Self::Tx) -> TxFuture<'t, T> + Send;
}
