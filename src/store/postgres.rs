//! PostgreSQL metadata store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgQueryResult};
use sqlx::{PgExecutor, Postgres, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::entity::{EventStatus, Image, ImageStatus, OutboxEvent};

use super::{MetadataSession, MetadataStore, StoreError, TxFuture};

#[derive(Clone)]
pub struct PgMetadata {
    pool: PgPool,
}

impl PgMetadata {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Transaction handle yielded by [`PgMetadata::within_transaction`].
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[derive(sqlx::FromRow)]
struct ImageRow {
    id: Uuid,
    original_key: String,
    processed_key: Option<String>,
    original_name: String,
    content_type: String,
    size: i64,
    status: String,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<ImageRow> for Image {
    type Error = StoreError;

    fn try_from(row: ImageRow) -> Result<Self, StoreError> {
        let status = ImageStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Backend(format!("bad image status: {}", row.status)))?;
        Ok(Image {
            id: row.id,
            original_key: row.original_key,
            processed_key: row.processed_key,
            original_name: row.original_name,
            content_type: row.content_type,
            size: row.size,
            status,
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    aggregate_id: Uuid,
    payload: Vec<u8>,
    status: String,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    retry_count: i32,
}

impl TryFrom<EventRow> for OutboxEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, StoreError> {
        let status = EventStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Backend(format!("bad event status: {}", row.status)))?;
        Ok(OutboxEvent {
            id: row.id,
            aggregate_id: row.aggregate_id,
            payload: row.payload,
            status,
            created_at: row.created_at,
            processed_at: row.processed_at,
            retry_count: row.retry_count,
        })
    }
}

fn affected(result: PgQueryResult) -> Result<(), StoreError> {
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound);
    }
    Ok(())
}

async fn insert_image(exec: impl PgExecutor<'_>, image: &Image) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO images \
         (id, original_key, original_name, content_type, size, status, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(image.id)
    .bind(&image.original_key)
    .bind(&image.original_name)
    .bind(&image.content_type)
    .bind(image.size)
    .bind(image.status.as_str())
    .bind(image.created_at)
    .execute(exec)
    .await?;
    Ok(())
}

async fn select_image(exec: impl PgExecutor<'_>, id: Uuid) -> Result<Image, StoreError> {
    let row = sqlx::query_as::<_, ImageRow>(
        "SELECT id, original_key, processed_key, original_name, content_type, size, \
         status, created_at, processed_at FROM images WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(exec)
    .await?
    .ok_or(StoreError::NotFound)?;
    row.try_into()
}

async fn update_image(exec: impl PgExecutor<'_>, image: &Image) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE images SET processed_key = $2, status = $3, processed_at = $4 WHERE id = $1",
    )
    .bind(image.id)
    .bind(&image.processed_key)
    .bind(image.status.as_str())
    .bind(image.processed_at)
    .execute(exec)
    .await?;
    affected(result)
}

async fn delete_image(exec: impl PgExecutor<'_>, id: Uuid) -> Result<(), StoreError> {
    let result = sqlx::query("DELETE FROM images WHERE id = $1")
        .bind(id)
        .execute(exec)
        .await?;
    affected(result)
}

async fn select_processed_artifact(
    exec: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<(String, String), StoreError> {
    sqlx::query_as::<_, (String, String)>(
        "SELECT processed_key, content_type FROM images \
         WHERE id = $1 AND status = 'processed' AND processed_key IS NOT NULL",
    )
    .bind(id)
    .fetch_optional(exec)
    .await?
    .ok_or(StoreError::NotFound)
}

async fn insert_event(exec: impl PgExecutor<'_>, event: &OutboxEvent) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO images_outbox \
         (id, aggregate_id, payload, status, created_at, retry_count) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(event.id)
    .bind(event.aggregate_id)
    .bind(&event.payload)
    .bind(event.status.as_str())
    .bind(event.created_at)
    .bind(event.retry_count)
    .execute(exec)
    .await?;
    Ok(())
}

async fn select_pending(
    exec: impl PgExecutor<'_>,
    max_retries: i32,
    limit: i64,
) -> Result<Vec<OutboxEvent>, StoreError> {
    let rows = sqlx::query_as::<_, EventRow>(
        "SELECT id, aggregate_id, payload, status, created_at, processed_at, retry_count \
         FROM images_outbox WHERE status = 'pending' AND retry_count < $1 \
         ORDER BY created_at ASC LIMIT $2",
    )
    .bind(max_retries)
    .bind(limit)
    .fetch_all(exec)
    .await?;
    rows.into_iter().map(OutboxEvent::try_from).collect()
}

async fn mark_status(
    exec: impl PgExecutor<'_>,
    ids: &[Uuid],
    status: EventStatus,
    stamp: Option<DateTime<Utc>>,
) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE images_outbox SET status = $2, processed_at = COALESCE($3, processed_at) \
         WHERE id = ANY($1)",
    )
    .bind(ids)
    .bind(status.as_str())
    .bind(stamp)
    .execute(exec)
    .await?;
    affected(result)
}

async fn increment_retry(exec: impl PgExecutor<'_>, ids: &[Uuid]) -> Result<(), StoreError> {
    let result = sqlx::query(
        "UPDATE images_outbox SET retry_count = retry_count + 1, status = 'pending' \
         WHERE id = ANY($1)",
    )
    .bind(ids)
    .execute(exec)
    .await?;
    affected(result)
}

async fn mark_exhausted_failed(
    exec: impl PgExecutor<'_>,
    max_retries: i32,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "UPDATE images_outbox SET status = 'failed' \
         WHERE status = 'pending' AND retry_count >= $1",
    )
    .bind(max_retries)
    .execute(exec)
    .await?;
    Ok(result.rows_affected())
}

async fn release_stale_claims(
    exec: impl PgExecutor<'_>,
    cutoff: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "UPDATE images_outbox SET status = 'pending', retry_count = retry_count + 1 \
         WHERE status = 'processing' AND processed_at < $1",
    )
    .bind(cutoff)
    .execute(exec)
    .await?;
    Ok(result.rows_affected())
}

async fn delete_terminal(
    exec: impl PgExecutor<'_>,
    cutoff: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let result = sqlx::query(
        "DELETE FROM images_outbox WHERE status IN ('processed', 'failed') \
         AND COALESCE(processed_at, created_at) < $1",
    )
    .bind(cutoff)
    .execute(exec)
    .await?;
    Ok(result.rows_affected())
}

fn age_cutoff(age: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero())
}

impl MetadataSession for PgMetadata {
    async fn create_image(&mut self, image: &Image) -> Result<(), StoreError> {
        insert_image(&self.pool, image).await
    }

    async fn image(&mut self, id: Uuid) -> Result<Image, StoreError> {
        select_image(&self.pool, id).await
    }

    async fn update_image(&mut self, image: &Image) -> Result<(), StoreError> {
        update_image(&self.pool, image).await
    }

    async fn delete_image(&mut self, id: Uuid) -> Result<(), StoreError> {
        delete_image(&self.pool, id).await
    }

    async fn processed_artifact(&mut self, id: Uuid) -> Result<(String, String), StoreError> {
        select_processed_artifact(&self.pool, id).await
    }

    async fn create_event(&mut self, event: &OutboxEvent) -> Result<(), StoreError> {
        insert_event(&self.pool, event).await
    }

    async fn pending_events(
        &mut self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        select_pending(&self.pool, max_retries, limit).await
    }

    async fn mark_processing(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        mark_status(&self.pool, ids, EventStatus::Processing, Some(Utc::now())).await
    }

    async fn mark_processed(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        mark_status(&self.pool, ids, EventStatus::Processed, Some(Utc::now())).await
    }

    async fn mark_failed(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        mark_status(&self.pool, ids, EventStatus::Failed, None).await
    }

    async fn increment_retry(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        increment_retry(&self.pool, ids).await
    }

    async fn mark_exhausted_failed(&mut self, max_retries: i32) -> Result<u64, StoreError> {
        mark_exhausted_failed(&self.pool, max_retries).await
    }

    async fn release_stale_claims(&mut self, lease: Duration) -> Result<u64, StoreError> {
        release_stale_claims(&self.pool, age_cutoff(lease)).await
    }

    async fn delete_terminal(&mut self, retention: Duration) -> Result<u64, StoreError> {
        delete_terminal(&self.pool, age_cutoff(retention)).await
    }
}

impl MetadataSession for PgTx {
    async fn create_image(&mut self, image: &Image) -> Result<(), StoreError> {
        insert_image(&mut *self.tx, image).await
    }

    async fn image(&mut self, id: Uuid) -> Result<Image, StoreError> {
        select_image(&mut *self.tx, id).await
    }

    async fn update_image(&mut self, image: &Image) -> Result<(), StoreError> {
        update_image(&mut *self.tx, image).await
    }

    async fn delete_image(&mut self, id: Uuid) -> Result<(), StoreError> {
        delete_image(&mut *self.tx, id).await
    }

    async fn processed_artifact(&mut self, id: Uuid) -> Result<(String, String), StoreError> {
        select_processed_artifact(&mut *self.tx, id).await
    }

    async fn create_event(&mut self, event: &OutboxEvent) -> Result<(), StoreError> {
        insert_event(&mut *self.tx, event).await
    }

    async fn pending_events(
        &mut self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        select_pending(&mut *self.tx, max_retries, limit).await
    }

    async fn mark_processing(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        mark_status(&mut *self.tx, ids, EventStatus::Processing, Some(Utc::now())).await
    }

    async fn mark_processed(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        mark_status(&mut *self.tx, ids, EventStatus::Processed, Some(Utc::now())).await
    }

    async fn mark_failed(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        mark_status(&mut *self.tx, ids, EventStatus::Failed, None).await
    }

    async fn increment_retry(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        increment_retry(&mut *self.tx, ids).await
    }

    async fn mark_exhausted_failed(&mut self, max_retries: i32) -> Result<u64, StoreError> {
        mark_exhausted_failed(&mut *self.tx, max_retries).await
    }

    async fn release_stale_claims(&mut self, lease: Duration) -> Result<u64, StoreError> {
        release_stale_claims(&mut *self.tx, age_cutoff(lease)).await
    }

    async fn delete_terminal(&mut self, retention: Duration) -> Result<u64, StoreError> {
        delete_terminal(&mut *self.tx, age_cutoff(retention)).await
    }
}

impl MetadataStore for PgMetadata {
    type Tx = PgTx;

    async fn within_transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut PgTx) -> TxFuture<'t, T> + Send,
    {
        let tx = self.pool.begin().await?;
        let mut session = PgTx { tx };
        match f(&mut session).await {
            Ok(value) => {
                session.tx.commit().await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback) = session.tx.rollback().await {
                    warn!(%rollback, "transaction rollback failed");
                }
                Err(error)
            }
        }
    }
}
