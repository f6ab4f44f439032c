//! In-memory metadata store used by the pipeline tests.
//!
//! Mirrors the SQL semantics of the Postgres adapter, including zero-row
//! detection and the cascade from `images` to `images_outbox`. Transactions
//! stage a copy of the state and swap it in on commit, so a failing closure
//! observes a rollback. Fault switches let tests fail every operation or
//! only the image UPDATE.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entity::{EventStatus, Image, ImageStatus, OutboxEvent};

use super::{MetadataSession, MetadataStore, StoreError, TxFuture};

#[derive(Default, Clone)]
struct State {
    images: HashMap<Uuid, Image>,
    events: Vec<OutboxEvent>,
}

#[derive(Default)]
struct Faults {
    fail_all: AtomicBool,
    fail_updates: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryMetadata {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail.
    pub fn fail_all(&self, on: bool) {
        self.faults.fail_all.store(on, Ordering::SeqCst);
    }

    /// Make only `update_image` fail.
    pub fn fail_updates(&self, on: bool) {
        self.faults.fail_updates.store(on, Ordering::SeqCst);
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().unwrap().images.len()
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().unwrap().events.len()
    }

    pub fn events(&self) -> Vec<OutboxEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn images(&self) -> Vec<Image> {
        self.state.lock().unwrap().images.values().cloned().collect()
    }

    /// Rewind every event timestamp by `age`, to exercise lease and
    /// retention cutoffs.
    pub fn age_events(&self, age: Duration) {
        let age = chrono::Duration::from_std(age).expect("age fits");
        let mut state = self.state.lock().unwrap();
        for event in &mut state.events {
            event.created_at -= age;
            if let Some(stamp) = event.processed_at.as_mut() {
                *stamp -= age;
            }
        }
    }
}

fn cutoff(age: Duration) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::zero())
}

impl State {
    fn create_image(&mut self, image: &Image) -> Result<(), StoreError> {
        self.images.insert(image.id, image.clone());
        Ok(())
    }

    fn image(&mut self, id: Uuid) -> Result<Image, StoreError> {
        self.images.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    fn update_image(&mut self, image: &Image) -> Result<(), StoreError> {
        let row = self.images.get_mut(&image.id).ok_or(StoreError::NotFound)?;
        row.processed_key = image.processed_key.clone();
        row.status = image.status;
        row.processed_at = image.processed_at;
        Ok(())
    }

    fn delete_image(&mut self, id: Uuid) -> Result<(), StoreError> {
        self.images.remove(&id).ok_or(StoreError::NotFound)?;
        self.events.retain(|event| event.aggregate_id != id);
        Ok(())
    }

    fn processed_artifact(&mut self, id: Uuid) -> Result<(String, String), StoreError> {
        let image = self.images.get(&id).ok_or(StoreError::NotFound)?;
        if image.status != ImageStatus::Processed {
            return Err(StoreError::NotFound);
        }
        let key = image.processed_key.clone().ok_or(StoreError::NotFound)?;
        Ok((key, image.content_type.clone()))
    }

    fn create_event(&mut self, event: &OutboxEvent) -> Result<(), StoreError> {
        self.events.push(event.clone());
        Ok(())
    }

    fn pending_events(&mut self, max_retries: i32, limit: i64) -> Vec<OutboxEvent> {
        let mut pending: Vec<OutboxEvent> = self
            .events
            .iter()
            .filter(|event| {
                event.status == EventStatus::Pending && event.retry_count < max_retries
            })
            .cloned()
            .collect();
        pending.sort_by_key(|event| event.created_at);
        pending.truncate(limit as usize);
        pending
    }

    fn mark(&mut self, ids: &[Uuid], status: EventStatus, stamp: bool) -> Result<(), StoreError> {
        let mut touched = 0;
        for event in &mut self.events {
            if ids.contains(&event.id) {
                event.status = status;
                if stamp {
                    event.processed_at = Some(Utc::now());
                }
                touched += 1;
            }
        }
        if touched == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn increment_retry(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        let mut touched = 0;
        for event in &mut self.events {
            if ids.contains(&event.id) {
                event.retry_count += 1;
                event.status = EventStatus::Pending;
                touched += 1;
            }
        }
        if touched == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn mark_exhausted_failed(&mut self, max_retries: i32) -> u64 {
        let mut touched = 0;
        for event in &mut self.events {
            if event.status == EventStatus::Pending && event.retry_count >= max_retries {
                event.status = EventStatus::Failed;
                touched += 1;
            }
        }
        touched
    }

    fn release_stale_claims(&mut self, lease: Duration) -> u64 {
        let cutoff = cutoff(lease);
        let mut touched = 0;
        for event in &mut self.events {
            if event.status == EventStatus::Processing
                && event.processed_at.is_some_and(|stamp| stamp < cutoff)
            {
                event.status = EventStatus::Pending;
                event.retry_count += 1;
                touched += 1;
            }
        }
        touched
    }

    fn delete_terminal(&mut self, retention: Duration) -> u64 {
        let cutoff = cutoff(retention);
        let before = self.events.len();
        self.events.retain(|event| {
            let terminal =
                matches!(event.status, EventStatus::Processed | EventStatus::Failed);
            let aged = event.processed_at.unwrap_or(event.created_at) < cutoff;
            !(terminal && aged)
        });
        (before - self.events.len()) as u64
    }
}

impl Faults {
    fn check(&self) -> Result<(), StoreError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected failure".into()));
        }
        Ok(())
    }

    fn check_update(&self) -> Result<(), StoreError> {
        self.check()?;
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected update failure".into()));
        }
        Ok(())
    }
}

macro_rules! with_state {
    ($this:expr, $state:ident, $body:expr) => {{
        $this.faults.check()?;
        let mut guard = $this.state.lock().unwrap();
        let $state = &mut *guard;
        $body
    }};
}

impl MetadataSession for MemoryMetadata {
    async fn create_image(&mut self, image: &Image) -> Result<(), StoreError> {
        with_state!(self, state, state.create_image(image))
    }

    async fn image(&mut self, id: Uuid) -> Result<Image, StoreError> {
        with_state!(self, state, state.image(id))
    }

    async fn update_image(&mut self, image: &Image) -> Result<(), StoreError> {
        self.faults.check_update()?;
        self.state.lock().unwrap().update_image(image)
    }

    async fn delete_image(&mut self, id: Uuid) -> Result<(), StoreError> {
        with_state!(self, state, state.delete_image(id))
    }

    async fn processed_artifact(&mut self, id: Uuid) -> Result<(String, String), StoreError> {
        with_state!(self, state, state.processed_artifact(id))
    }

    async fn create_event(&mut self, event: &OutboxEvent) -> Result<(), StoreError> {
        with_state!(self, state, state.create_event(event))
    }

    async fn pending_events(
        &mut self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        with_state!(self, state, Ok(state.pending_events(max_retries, limit)))
    }

    async fn mark_processing(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        with_state!(self, state, state.mark(ids, EventStatus::Processing, true))
    }

    async fn mark_processed(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        with_state!(self, state, state.mark(ids, EventStatus::Processed, true))
    }

    async fn mark_failed(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        with_state!(self, state, state.mark(ids, EventStatus::Failed, false))
    }

    async fn increment_retry(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        with_state!(self, state, state.increment_retry(ids))
    }

    async fn mark_exhausted_failed(&mut self, max_retries: i32) -> Result<u64, StoreError> {
        with_state!(self, state, Ok(state.mark_exhausted_failed(max_retries)))
    }

    async fn release_stale_claims(&mut self, lease: Duration) -> Result<u64, StoreError> {
        with_state!(self, state, Ok(state.release_stale_claims(lease)))
    }

    async fn delete_terminal(&mut self, retention: Duration) -> Result<u64, StoreError> {
        with_state!(self, state, Ok(state.delete_terminal(retention)))
    }
}

/// Staged view committed back on success.
pub struct MemoryTx {
    store: MemoryMetadata,
    staged: State,
}

impl MetadataSession for MemoryTx {
    async fn create_image(&mut self, image: &Image) -> Result<(), StoreError> {
        self.store.faults.check()?;
        self.staged.create_image(image)
    }

    async fn image(&mut self, id: Uuid) -> Result<Image, StoreError> {
        self.store.faults.check()?;
        self.staged.image(id)
    }

    async fn update_image(&mut self, image: &Image) -> Result<(), StoreError> {
        self.store.faults.check_update()?;
        self.staged.update_image(image)
    }

    async fn delete_image(&mut self, id: Uuid) -> Result<(), StoreError> {
        self.store.faults.check()?;
        self.staged.delete_image(id)
    }

    async fn processed_artifact(&mut self, id: Uuid) -> Result<(String, String), StoreError> {
        self.store.faults.check()?;
        self.staged.processed_artifact(id)
    }

    async fn create_event(&mut self, event: &OutboxEvent) -> Result<(), StoreError> {
        self.store.faults.check()?;
        self.staged.create_event(event)
    }

    async fn pending_events(
        &mut self,
        max_retries: i32,
        limit: i64,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        self.store.faults.check()?;
        Ok(self.staged.pending_events(max_retries, limit))
    }

    async fn mark_processing(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        self.store.faults.check()?;
        self.staged.mark(ids, EventStatus::Processing, true)
    }

    async fn mark_processed(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        self.store.faults.check()?;
        self.staged.mark(ids, EventStatus::Processed, true)
    }

    async fn mark_failed(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        self.store.faults.check()?;
        self.staged.mark(ids, EventStatus::Failed, false)
    }

    async fn increment_retry(&mut self, ids: &[Uuid]) -> Result<(), StoreError> {
        self.store.faults.check()?;
        self.staged.increment_retry(ids)
    }

    async fn mark_exhausted_failed(&mut self, max_retries: i32) -> Result<u64, StoreError> {
        self.store.faults.check()?;
        Ok(self.staged.mark_exhausted_failed(max_retries))
    }

    async fn release_stale_claims(&mut self, lease: Duration) -> Result<u64, StoreError> {
        self.store.faults.check()?;
        Ok(self.staged.release_stale_claims(lease))
    }

    async fn delete_terminal(&mut self, retention: Duration) -> Result<u64, StoreError> {
        self.store.faults.check()?;
        Ok(self.staged.delete_terminal(retention))
    }
}

impl MetadataStore for MemoryMetadata {
    type Tx = MemoryTx;

    async fn within_transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut MemoryTx) -> TxFuture<'t, T> + Send,
    {
        let staged = self.state.lock().unwrap().clone();
        let mut tx = MemoryTx {
            store: self.clone(),
            staged,
        };
        let value = f(&mut tx).await?;
        *self.state.lock().unwrap() = tx.staged;
        Ok(value)
    }
}
