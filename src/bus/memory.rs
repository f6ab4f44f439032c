//! In-memory bus used by the pipeline tests. One queue serves both halves:
//! the publisher pushes, consumers pop, and unacknowledged messages can be
//! redelivered on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::entity::OutboxEvent;

use super::{EventConsumer, EventPublisher, JobMessage};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("publish rejected")]
    PublishRejected,
}

#[derive(Default)]
struct Inner {
    queue: Mutex<VecDeque<JobMessage>>,
    inflight: Mutex<Vec<JobMessage>>,
    acked: Mutex<Vec<i64>>,
    published: AtomicI64,
    next_offset: AtomicI64,
    fail_publish: AtomicBool,
    notify: Notify,
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publish(&self, on: bool) {
        self.inner.fail_publish.store(on, Ordering::SeqCst);
    }

    pub fn published_count(&self) -> i64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn queued_count(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    pub fn acked_count(&self) -> usize {
        self.inner.acked.lock().unwrap().len()
    }

    /// Push a raw message, bypassing the publisher. Lets tests deliver
    /// duplicates or malformed payloads.
    pub fn push(&self, payload: Bytes, key: Option<String>, event_id: Option<String>) {
        let offset = self.inner.next_offset.fetch_add(1, Ordering::SeqCst);
        self.inner.queue.lock().unwrap().push_back(JobMessage {
            key,
            event_id,
            payload,
            partition: 0,
            offset,
        });
        self.inner.notify.notify_one();
    }

    /// Requeue everything fetched but never acknowledged.
    pub fn redeliver_unacked(&self) {
        let mut inflight = self.inner.inflight.lock().unwrap();
        let mut queue = self.inner.queue.lock().unwrap();
        for message in inflight.drain(..) {
            queue.push_back(message);
        }
        drop(queue);
        self.inner.notify.notify_one();
    }
}

impl EventPublisher for MemoryBus {
    type Error = Error;

    async fn publish(&self, events: &[OutboxEvent]) -> Result<(), Error> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(Error::PublishRejected);
        }
        for event in events {
            self.push(
                Bytes::from(event.payload.clone()),
                Some(event.aggregate_id.to_string()),
                Some(event.id.to_string()),
            );
            self.inner.published.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn close(&self) {}
}

impl EventConsumer for MemoryBus {
    type Error = Error;

    async fn fetch(&self) -> Result<JobMessage, Error> {
        loop {
            let notified = self.inner.notify.notified();
            let (message, more) = {
                let mut queue = self.inner.queue.lock().unwrap();
                let message = queue.pop_front();
                (message, !queue.is_empty())
            };
            if let Some(message) = message {
                // A stored notify permit covers one waiter; hand the rest on.
                if more {
                    self.inner.notify.notify_one();
                }
                self.inner.inflight.lock().unwrap().push(message.clone());
                return Ok(message);
            }
            notified.await;
        }
    }

    async fn commit(&self, message: &JobMessage) -> Result<(), Error> {
        self.inner
            .inflight
            .lock()
            .unwrap()
            .retain(|inflight| inflight.offset != message.offset);
        self.inner.acked.lock().unwrap().push(message.offset);
        Ok(())
    }

    async fn close(&self) {}
}
