//! Outbox relay: drains `images_outbox` to the bus.
//!
//! Three periodic tasks share the store without locks because their UPDATE
//! predicates are disjoint: the publisher only touches `pending` rows below
//! the retry budget, the sweeper only `pending` rows at or above it (plus
//! expired `processing` claims), and cleanup only terminal rows.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::blob::BlobStore;
use crate::bus::EventPublisher;
use crate::service::ImageService;
use crate::store::MetadataStore;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub mark_failed_interval: Duration,
    pub cleanup_interval: Duration,
    pub process_batch_timeout: Duration,
    pub claim_timeout: Duration,
    pub retention: Duration,
    pub batch_size: i64,
    pub max_retries: i32,
}

#[derive(Clone)]
pub struct OutboxRelay<M, B, P> {
    service: ImageService<M, B>,
    publisher: P,
    config: RelayConfig,
}

impl<M, B, P> OutboxRelay<M, B, P>
where
    M: MetadataStore,
    B: BlobStore,
    P: EventPublisher,
{
    pub fn new(service: ImageService<M, B>, publisher: P, config: RelayConfig) -> Self {
        Self {
            service,
            publisher,
            config,
        }
    }

    /// One publisher iteration: claim a batch, publish it, settle the rows.
    ///
    /// Errors are logged and absorbed; the next tick starts from whatever
    /// state the store is in.
    pub async fn process_batch(&mut self) {
        let events = match self
            .service
            .pending_events(self.config.max_retries, self.config.batch_size)
            .await
        {
            Ok(events) => events,
            Err(error) => {
                error!(%error, "failed to fetch pending events");
                return;
            }
        };
        if events.is_empty() {
            return;
        }
        let ids: Vec<_> = events.iter().map(|event| event.id).collect();

        // Claim before publish so a concurrent poll cannot pick the rows up.
        if let Err(error) = self.service.mark_processing(&ids).await {
            error!(%error, "failed to claim outbox batch");
            return;
        }

        if let Err(error) = self.publisher.publish(&events).await {
            error!(%error, count = ids.len(), "failed to publish outbox batch");
            if let Err(retry) = self.service.increment_retry(&ids).await {
                error!(%retry, "failed to return batch to pending");
            }
            return;
        }

        if let Err(error) = self.service.mark_processed(&ids).await {
            error!(%error, "failed to mark batch processed");
            return;
        }
        debug!(count = ids.len(), "published outbox batch");
    }

    /// Sweeper iteration: expire stale claims, then fail rows whose retry
    /// budget is exhausted.
    pub async fn sweep(&mut self) {
        match self
            .service
            .release_stale_claims(self.config.claim_timeout)
            .await
        {
            Ok(released) if released > 0 => {
                warn!(released, "returned stale processing claims to pending");
            }
            Ok(_) => {}
            Err(error) => error!(%error, "failed to release stale claims"),
        }
        if let Err(error) = self
            .service
            .mark_exhausted_failed(self.config.max_retries)
            .await
        {
            error!(%error, "failed to mark exhausted events");
        }
    }

    /// Cleanup iteration: drop terminal rows past the retention window.
    pub async fn cleanup(&mut self) {
        if let Err(error) = self.service.cleanup_outbox(self.config.retention).await {
            error!(%error, "failed to clean up outbox");
        }
    }

    /// Spawn the three periodic tasks.
    pub fn start(&self) -> RelayHandle<P> {
        let token = CancellationToken::new();
        let mut tasks = Vec::with_capacity(3);

        {
            let mut relay = self.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(relay.config.poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let deadline = relay.config.process_batch_timeout;
                            if tokio::time::timeout(deadline, relay.process_batch())
                                .await
                                .is_err()
                            {
                                warn!("outbox batch exceeded its deadline");
                            }
                        }
                    }
                }
            }));
        }

        {
            let mut relay = self.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(relay.config.mark_failed_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => relay.sweep().await,
                    }
                }
            }));
        }

        {
            let mut relay = self.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(relay.config.cleanup_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => relay.cleanup().await,
                    }
                }
            }));
        }

        RelayHandle {
            token,
            tasks,
            publisher: self.publisher.clone(),
        }
    }
}

pub struct RelayHandle<P> {
    token: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    publisher: P,
}

impl<P: EventPublisher> RelayHandle<P> {
    /// Cancel the tasks and join them, bounded by `timeout`. Outstanding
    /// work past the deadline is abandoned; the bus will resettle it.
    pub async fn shutdown(self, timeout: Duration) {
        self.token.cancel();
        let join = futures::future::join_all(self.tasks);
        if tokio::time::timeout(timeout, join).await.is_err() {
            warn!("relay shutdown timed out, abandoning tasks");
        }
        self.publisher.close().await;
    }
}
