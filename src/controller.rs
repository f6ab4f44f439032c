//! Processing controller: bus consumer loop plus a bounded worker pool.
//!
//! A single reader feeds a bounded channel; `workers` tasks drain it. Each
//! message runs under the whole-job deadline, with the pixel work further
//! bounded by the CPU deadline inside `spawn_blocking`. Only a fully
//! committed job acknowledges its message; transient failures leave it for
//! redelivery, terminal ones are acknowledged and dropped.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::blob::BlobStore;
use crate::bus::{EventConsumer, JobMessage};
use crate::entity::{JobPayload, PayloadError};
use crate::service::{ImageService, ServiceError};
use crate::store::MetadataStore;
use crate::transform::{self, TransformError};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub commit_timeout: Duration,
    pub process_timeout: Duration,
    pub cpu_timeout: Duration,
    pub workers: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError<BE> {
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("bad job descriptor: {0}")]
    Payload(#[from] PayloadError),
    #[error("transform: {0}")]
    Transform(#[from] TransformError),
    #[error("transform panicked")]
    TransformPanicked,
    #[error("transform deadline exceeded")]
    CpuDeadline,
    #[error("service: {0}")]
    Service(ServiceError<BE>),
}

impl<BE> JobError<BE> {
    /// Terminal failures never succeed on redelivery, so their message is
    /// acknowledged and dropped instead of looping through the bus forever.
    fn is_terminal(&self) -> bool {
        match self {
            Self::Decode(_) | Self::Payload(_) | Self::Transform(_) | Self::TransformPanicked => {
                true
            }
            Self::CpuDeadline => false,
            Self::Service(error) => error.is_not_found(),
        }
    }
}

pub struct ProcessingController<M, B, C> {
    service: ImageService<M, B>,
    consumer: Arc<C>,
    config: ControllerConfig,
}

impl<M, B, C> ProcessingController<M, B, C>
where
    M: MetadataStore,
    B: BlobStore,
    C: EventConsumer,
{
    pub fn new(service: ImageService<M, B>, consumer: Arc<C>, config: ControllerConfig) -> Self {
        Self {
            service,
            consumer,
            config,
        }
    }

    /// Spawn the reader and the worker pool.
    pub fn start(&self) -> ControllerHandle<C> {
        let token = CancellationToken::new();
        let (sender, receiver) = async_channel::bounded(self.config.workers * 2);
        let mut tasks = Vec::with_capacity(self.config.workers + 1);

        for _ in 0..self.config.workers {
            let mut worker = Worker {
                service: self.service.clone(),
                consumer: self.consumer.clone(),
                config: self.config.clone(),
            };
            let receiver = receiver.clone();
            tasks.push(tokio::spawn(async move {
                while let Ok(message) = receiver.recv().await {
                    worker.run(message).await;
                }
            }));
        }

        {
            let consumer = self.consumer.clone();
            let token = token.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        fetched = consumer.fetch() => match fetched {
                            Ok(message) => {
                                if sender.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(error) => error!(%error, "failed to fetch message"),
                        }
                    }
                }
                sender.close();
            }));
        }

        ControllerHandle {
            token,
            tasks,
            consumer: self.consumer.clone(),
        }
    }
}

pub(crate) struct Worker<M, B, C> {
    pub(crate) service: ImageService<M, B>,
    pub(crate) consumer: Arc<C>,
    pub(crate) config: ControllerConfig,
}

impl<M, B, C> Worker<M, B, C>
where
    M: MetadataStore,
    B: BlobStore,
    C: EventConsumer,
{
    /// Process one message and settle it on the bus. Panics are contained
    /// here so the worker keeps draining the channel.
    pub(crate) async fn run(&mut self, message: JobMessage) {
        let outcome = AssertUnwindSafe(self.handle(&message)).catch_unwind().await;
        if let Err(panic) = outcome {
            let panic = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic".to_owned());
            error!(%panic, "worker panicked while processing message");
        }
    }

    async fn handle(&mut self, message: &JobMessage) {
        let verdict = tokio::time::timeout(self.config.process_timeout, self.process(message)).await;
        let acknowledge = match verdict {
            Ok(Ok(())) => true,
            Ok(Err(failure)) if failure.is_terminal() => {
                error!(%failure, event_id = ?message.event_id, "dropping unprocessable message");
                true
            }
            Ok(Err(failure)) => {
                error!(%failure, event_id = ?message.event_id, "failed to process message");
                false
            }
            Err(_) => {
                error!(event_id = ?message.event_id, "job deadline exceeded");
                false
            }
        };
        if !acknowledge {
            return;
        }
        let committed =
            tokio::time::timeout(self.config.commit_timeout, self.consumer.commit(message)).await;
        match committed {
            Ok(Ok(())) => {}
            Ok(Err(error)) => error!(%error, "failed to commit message"),
            Err(_) => warn!("commit deadline exceeded"),
        }
    }

    async fn process(&mut self, message: &JobMessage) -> Result<(), JobError<B::Error>> {
        let payload: JobPayload = serde_json::from_slice(&message.payload)?;
        let operation = payload.operation()?;

        // The row goes first: an image deleted while the job was in flight
        // must surface as missing metadata, not as a blob error.
        self.service
            .image(payload.id)
            .await
            .map_err(JobError::Service)?;

        let data = self
            .service
            .download_bytes(payload.original_key.clone())
            .await
            .map_err(JobError::Service)?;

        let content_type = payload.content_type.clone();
        let pixels = tokio::task::spawn_blocking(move || {
            transform::apply(&data, &content_type, &operation)
        });
        let transformed = match tokio::time::timeout(self.config.cpu_timeout, pixels).await {
            Err(_) => return Err(JobError::CpuDeadline),
            Ok(Err(_join)) => return Err(JobError::TransformPanicked),
            Ok(Ok(result)) => result?,
        };

        self.service
            .upload_processed(payload.id, Bytes::from(transformed))
            .await
            .map_err(JobError::Service)?;

        debug!(image = %payload.id, operation = %payload.operation, "processed image");
        Ok(())
    }
}

pub struct ControllerHandle<C> {
    token: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    consumer: Arc<C>,
}

impl<C: EventConsumer> ControllerHandle<C> {
    /// Cancel the reader, let the workers drain the channel, and join
    /// everything bounded by `timeout`. Messages abandoned past the deadline
    /// are redelivered by the bus.
    pub async fn shutdown(self, timeout: Duration) {
        self.token.cancel();
        let join = futures::future::join_all(self.tasks);
        if tokio::time::timeout(timeout, join).await.is_err() {
            warn!("controller shutdown timed out, abandoning workers");
        }
        self.consumer.close().await;
    }
}
