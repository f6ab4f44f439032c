//! Event bus capability: batch publish on the relay side, fetch with
//! explicit per-message acknowledgement on the consumer side.

use bytes::Bytes;

use crate::entity::OutboxEvent;

pub mod kafka;

#[cfg(test)]
pub mod memory;

pub use kafka::{KafkaConsumer, KafkaPublisher};

/// One delivered bus message. Acknowledgement goes by partition/offset, so
/// the pair rides along with the copied payload.
#[derive(Debug, Clone)]
pub struct JobMessage {
    pub key: Option<String>,
    pub event_id: Option<String>,
    pub payload: Bytes,
    pub partition: i32,
    pub offset: i64,
}

pub trait EventPublisher: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Publish a batch; either the whole batch is accepted or the call
    /// fails and the relay returns the rows to `pending`.
    fn publish(
        &self,
        events: &[OutboxEvent],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Flush outstanding deliveries before teardown.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

pub trait EventConsumer: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Block until the next message; cancel-safe.
    fn fetch(&self) -> impl Future<Output = Result<JobMessage, Self::Error>> + Send;

    /// Acknowledge a message. Unacknowledged messages are redelivered.
    fn commit(&self, message: &JobMessage) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}
