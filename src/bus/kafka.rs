//! Kafka adapters: a `FutureProducer` for the relay and a manually-committed
//! `StreamConsumer` for the processing controller.

use bytes::Bytes;
use futures::future::try_join_all;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tracing::warn;

use crate::entity::OutboxEvent;

use super::{EventConsumer, EventPublisher, JobMessage};

const EVENT_ID_HEADER: &str = "event_id";

#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn connect(brokers: &[String], topic: String) -> Result<Self, KafkaError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self { producer, topic })
    }
}

impl EventPublisher for KafkaPublisher {
    type Error = KafkaError;

    async fn publish(&self, events: &[OutboxEvent]) -> Result<(), KafkaError> {
        let sends = events.iter().map(|event| {
            let key = event.aggregate_id.to_string();
            let event_id = event.id.to_string();
            async move {
                let headers = OwnedHeaders::new().insert(Header {
                    key: EVENT_ID_HEADER,
                    value: Some(event_id.as_bytes()),
                });
                let record = FutureRecord::to(&self.topic)
                    .key(&key)
                    .payload(&event.payload[..])
                    .headers(headers);
                self.producer
                    .send(record, Timeout::Never)
                    .await
                    .map(|_| ())
                    .map_err(|(error, _)| error)
            }
        });
        try_join_all(sends).await?;
        Ok(())
    }

    async fn close(&self) {
        let producer = self.producer.clone();
        let flushed = tokio::task::spawn_blocking(move || {
            producer.flush(Timeout::After(std::time::Duration::from_secs(5)))
        })
        .await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(%error, "failed to flush producer"),
            Err(join) => warn!(%join, "producer flush task failed"),
        }
    }
}

pub struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaConsumer {
    pub fn connect(brokers: &[String], group_id: &str, topic: String) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[&topic])?;
        Ok(Self { consumer, topic })
    }
}

impl EventConsumer for KafkaConsumer {
    type Error = KafkaError;

    async fn fetch(&self) -> Result<JobMessage, KafkaError> {
        let message = self.consumer.recv().await?;
        let event_id = message.headers().and_then(|headers| {
            headers
                .iter()
                .find(|header| header.key == EVENT_ID_HEADER)
                .and_then(|header| header.value)
                .map(|value| String::from_utf8_lossy(value).into_owned())
        });
        Ok(JobMessage {
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            event_id,
            payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
            partition: message.partition(),
            offset: message.offset(),
        })
    }

    async fn commit(&self, message: &JobMessage) -> Result<(), KafkaError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &self.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    async fn close(&self) {
        self.consumer.unsubscribe();
    }
}
