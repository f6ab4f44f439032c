//! Core records of the pipeline: the image row, its outbox event, and the
//! job descriptor that travels over the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Blob-store key of the uploaded original.
pub fn original_key(id: Uuid) -> String {
    format!("originals/{id}")
}

/// Blob-store key of the processed artifact.
pub fn processed_key(id: Uuid) -> String {
    format!("processed/{id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Processed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processed" => Some(Self::Processed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Row of the `images` table. Created once at upload, mutated once by the
/// processing controller, destroyed by an explicit delete.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Image {
    pub id: Uuid,
    pub original_key: String,
    pub processed_key: Option<String>,
    pub original_name: String,
    pub content_type: String,
    pub size: i64,
    pub status: ImageStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Row of the `images_outbox` table, written in the same transaction as its
/// image and drained asynchronously by the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub payload: Vec<u8>,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
}

impl OutboxEvent {
    pub fn new(aggregate_id: Uuid, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id,
            payload,
            status: EventStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
        }
    }
}

/// A validated transformation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Resize { width: u32, height: u32 },
    Thumbnail,
    Watermark { text: String },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Resize { .. } => "resize",
            Self::Thumbnail => "thumbnail",
            Self::Watermark { .. } => "watermark",
        }
    }
}

/// Job descriptor carried by an outbox event and, later, a bus message.
///
/// The wire shape is flat JSON; the operation parameters are re-validated on
/// the consumer side because the payload may come from an old producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub id: Uuid,
    pub original_key: String,
    pub content_type: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("missing {0} parameter for {1}")]
    MissingParameter(&'static str, &'static str),
}

impl JobPayload {
    pub fn new(image: &Image, operation: &Operation) -> Self {
        let (width, height, text) = match operation {
            Operation::Resize { width, height } => (Some(*width), Some(*height), None),
            Operation::Thumbnail => (None, None, None),
            Operation::Watermark { text } => (None, None, Some(text.clone())),
        };
        Self {
            id: image.id,
            original_key: image.original_key.clone(),
            content_type: image.content_type.clone(),
            operation: operation.name().to_owned(),
            width,
            height,
            text,
        }
    }

    /// Rebuild the validated operation from the wire fields.
    pub fn operation(&self) -> Result<Operation, PayloadError> {
        match self.operation.as_str() {
            "resize" => {
                let width = self
                    .width
                    .ok_or(PayloadError::MissingParameter("width", "resize"))?;
                let height = self
                    .height
                    .ok_or(PayloadError::MissingParameter("height", "resize"))?;
                Ok(Operation::Resize { width, height })
            }
            "thumbnail" => Ok(Operation::Thumbnail),
            "watermark" => {
                let text = self
                    .text
                    .clone()
                    .ok_or(PayloadError::MissingParameter("text", "watermark"))?;
                Ok(Operation::Watermark { text })
            }
            other => Err(PayloadError::UnknownOperation(other.to_owned())),
        }
    }
}
