//! `/v1` handlers: multipart upload, processed-image download, delete.

use axum::Json;
use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::error;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::entity::{Image, Operation};
use crate::store::MetadataStore;

use super::{ApiError, AppState};

pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

const MIN_RESIZE_DIMENSION: u32 = 10;
const MAX_RESIZE_DIMENSION: u32 = 10_000;
const MIN_TEXT_LEN: usize = 10;
const MAX_TEXT_LEN: usize = 64;

const ALLOWED_EXTENSIONS: [&str; 3] = [".jpg", ".jpeg", ".png"];

fn allowed_content_type(content_type: &str) -> bool {
    content_type == mime::IMAGE_JPEG.essence_str()
        || content_type == "image/jpg"
        || content_type == mime::IMAGE_PNG.essence_str()
}

#[derive(Serialize)]
pub struct UploadResponse {
    pub image_id: Uuid,
    pub original_name: String,
    pub size: i64,
    pub content_type: String,
    pub status: &'static str,
    pub operation: &'static str,
    pub created_at: DateTime<Utc>,
}

impl UploadResponse {
    fn new(image: &Image, operation: &Operation) -> Self {
        Self {
            image_id: image.id,
            original_name: image.original_name.clone(),
            size: image.size,
            content_type: image.content_type.clone(),
            status: image.status.as_str(),
            operation: operation.name(),
            created_at: image.created_at,
        }
    }
}

#[derive(Default)]
struct UploadForm {
    file: Option<(String, String, Bytes)>,
    operation: Option<String>,
    width: Option<String>,
    height: Option<String>,
    text: Option<String>,
}

async fn read_form(multipart: &mut Multipart) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|error| ApiError::bad_request(format!("malformed multipart body: {error}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                let name = field.file_name().unwrap_or_default().to_owned();
                let content_type = field.content_type().unwrap_or_default().to_owned();
                let data = field
                    .bytes()
                    .await
                    .map_err(|error| ApiError::bad_request(format!("failed to read file: {error}")))?;
                form.file = Some((name, content_type, data));
            }
            "operation" => form.operation = read_text(field).await?,
            "width" => form.width = read_text(field).await?,
            "height" => form.height = read_text(field).await?,
            "text" => form.text = read_text(field).await?,
            _ => {}
        }
    }
    Ok(form)
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<Option<String>, ApiError> {
    let value = field
        .text()
        .await
        .map_err(|error| ApiError::bad_request(format!("malformed field: {error}")))?;
    Ok(Some(value))
}

fn parse_dimension(value: Option<&str>, name: &str) -> Result<u32, ApiError> {
    let value = value.ok_or_else(|| ApiError::bad_request(format!("{name} is required for resize")))?;
    let value: u32 = value
        .parse()
        .map_err(|_| ApiError::bad_request(format!("{name} must be a number")))?;
    if !(MIN_RESIZE_DIMENSION..=MAX_RESIZE_DIMENSION).contains(&value) {
        return Err(ApiError::bad_request(format!(
            "{name} must be between {MIN_RESIZE_DIMENSION} and {MAX_RESIZE_DIMENSION}"
        )));
    }
    Ok(value)
}

/// Validate the operation and its parameters from the form fields.
pub fn parse_operation(
    operation: &str,
    width: Option<&str>,
    height: Option<&str>,
    text: Option<&str>,
) -> Result<Operation, ApiError> {
    match operation {
        "resize" => Ok(Operation::Resize {
            width: parse_dimension(width, "width")?,
            height: parse_dimension(height, "height")?,
        }),
        "thumbnail" => Ok(Operation::Thumbnail),
        "watermark" => {
            let text =
                text.ok_or_else(|| ApiError::bad_request("text is required for watermark"))?;
            if !(MIN_TEXT_LEN..=MAX_TEXT_LEN).contains(&text.len()) {
                return Err(ApiError::bad_request(format!(
                    "text length must be between {MIN_TEXT_LEN} and {MAX_TEXT_LEN}"
                )));
            }
            Ok(Operation::Watermark {
                text: text.to_owned(),
            })
        }
        _ => Err(ApiError::bad_request(
            "invalid operation. Allowed: resize, thumbnail, watermark",
        )),
    }
}

/// Validate the uploaded file.
pub fn validate_file(name: &str, content_type: &str, size: usize) -> Result<(), ApiError> {
    if size == 0 {
        return Err(ApiError::bad_request("file is empty"));
    }
    if size > MAX_FILE_SIZE {
        return Err(ApiError::payload_too_large(format!(
            "file size cant be more than {MAX_FILE_SIZE} bytes"
        )));
    }
    if !allowed_content_type(content_type) {
        return Err(ApiError::unsupported_media_type(
            "unsupported file type. Allowed: jpeg, png",
        ));
    }
    let name = name.to_ascii_lowercase();
    if !ALLOWED_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
        return Err(ApiError::unsupported_media_type(
            "unsupported file extension. Allowed: .jpg, .jpeg, .png",
        ));
    }
    Ok(())
}

pub async fn upload<M, B>(
    State(state): State<AppState<M, B>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError>
where
    M: MetadataStore,
    B: BlobStore,
{
    let form = read_form(&mut multipart).await?;

    let (name, content_type, data) = form
        .file
        .ok_or_else(|| ApiError::bad_request("file is required"))?;
    validate_file(&name, &content_type, data.len())?;

    let operation = form
        .operation
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("operation is required"))?;
    let operation = parse_operation(
        operation,
        form.width.as_deref(),
        form.height.as_deref(),
        form.text.as_deref(),
    )?;

    let mut service = state.service;
    let image = service
        .upload(data, name, content_type, operation.clone())
        .await
        .map_err(|error| {
            error!(%error, "failed to store upload");
            ApiError::internal("storage problems")
        })?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse::new(&image, &operation)),
    ))
}

pub async fn get_image<M, B>(
    State(state): State<AppState<M, B>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError>
where
    M: MetadataStore,
    B: BlobStore,
{
    let id: Uuid = id
        .parse()
        .map_err(|_| ApiError::bad_request("invalid id"))?;

    let mut service = state.service;
    let (processed_key, content_type) =
        service.processed_artifact(id).await.map_err(|error| {
            if error.is_not_found() {
                ApiError::not_found("image not found")
            } else {
                error!(%error, "failed to look up processed image");
                ApiError::internal("storage problems")
            }
        })?;

    let body = service.download(processed_key).await.map_err(|error| {
        error!(%error, "failed to download processed image");
        ApiError::internal("storage problems")
    })?;

    let stream = ReaderStream::new(body.into_async_read());
    Ok((
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(stream),
    )
        .into_response())
}

pub async fn delete_image<M, B>(
    State(state): State<AppState<M, B>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError>
where
    M: MetadataStore,
    B: BlobStore,
{
    let id: Uuid = id
        .parse()
        .map_err(|_| ApiError::bad_request("invalid id"))?;

    let mut service = state.service;
    service.delete(id).await.map_err(|error| {
        if error.is_not_found() {
            ApiError::not_found("image not found")
        } else {
            error!(%error, "failed to delete image");
            ApiError::internal("storage problems")
        }
    })?;

    Ok(StatusCode::NO_CONTENT)
}
