//! HTTP surface: the `/v1` image routes and their error mapping.

use axum::Json;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Serialize;

use crate::blob::BlobStore;
use crate::service::ImageService;
use crate::store::MetadataStore;

pub mod v1;

pub struct AppState<M, B> {
    pub service: ImageService<M, B>,
}

impl<M: Clone, B: Clone> Clone for AppState<M, B> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

pub fn router<M, B>(state: AppState<M, B>) -> axum::Router
where
    M: MetadataStore,
    B: BlobStore,
{
    axum::Router::new()
        .route("/v1/upload", post(v1::upload::<M, B>))
        .route(
            "/v1/image/:id",
            get(v1::get_image::<M, B>).delete(v1::delete_image::<M, B>),
        )
        .layer(DefaultBodyLimit::max(v1::MAX_FILE_SIZE + 64 * 1024))
        .with_state(state)
}

/// Client-facing error: a status code and a short message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: message.into(),
        }
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNSUPPORTED_MEDIA_TYPE,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}
