//! Maps the core error taxonomy onto HTTP responses with the JSON envelope
//! `{code, status, data}` the upload/metadata/list/download/delete
//! endpoints all share.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use blobvault_datastore::Error as CoreError;
use serde_json::json;

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError(CoreError::NotFound),
            other => ApiError(CoreError::Internal(other.into())),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(CoreError::Internal(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, status_text) = match &self.0 {
            CoreError::InvalidInput(_) => (StatusCode::BAD_REQUEST, 400, "BAD_REQUEST"),
            CoreError::NotFound => (StatusCode::NOT_FOUND, 404, "NOT_FOUND"),
            CoreError::TooLarge => (StatusCode::PAYLOAD_TOO_LARGE, 413, "TOO_LARGE"),
            CoreError::UnsupportedMediaType => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                415,
                "UNSUPPORTED_MEDIA_TYPE",
            ),
            CoreError::Corrupt(detail) => {
                log::error!("serving corrupt data: {detail}");
                (StatusCode::INTERNAL_SERVER_ERROR, 500, "INTERNAL")
            }
            CoreError::Internal(err) => {
                log::error!("internal error: {err:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, 500, "INTERNAL")
            }
        };

        let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
            json!({ "code": code, "status": status_text, "data": null, "limit_bytes": "2 GB" })
        } else {
            json!({ "code": code, "status": status_text, "data": null })
        };

        (status, axum::Json(body)).into_response()
    }
}
