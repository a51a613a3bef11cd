use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Returned by the upload endpoint while the batch runs in the background.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub batch_id: String,
    pub status: &'static str,
}

impl UploadResponse {
    pub fn started(batch_id: String) -> Self {
        Self {
            batch_id,
            status: "PROCESS_STARTED",
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0} is not a valid CEP")]
    InvalidCode(String),

    #[error("failed to read the uploaded file: {0}")]
    InvalidUpload(String),

    #[error("multipart upload is missing a file field")]
    MissingFile,

    #[error("{0}")]
    Unresolvable(String),

    #[error("the Correios lookup is not configured on this deployment")]
    CorreiosNotConfigured,

    #[error("Correios lookup failed: {0}")]
    CorreiosFailure(String),

    #[error("storage error: {0}")]
    StoreError(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidCode(_) | ApiError::InvalidUpload(_) | ApiError::MissingFile => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }

            ApiError::Unresolvable(_) => (StatusCode::NOT_FOUND, self.to_string()),

            ApiError::CorreiosNotConfigured | ApiError::CorreiosFailure(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }

            ApiError::StoreError(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        }
        .into_response()
    }
}
