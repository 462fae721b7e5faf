use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use log::error;
use serde_json::json;
use thiserror::Error;

use crate::{assessment::StoreError, detector::DetectorError};

/// Every failure the HTTP surface reports. Each variant maps to exactly one status code.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing 'image' (base64) field in request body.")]
    MissingImage,
    #[error("Model not loaded. Service is UNHEALTHY.")]
    ModelUnavailable,
    #[error("Internal Server Error during inference: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingImage => StatusCode::BAD_REQUEST,
            ApiError::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Metric label.
    pub fn outcome(&self) -> &'static str {
        match self {
            ApiError::MissingImage => "bad_request",
            ApiError::ModelUnavailable => "unavailable",
            ApiError::Internal(_) => "error",
        }
    }
}

macro_rules! internal_from {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for ApiError {
                fn from(e: $source) -> Self {
                    ApiError::Internal(e.to_string())
                }
            }
        )*
    };
}

internal_from!(
    serde_json::Error,
    base64::DecodeError,
    image::ImageError,
    DetectorError,
    StoreError,
    tokio::task::JoinError,
);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(_) = &self {
            error!("{self}");
        }
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
