// Error types and error handling module
// This file defines the service error taxonomy and how each error
// is surfaced to HTTP callers
//
// Numan Thabit 2025 Nov

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    /// Missing or malformed identity fields; the event is not stored.
    #[error("validation error: {0}")]
    Validation(String),
    /// A present metric field could not be aggregated; the event stays stored.
    #[error("aggregation error at offset {offset}: {reason}")]
    Aggregation { offset: u64, reason: String },
    #[error("not found: {0}")]
    NotFound(String),
    /// Event log unreachable. Ingestion fails closed, queries report stale state.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("query timed out after {0} ms")]
    QueryTimeout(u64),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider error: {0}")]
    Provider(String),
    /// Non-success answer from an upstream provider.
    #[error("provider answered http {}", .0.as_u16())]
    ProviderStatus(StatusCode),
}

impl MetricsError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            MetricsError::Validation(_) => StatusCode::BAD_REQUEST,
            MetricsError::Aggregation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            MetricsError::NotFound(_) => StatusCode::NOT_FOUND,
            MetricsError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            MetricsError::QueryTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            MetricsError::Transport(_)
            | MetricsError::Provider(_)
            | MetricsError::ProviderStatus(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether a producer should resubmit the same event later.
    pub fn is_retryable(&self) -> bool {
        match self {
            MetricsError::UpstreamUnavailable(_)
            | MetricsError::QueryTimeout(_)
            | MetricsError::Transport(_) => true,
            MetricsError::ProviderStatus(status) => status.is_server_error(),
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.to_string(),
            retryable: self.is_retryable(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
