//! Crate-level error type.
//!
//! Per the error handling design, the core subsystem (token counting, budget
//! solving, memory store, summarizer, context assembly, compaction) never
//! surfaces an error to its caller for a recoverable condition — it falls
//! back and tags the result instead. `GatewayError` exists at the
//! orchestrator's boundary: HTTP status mapping, and genuinely irrecoverable
//! states such as an unreachable database or malformed configuration.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database pool error: {0}")]
    Pool(#[from] deadpool_sqlite::PoolError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            // A failed generation call is wrapped in `anyhow::Error` by the
            // orchestrator (spec §7/S6: upstream down), so check the chain
            // for a `ProviderError` before defaulting to a plain 500.
            GatewayError::Internal(e) if e.downcast_ref::<crate::provider::ProviderError>().is_some() => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Database(_) | GatewayError::Pool(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        let body = json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
