use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Bad or missing input, rejected before storage is touched.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Webhook signature missing, malformed or wrong.
    #[error("authenticity check failed: {0}")]
    Authenticity(String),

    /// Storage temporarily unavailable (pool exhausted, database busy). Retryable.
    #[error("storage unavailable: {0}")]
    Transient(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A billing event references data this store does not have yet.
    #[error("upstream inconsistency: {0}")]
    UpstreamInconsistency(String),

    /// The billing provider API failed or returned garbage.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// True when retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Transient(_) => true,
            AppError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) | AppError::Authenticity(_) => StatusCode::FORBIDDEN,
            AppError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Database(_) if self.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // Acknowledged so the provider does not retry a poison event.
            AppError::UpstreamInconsistency(_) => StatusCode::OK,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<r2d2::Error> for AppError {
    fn from(err: r2d2::Error) -> Self {
        AppError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("invalid JSON: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Upstream(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }

        // Storage internals stay out of client responses
        let message = match &self {
            AppError::Database(_) => "Database error".to_string(),
            other => other.to_string(),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
