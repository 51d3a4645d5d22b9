use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

/// Failure of a messaging operation, as surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The caller is authenticated but may not touch this resource.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Bad input or a violated constraint.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// Storage failure or a lost blocking task.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl MessagingError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for MessagingError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Backend(e) => {
                error!("Backend error: {:#}", e);
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
