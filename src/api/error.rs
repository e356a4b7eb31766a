use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::KubedeckError;

/// A failed API request, rendered as `{ "error", "message" }`
#[derive(Debug, thiserror::Error)]
#[error("{error}: {message}")]
pub struct ApiError {
    pub status: StatusCode,
    /// Short, stable summary
    pub error: String,
    /// Human-readable detail
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error, message)
    }

    pub fn not_found(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error, message)
    }

    pub fn conflict(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, error, message)
    }

    pub fn internal(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error, message)
    }
}

impl From<KubedeckError> for ApiError {
    fn from(err: KubedeckError) -> Self {
        match err {
            KubedeckError::PodNotFound { .. } => ApiError::not_found("Pod not found", err.to_string()),
            KubedeckError::Credentials(_) => {
                ApiError::new(StatusCode::BAD_GATEWAY, "Cluster unavailable", err.to_string())
            }
            other => ApiError::internal("Internal error", other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.error,
            "message": self.message,
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_errors_map_to_status() {
        let err: ApiError = KubedeckError::PodNotFound {
            namespace: "market".to_string(),
            name: "web-1".to_string(),
        }
        .into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.error, "Pod not found");
        assert_eq!(err.message, "Pod market/web-1 not found");

        let err: ApiError = KubedeckError::Kube("boom".to_string()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
