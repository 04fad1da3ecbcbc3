//! API error type mapping to HTTP status codes

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use crate::core::{ChatError, StoreError};
use crate::documents::DocumentError;
use crate::providers::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("No chat is active; start or load one first")]
    NoActiveSession,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        ApiError::Chat(error.into())
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    /// The same request may succeed if sent again
    pub retry: bool,
}

impl ApiError {
    pub fn status_and_body(&self) -> (StatusCode, ErrorBody) {
        let (status, code, retry) = match self {
            ApiError::Chat(ChatError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND", false)
            }
            ApiError::Chat(ChatError::Invalid(_)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", false)
            }
            ApiError::Chat(ChatError::UnknownModel(_)) => {
                (StatusCode::BAD_REQUEST, "UNKNOWN_MODEL", false)
            }
            ApiError::Chat(ChatError::ModelUnavailable(ProviderError::Timeout(_))) => {
                (StatusCode::GATEWAY_TIMEOUT, "MODEL_TIMEOUT", true)
            }
            ApiError::Chat(ChatError::ModelUnavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "MODEL_UNAVAILABLE", true)
            }
            ApiError::Chat(ChatError::Cancelled) => {
                (StatusCode::REQUEST_TIMEOUT, "REQUEST_CANCELLED", true)
            }
            ApiError::Chat(ChatError::NothingToRetry) => {
                (StatusCode::CONFLICT, "NOTHING_TO_RETRY", false)
            }
            ApiError::Chat(ChatError::Storage(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", false)
            }
            ApiError::Document(DocumentError::UnsupportedType(_)) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, "UNSUPPORTED_DOCUMENT", false)
            }
            ApiError::Document(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "UNREADABLE_DOCUMENT", false)
            }
            ApiError::NoActiveSession => (StatusCode::CONFLICT, "NO_ACTIVE_SESSION", false),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", false),
            ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", false)
            }
        };

        let body = ErrorBody {
            code,
            message: self.to_string(),
            retry,
        };
        (status, body)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();

        if status.is_server_error() {
            tracing::error!(code = body.code, "{}", body.message);
        } else {
            tracing::debug!(code = body.code, "{}", body.message);
        }

        (status, Json(serde_json::json!({ "error": body }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::from(StoreError::NotFound(Uuid::new_v4())), StatusCode::NOT_FOUND),
            (
                ApiError::Chat(ChatError::ModelUnavailable(ProviderError::Timeout(
                    Duration::from_secs(1),
                ))),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                ApiError::Chat(ChatError::ModelUnavailable(ProviderError::InvalidResponse(
                    "boom".into(),
                ))),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ApiError::Document(DocumentError::UnsupportedType("image/png".into())),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ),
            (ApiError::NoActiveSession, StatusCode::CONFLICT),
        ];

        for (error, expected) in cases {
            assert_eq!(error.status_and_body().0, expected, "{error}");
        }
    }

    #[test]
    fn test_model_errors_invite_retry() {
        let (_, body) = ApiError::Chat(ChatError::ModelUnavailable(ProviderError::Timeout(
            Duration::from_secs(360),
        )))
        .status_and_body();
        assert!(body.retry);

        let (_, body) = ApiError::Chat(ChatError::NothingToRetry).status_and_body();
        assert!(!body.retry);
    }
}
