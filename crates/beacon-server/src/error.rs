use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use beacon_core::StateError;
use beacon_push::PollError;
use beacon_webhook::VerificationError;
use serde_json::json;

/// Errors surfaced to HTTP callers as `{error: {code, message}}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PollError> for ApiError {
    fn from(e: PollError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<VerificationError> for ApiError {
    fn from(e: VerificationError) -> Self {
        match e {
            VerificationError::Mismatch
            | VerificationError::Stale { .. }
            | VerificationError::MissingHeader(_) => Self::Unauthorized(e.to_string()),
            VerificationError::MalformedSignature
            | VerificationError::MalformedTimestamp
            | VerificationError::MalformedBody(_) => Self::BadRequest(e.to_string()),
            VerificationError::InvalidKey => Self::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_mapping() {
        assert_eq!(
            ApiError::from(VerificationError::Mismatch).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(VerificationError::Stale { age_secs: 900 }).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(VerificationError::MalformedBody("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn poll_cap_is_unavailable() {
        let err = ApiError::from(PollError::TooManyPending { limit: 3 });
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "unavailable");
    }

    #[test]
    fn overflow_is_internal() {
        let err = ApiError::from(StateError::VersionOverflow(u64::MAX));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
