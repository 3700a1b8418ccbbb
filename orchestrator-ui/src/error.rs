//! JSON error responses: `{ "code": ..., "message": ... }`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use codex_orchestrator::error::{ErrorCode, OrchestratorError};

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Malformed ids or parameters.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_request",
            message: message.into(),
        }
    }

    /// Requests refused by the origin guard.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "forbidden",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: ErrorCode::Internal.as_str(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let code = err.code();
        let status = match code {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::PreconditionFailed => StatusCode::BAD_REQUEST,
            ErrorCode::Conflict | ErrorCode::InvalidTransition => StatusCode::CONFLICT,
            ErrorCode::SpawnFailed | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: code.as_str(),
            message: format!("{err:#}"),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::from(OrchestratorError::Internal(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codex_orchestrator::error::RecordKind;

    #[test]
    fn maps_codes_to_statuses() {
        let not_found = ApiError::from(OrchestratorError::not_found(RecordKind::Job, "j1"));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);
        assert_eq!(not_found.code(), "not_found");

        let precondition = ApiError::from(OrchestratorError::precondition("no insight"));
        assert_eq!(precondition.status(), StatusCode::BAD_REQUEST);
        assert_eq!(precondition.code(), "precondition_failed");

        let conflict = ApiError::from(OrchestratorError::InvalidTransition {
            id: "p1".to_string(),
            from: "applied",
            to: "applied",
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
    }
}
