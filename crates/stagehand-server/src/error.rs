use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use stagehand_core::error::StagehandError;

// ---------------------------------------------------------------------------
// Internal sentinel for malformed requests
// ---------------------------------------------------------------------------

/// Carries an explicit HTTP 400 through the `anyhow::Error` chain for
/// request problems that have no `StagehandError` counterpart.
#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self(StagehandError::Conflict(msg.into()).into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self(StagehandError::NotFound(msg.into()).into())
    }
}

fn status_of(e: &StagehandError) -> StatusCode {
    match e {
        StagehandError::NotFound(_) => StatusCode::NOT_FOUND,
        StagehandError::AlreadyExists(_) | StagehandError::Conflict(_) => StatusCode::CONFLICT,
        StagehandError::InvalidWorkflow(_)
        | StagehandError::InvalidSchedule { .. }
        | StagehandError::InvalidExpression { .. }
        | StagehandError::InvalidMetricsExpr(_)
        | StagehandError::UnknownField(_)
        | StagehandError::Yaml(_)
        | StagehandError::Json(_) => StatusCode::BAD_REQUEST,
        StagehandError::Telemetry(_) | StagehandError::AlertInconsistent(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        StagehandError::Http(_) => StatusCode::BAD_GATEWAY,
        StagehandError::TooManyMissedStarts { .. }
        | StagehandError::SchedulingViolation(_)
        | StagehandError::Invariant(_)
        | StagehandError::Exec(_)
        | StagehandError::VirtualExec(_)
        | StagehandError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.0.downcast_ref::<BadRequestError>().is_some() {
            StatusCode::BAD_REQUEST
        } else if let Some(e) = self.0.downcast_ref::<StagehandError>() {
            status_of(e)
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
