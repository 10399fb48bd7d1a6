use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::models::ProjectKey;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("project {0} not found")]
    NotFound(String),
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("failed to create container {name}: {message}")]
    CreateFailed { name: String, message: String },
    #[error("failed to attach shell to {name}: {message}")]
    AttachFailed { name: String, message: String },
    #[error("path '{0}' is outside the project sandbox")]
    InvalidPath(String),
    #[error("failed to write '{path}': {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RunnerError {
    pub fn project_not_found(key: &ProjectKey) -> Self {
        RunnerError::NotFound(key.to_string())
    }

    fn status(&self) -> StatusCode {
        match self {
            RunnerError::NotFound(_) => StatusCode::NOT_FOUND,
            RunnerError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RunnerError::CreateFailed { .. }
            | RunnerError::AttachFailed { .. }
            | RunnerError::CommandFailed { .. } => StatusCode::BAD_GATEWAY,
            RunnerError::InvalidPath(_) | RunnerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RunnerError::Io(error) if error.kind() == std::io::ErrorKind::NotFound => {
                StatusCode::NOT_FOUND
            }
            RunnerError::WriteFailed { .. }
            | RunnerError::Internal(_)
            | RunnerError::Io(_)
            | RunnerError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            RunnerError::NotFound(_) => "not_found",
            RunnerError::RuntimeUnavailable(_) => "runtime_unavailable",
            RunnerError::CreateFailed { .. } => "create_failed",
            RunnerError::AttachFailed { .. } => "attach_failed",
            RunnerError::InvalidPath(_) => "invalid_path",
            RunnerError::WriteFailed { .. } => "write_failed",
            RunnerError::CommandFailed { .. } => "command_failed",
            RunnerError::InvalidRequest(_) => "bad_request",
            RunnerError::Io(error) if error.kind() == std::io::ErrorKind::NotFound => "not_found",
            RunnerError::Internal(_) | RunnerError::Io(_) | RunnerError::Json(_) => {
                "internal_error"
            }
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for RunnerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;
