//! Service error taxonomy.
//!
//! Failures that occur before a process exists are surfaced here and mapped
//! to HTTP statuses. Failures during or after a process's lifetime fold into
//! the normal output/exit-code reporting path and never reach this type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Unsupported execution language: {0}")]
    UnsupportedLanguage(String),

    #[error("No files provided")]
    EmptySubmission,

    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    #[error("Failed to start process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ExecError {
    fn into_response(self) -> Response {
        let status = match &self {
            ExecError::UnsupportedLanguage(_)
            | ExecError::EmptySubmission
            | ExecError::InvalidFileName(_) => StatusCode::BAD_REQUEST,
            ExecError::Spawn(_) | ExecError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
