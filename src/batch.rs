//! Batch execution endpoint.
//!
//! `POST /api/code/run` provisions a workspace, runs the resolved pipeline
//! with a fixed wall-clock timeout and no interactivity, and returns the
//! captured output once the process exits. Each request is fully
//! self-contained; no session state is involved.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ExecError;
use crate::languages;
use crate::supervisor::Supervisor;
use crate::workspace::{SourceFile, Workspace};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub language: String,
    #[serde(default)]
    pub files: Vec<SourceFile>,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub run: RunOutput,
}

#[derive(Debug, Serialize)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Handler for `POST /api/code/run`.
///
/// The first file is the entry point; all submitted files are materialized
/// into the workspace. A timeout surfaces as a note in `stderr`, not as an
/// HTTP error.
pub async fn run_code(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResponse>, ExecError> {
    let prepared = languages::prepare_run(&request.language, request.files)?;
    info!(
        "Batch run: language={}, entry={}",
        request.language, prepared.entry
    );

    let workspace =
        Workspace::provision(&state.config.workspace_root, "batch", &prepared.files).await?;
    let supervisor = Supervisor::new(workspace);

    let outcome = supervisor
        .run_batch(&prepared.pipeline, state.config.batch_timeout)
        .await?;

    Ok(Json(RunResponse {
        run: RunOutput {
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        },
    }))
}
