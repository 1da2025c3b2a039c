//! Per-execution workspace provisioning and cleanup.
//!
//! Every execution gets a private directory under the configured workspace
//! root. Directory names combine the execution identifier, the current time,
//! and a process-wide sequence number, so a kill-then-restart race on the
//! same connection can never reuse a path. A workspace is owned by exactly
//! one process supervisor and destroyed on its terminal transition.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::ExecError;

/// One submitted source file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub name: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Process-wide sequence number for workspace naming
static WORKSPACE_SEQ: AtomicU64 = AtomicU64::new(0);

/// An isolated directory holding one execution's source files
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create the workspace directory and materialize the given files into it
    pub async fn provision(
        workspace_root: &Path,
        execution_id: &str,
        files: &[SourceFile],
    ) -> Result<Workspace, ExecError> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let seq = WORKSPACE_SEQ.fetch_add(1, Ordering::Relaxed);

        let dir = workspace_root.join(format!(
            "exec_{}_{}_{}",
            sanitize_id(execution_id),
            millis,
            seq
        ));

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create workspace {:?}", dir))
            .map_err(ExecError::Internal)?;

        let workspace = Workspace { root: dir };

        for file in files {
            let relative = validate_file_name(&file.name)?;
            let path = workspace.root.join(relative);

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))
                    .map_err(ExecError::Internal)?;
            }

            fs::write(&path, &file.content)
                .await
                .with_context(|| format!("Failed to write source file {:?}", path))
                .map_err(ExecError::Internal)?;
        }

        debug!("Provisioned workspace {:?}", workspace.root);
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove the workspace directory.
    ///
    /// Removal failures are logged and swallowed: a leftover directory must
    /// never prevent the execution's result from reaching the caller.
    pub async fn destroy(self) {
        if let Err(e) = fs::remove_dir_all(&self.root).await {
            warn!("Failed to remove workspace {:?}: {}", self.root, e);
        } else {
            debug!("Removed workspace {:?}", self.root);
        }
    }
}

/// Keep only path-safe characters from a connection/execution identifier
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Reject file names that could escape the workspace
fn validate_file_name(name: &str) -> Result<&Path, ExecError> {
    let path = Path::new(name);

    if name.is_empty() || path.is_absolute() {
        return Err(ExecError::InvalidFileName(name.to_string()));
    }

    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(ExecError::InvalidFileName(name.to_string())),
        }
    }

    Ok(path)
}
