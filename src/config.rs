//! Service configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Default wall-clock limit for a batch execution.
const DEFAULT_BATCH_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP/WebSocket server binds to
    pub bind_addr: String,
    /// Wall-clock limit for batch executions (interactive runs have none)
    pub batch_timeout: Duration,
    /// Directory under which per-execution workspaces are created
    pub workspace_root: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:5001".into());

        let batch_timeout_ms = match std::env::var("BATCH_TIMEOUT_MS") {
            Ok(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("Invalid BATCH_TIMEOUT_MS: {}", raw))?,
            Err(_) => DEFAULT_BATCH_TIMEOUT_MS,
        };

        let workspace_root = std::env::var("WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());

        Ok(Self {
            bind_addr,
            batch_timeout: Duration::from_millis(batch_timeout_ms),
            workspace_root,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5001".into(),
            batch_timeout: Duration::from_millis(DEFAULT_BATCH_TIMEOUT_MS),
            workspace_root: std::env::temp_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.batch_timeout, Duration::from_millis(5000));
        assert_eq!(config.bind_addr, "0.0.0.0:5001");
    }
}
