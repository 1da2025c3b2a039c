//! Session registry for the interactive path.
//!
//! Maps a connection identity to its currently active run. The central
//! invariant: at most one live process per connection. Starting a new run
//! kills the previous one and waits for that kill to complete before the
//! new process is spawned; disconnect does the same and removes the entry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::ExecError;
use crate::languages::PreparedRun;
use crate::multiplexer::OutputEvent;
use crate::supervisor::Supervisor;
use crate::workspace::Workspace;

/// Handle to one in-flight interactive run
struct RunHandle {
    input_tx: mpsc::Sender<String>,
    cancel: Arc<Notify>,
    driver: JoinHandle<()>,
}

impl RunHandle {
    /// Request termination and wait until the driver task has finished,
    /// which includes the final system event and workspace destruction.
    ///
    /// Safe to await from the event consumer itself: the driver sends on an
    /// unbounded channel and never waits for anyone to read.
    async fn kill(self) {
        self.cancel.notify_one();
        drop(self.input_tx);
        let _ = self.driver.await;
    }
}

/// Registry of active runs, keyed by connection identity
pub struct SessionRegistry {
    runs: Mutex<HashMap<String, RunHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Start a run for `connection_id`, killing any prior run first.
    ///
    /// The prior process is confirmed dead before the new workspace is
    /// provisioned; there is no overlap window.
    pub async fn start_run(
        &self,
        connection_id: &str,
        prepared: PreparedRun,
        events: mpsc::UnboundedSender<OutputEvent>,
        config: &Config,
    ) -> Result<(), ExecError> {
        let previous = self.runs.lock().await.remove(connection_id);
        if let Some(handle) = previous {
            debug!("Replacing active run for connection {}", connection_id);
            handle.kill().await;
        }

        let workspace =
            Workspace::provision(&config.workspace_root, connection_id, &prepared.files).await?;

        let (input_tx, input_rx) = mpsc::channel(64);
        let cancel = Arc::new(Notify::new());
        let supervisor = Supervisor::new(workspace);

        let driver = tokio::spawn(supervisor.run_interactive(
            prepared.pipeline,
            prepared.entry,
            events,
            input_rx,
            cancel.clone(),
        ));

        self.runs.lock().await.insert(
            connection_id.to_string(),
            RunHandle {
                input_tx,
                cancel,
                driver,
            },
        );

        info!("Started run for connection {}", connection_id);
        Ok(())
    }

    /// Forward one input line to the connection's active process.
    ///
    /// A no-op when nothing is running (or the process has already exited
    /// and its stdin writer is gone).
    pub async fn send_input(&self, connection_id: &str, line: String) {
        let sender = self
            .runs
            .lock()
            .await
            .get(connection_id)
            .map(|handle| handle.input_tx.clone());

        if let Some(tx) = sender {
            let _ = tx.send(line).await;
        }
    }

    /// Kill the connection's active run (if any) and drop its entry.
    ///
    /// The only cleanup path guaranteed to fire when a client vanishes.
    pub async fn disconnect(&self, connection_id: &str) {
        let handle = self.runs.lock().await.remove(connection_id);
        if let Some(handle) = handle {
            info!("Cleaning up run for disconnected connection {}", connection_id);
            handle.kill().await;
        }
    }

    #[cfg(test)]
    async fn active_count(&self) -> usize {
        self.runs.lock().await.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::languages::{CommandPipeline, CommandStep};
    use crate::multiplexer::StreamKind;
    use crate::workspace::SourceFile;
    use std::time::Duration;

    fn sh_run(script: &str) -> PreparedRun {
        PreparedRun {
            entry: "main.sh".into(),
            files: vec![SourceFile::new("main.sh", script)],
            pipeline: CommandPipeline {
                compile: vec![],
                run: CommandStep {
                    program: "sh".into(),
                    args: vec!["-c".into(), script.into()],
                },
            },
        }
    }

    fn test_config(root: &std::path::Path) -> Config {
        Config {
            workspace_root: root.to_path_buf(),
            ..Config::default()
        }
    }

    async fn next_system_event(rx: &mut mpsc::UnboundedReceiver<OutputEvent>) -> OutputEvent {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if ev.stream == StreamKind::System {
                return ev;
            }
        }
    }

    #[tokio::test]
    async fn second_run_replaces_the_first() {
        let base = tempfile::tempdir().unwrap();
        let config = test_config(base.path());
        let registry = SessionRegistry::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        registry
            .start_run("conn-1", sh_run("sleep 30"), events_tx.clone(), &config)
            .await
            .unwrap();

        // Launch banner for the first run
        let ev = next_system_event(&mut events_rx).await;
        assert!(ev.data.contains("Launching"));

        registry
            .start_run("conn-1", sh_run("printf done"), events_tx.clone(), &config)
            .await
            .unwrap();

        // The first run is confirmed killed before the second starts
        let ev = next_system_event(&mut events_rx).await;
        assert!(ev.data.contains("terminated"), "got: {}", ev.data);

        assert_eq!(registry.active_count().await, 1);

        // Second run completes normally
        let ev = next_system_event(&mut events_rx).await;
        assert!(ev.data.contains("Launching"));
        let ev = next_system_event(&mut events_rx).await;
        assert!(ev.data.contains("exited with code 0"), "got: {}", ev.data);
    }

    #[tokio::test]
    async fn input_reaches_the_active_run() {
        let base = tempfile::tempdir().unwrap();
        let config = test_config(base.path());
        let registry = SessionRegistry::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        registry
            .start_run(
                "conn-2",
                sh_run("read line; echo \"got $line\""),
                events_tx,
                &config,
            )
            .await
            .unwrap();

        registry.send_input("conn-2", "hello".into()).await;

        let mut saw_echo = false;
        while let Some(ev) = tokio::time::timeout(Duration::from_secs(10), events_rx.recv())
            .await
            .expect("timed out waiting for events")
        {
            if ev.stream == StreamKind::Stdout && ev.data.contains("got hello") {
                saw_echo = true;
            }
            if ev.stream == StreamKind::System && ev.data.contains("exited") {
                break;
            }
        }
        assert!(saw_echo);
    }

    #[tokio::test]
    async fn replacing_a_completed_chatty_run_does_not_wedge() {
        let base = tempfile::tempdir().unwrap();
        let config = test_config(base.path());
        let registry = SessionRegistry::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        // A run that floods output and exits on its own. Nothing drains the
        // channel while it does.
        registry
            .start_run("conn-4", sh_run("seq 1 10000"), events_tx.clone(), &config)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // Replacing the exited-but-undrained run must complete even though
        // the caller is the one who would drain the events.
        tokio::time::timeout(
            Duration::from_secs(5),
            registry.start_run("conn-4", sh_run("printf done"), events_tx, &config),
        )
        .await
        .expect("start_run wedged replacing a completed chatty run")
        .unwrap();

        let ev = next_system_event(&mut events_rx).await;
        assert!(ev.data.contains("Launching"));

        // Both runs close out with a terminal notice and the second run's
        // output arrives in between.
        let mut terminal_notices = 0;
        let mut saw_done = false;
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(10), events_rx.recv())
                .await
                .expect("timed out waiting for events")
                .expect("event channel closed");
            if ev.stream == StreamKind::Stdout && ev.data.contains("done") {
                saw_done = true;
            }
            if ev.stream == StreamKind::System
                && (ev.data.contains("exited") || ev.data.contains("terminated"))
            {
                terminal_notices += 1;
                if terminal_notices == 2 {
                    break;
                }
            }
        }
        assert!(saw_done);
        assert_eq!(registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn input_without_a_run_is_a_no_op() {
        let registry = SessionRegistry::new();
        registry.send_input("nobody", "hello".into()).await;
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_kills_and_clears_the_entry() {
        let base = tempfile::tempdir().unwrap();
        let config = test_config(base.path());
        let registry = SessionRegistry::new();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        registry
            .start_run("conn-3", sh_run("sleep 30"), events_tx, &config)
            .await
            .unwrap();
        assert_eq!(registry.active_count().await, 1);

        registry.disconnect("conn-3").await;
        assert_eq!(registry.active_count().await, 0);

        // Workspace directories are gone once disconnect returns
        let leftovers: Vec<_> = std::fs::read_dir(base.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "workspaces not cleaned: {:?}", leftovers);

        let ev = next_system_event(&mut events_rx).await;
        assert!(ev.data.contains("Launching"));
        let ev = next_system_event(&mut events_rx).await;
        assert!(ev.data.contains("terminated"));
    }
}
