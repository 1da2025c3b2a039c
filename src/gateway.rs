//! Interactive execution gateway.
//!
//! Each WebSocket connection gets its own identity and drives the session
//! registry: `execute-code` starts a run (killing any prior run on the same
//! connection first), `terminal-input` feeds the active process's stdin, and
//! closing the socket triggers the disconnect cleanup. Output events are
//! relayed as `terminal-output` messages as they arrive.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::languages;
use crate::multiplexer::{OutputEvent, StreamKind};
use crate::workspace::SourceFile;
use crate::AppState;

/// Events received from the client
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum ClientEvent {
    ExecuteCode { language: String, file: SourceFile },
    TerminalInput { input: String },
}

/// Events sent to the client
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum ServerEvent {
    TerminalOutput {
        #[serde(rename = "type")]
        stream: StreamKind,
        data: String,
    },
}

impl From<OutputEvent> for ServerEvent {
    fn from(event: OutputEvent) -> Self {
        ServerEvent::TerminalOutput {
            stream: event.stream,
            data: event.data,
        }
    }
}

/// Connection identities; also used to namespace workspace directories
static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(0);

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(mut socket: WebSocket, state: AppState) {
    let connection_id = format!("conn-{}", CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed));
    info!("Client connected: {}", connection_id);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<OutputEvent>();

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_event(&text, &connection_id, &state, &events_tx).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error on {}: {}", connection_id, e);
                    break;
                }
            },
            Some(event) = events_rx.recv() => {
                match serde_json::to_string(&ServerEvent::from(event)) {
                    Ok(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to serialize output event: {}", e),
                }
            }
        }
    }

    info!("Client disconnected: {}", connection_id);

    // Close the event channel first so a lingering driver's output is
    // dropped instead of buffered for nobody, then reap the run.
    drop(events_rx);
    state.registry.disconnect(&connection_id).await;
}

async fn handle_client_event(
    text: &str,
    connection_id: &str,
    state: &AppState,
    events_tx: &mpsc::UnboundedSender<OutputEvent>,
) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!("Unrecognized event from {}: {}", connection_id, e);
            return;
        }
    };

    match event {
        ClientEvent::ExecuteCode { language, file } => {
            // Resolution failures (unsupported language, bad file name)
            // happen before any process exists and go straight back to the
            // terminal as a system line.
            let prepared = match languages::prepare_run(&language, vec![file]) {
                Ok(prepared) => prepared,
                Err(e) => {
                    let _ = events_tx.send(OutputEvent::system(e.to_string()));
                    return;
                }
            };

            if let Err(e) = state
                .registry
                .start_run(connection_id, prepared, events_tx.clone(), &state.config)
                .await
            {
                let _ = events_tx.send(OutputEvent::system(format!(
                    "Failed to start execution: {}",
                    e
                )));
            }
        }
        ClientEvent::TerminalInput { input } => {
            state.registry.send_input(connection_id, input).await;
        }
    }
}
