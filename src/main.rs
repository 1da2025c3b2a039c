//! code-runner — multi-language code execution service.
//!
//! Two entry points share one execution core: a synchronous batch REST
//! endpoint (`POST /api/code/run`) and a WebSocket gateway that streams an
//! interactive terminal. The core provisions an isolated workspace per
//! execution, resolves the language's compile/run pipeline, supervises the
//! child process tree, and guarantees cleanup on every exit path.

mod batch;
mod config;
mod error;
mod gateway;
mod languages;
mod multiplexer;
mod registry;
mod supervisor;
mod workspace;

use std::sync::Arc;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use tracing::info;

use crate::config::Config;
use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("code_runner=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    languages::init_languages()?;
    info!(
        "Loaded {} toolchain profiles",
        languages::supported_languages().len()
    );

    let config = Arc::new(Config::from_env()?);
    tokio::fs::create_dir_all(&config.workspace_root).await?;
    info!(
        "Workspace root: {:?}, batch timeout: {:?}",
        config.workspace_root, config.batch_timeout
    );

    let state = AppState {
        config: config.clone(),
        registry: Arc::new(SessionRegistry::new()),
    };

    let app = Router::new()
        .route("/api/code/run", post(batch::run_code))
        .route("/api/code/stream", get(gateway::ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
