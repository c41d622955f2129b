//! RunMyModel backend server.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use rmm_backend::config::Config;
use rmm_backend::engine::LlamaServerRuntime;
use rmm_backend::state::AppState;
use rmm_backend::{api, logging};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_HASH: &str = env!("GIT_HASH");

fn print_version() {
    println!("rmm-backend {} ({})", VERSION, GIT_HASH);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        print_version();
        return Ok(());
    }

    // Load configuration
    let config = Config::load().map_err(|e| format!("Failed to load configuration: {}", e))?;

    logging::init(&config.logging.level);
    tracing::info!("Starting rmm-backend {} ({})", VERSION, GIT_HASH);

    config.paths.ensure_dirs()?;
    tracing::info!("Models directory: {}", config.paths.models_dir().display());
    tracing::info!("Prompts directory: {}", config.paths.prompts_dir().display());

    let runtime = Arc::new(LlamaServerRuntime::new(config.llama_server.clone()));
    tracing::info!(
        "Using llama-server runtime: binary={}",
        config.llama_server.binary
    );

    // Create shared state
    let state = Arc::new(AppState::new(config.clone(), runtime));

    let available = state.manager.refresh_catalog().await;
    tracing::info!("Found {} available models", available.len());

    let sweeper = state
        .sessions
        .clone()
        .spawn_sweeper(Duration::from_secs(config.sessions.sweep_interval_secs.max(1)));

    let app = api::app(state.clone());

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down, unloading all models");
    sweeper.abort();
    state.manager.unload_all().await;
    tracing::info!("All models unloaded");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
