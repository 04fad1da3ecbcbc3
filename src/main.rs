//! Laama Chat - a chat front-end for local models
//!
//! Serves a web interface over a local Ollama runtime. Conversations are
//! kept in SQLite so any past chat can be reopened and continued, and an
//! uploaded document can be attached as context for the next questions.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod conversation;
mod core;
mod documents;
mod providers;
mod routes;

use config::Config;
use crate::core::{ChatOrchestrator, SessionStore};
use routes::UiState;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub chat: Arc<ChatOrchestrator>,
    pub ui: Arc<Mutex<UiState>>,
    /// Fires when the server is shutting down
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config, chat: Arc<ChatOrchestrator>) -> Self {
        Self {
            config,
            chat,
            ui: Arc::new(Mutex::new(UiState::default())),
            shutdown: CancellationToken::new(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "laama_chat=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    if config.offline {
        tracing::info!(runtime = %config.ollama_url, "Offline mode: only the local runtime is used");
        match &config.embed_model_path {
            Some(path) if !path.exists() => {
                tracing::warn!(path = %path.display(), "Local embedding model not found")
            }
            Some(path) => tracing::info!(path = %path.display(), "Local embedding model available"),
            None => tracing::warn!("Offline mode without LAAMA_EMBED_MODEL_PATH"),
        }
    }

    let models = config.model_registry()?;
    tracing::info!(count = models.entries().len(), default = models.default_id(), "Models loaded");

    let store = Arc::new(SessionStore::open(&config.db_path()).await?);

    let runtime = providers::from_config(&config)?;
    let chat = Arc::new(ChatOrchestrator::new(store, runtime, models));

    let state = AppState::new(config, chat);
    let shutdown = state.shutdown.clone();

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Laama Chat running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
