use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::chat::{ChatSink, ChatWebhook};
use crate::config::AppConfig;
use crate::error::Result;
use crate::model::{GenModelClient, Summarizer};
use crate::platform::github::GitHubPlatform;
use crate::platform::Platform;
use crate::queue::QueueRepository;
use crate::store::Store;

/// Shared state behind every request handler and worker.
pub struct AppState {
    pub config: AppConfig,
    pub store: Store,
    pub queue: QueueRepository,
    pub platform: Arc<dyn Platform>,
    pub summarizer: Arc<dyn Summarizer>,
    pub chat: Arc<dyn ChatSink>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let store = Store::connect(&config.store.url).await?;
        let queue = QueueRepository::new(store.pool().clone());
        let platform = Arc::new(GitHubPlatform::new(&config.github)?);
        let summarizer = Arc::new(GenModelClient::new(&config.model));
        let chat = Arc::new(ChatWebhook::new(&config.chat.webhook_url));

        Ok(Self {
            config,
            store,
            queue,
            platform,
            summarizer,
            chat,
        })
    }

    /// Assemble state from explicit components. Test seam: scenarios inject
    /// stub platform, summarizer, and chat sink implementations.
    pub fn with_components(
        config: AppConfig,
        store: Store,
        platform: Arc<dyn Platform>,
        summarizer: Arc<dyn Summarizer>,
        chat: Arc<dyn ChatSink>,
    ) -> Self {
        let queue = QueueRepository::new(store.pool().clone());
        Self {
            config,
            store,
            queue,
            platform,
            summarizer,
            chat,
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/webhooks/platform",
            post(crate::webhook::handler::handle_webhook),
        )
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "ok"}))),
        Err(e) => {
            tracing::error!(error = %e, "Health check failed to reach store");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"status": "degraded"})),
            )
        }
    }
}
