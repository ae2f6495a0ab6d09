use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use canopy::config::AppConfig;
use canopy::queue;
use canopy::server::{create_router, AppState};
use canopy::shutdown::{wait_for_signal, WorkerSet};
use canopy::workers::{NotificationWorker, SummaryWorker};

#[derive(Parser)]
#[command(name = "canopy", about = "Pull-request risk analysis and notification pipeline")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;

    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        chat_enabled = config.chat.enabled,
        "Starting Canopy server"
    );

    let state = Arc::new(AppState::new(config.clone()).await?);

    // Worker pools for both queues, plus queue upkeep.
    let mut workers = WorkerSet::new();

    let summary_handler = Arc::new(SummaryWorker::new(Arc::clone(&state)));
    workers.register(tokio::spawn(queue::run_worker_pool(
        state.queue.clone(),
        config.queue.clone(),
        summary_handler,
        workers.shutdown_sender(),
    )));

    let notify_handler = Arc::new(NotificationWorker::new(Arc::clone(&state)));
    workers.register(tokio::spawn(queue::run_worker_pool(
        state.queue.clone(),
        config.queue.clone(),
        notify_handler,
        workers.shutdown_sender(),
    )));

    workers.register(tokio::spawn(queue::run_maintenance(
        state.queue.clone(),
        config.queue.clone(),
        workers.shutdown_sender(),
    )));

    let app = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(format!(
        "{}:{}",
        config.server.host, config.server.port
    ))
    .await?;

    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_signal())
        .await?;

    // The listener is closed; let in-flight jobs finish before exiting.
    workers.drain().await;
    tracing::info!("Shutdown complete");

    Ok(())
}
