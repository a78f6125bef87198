use anyhow::Result;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use gatekeeper_server::config::Config;
use gatekeeper_server::templates::BuiltinTemplates;
use gatekeeper_server::webhook::webhook_router;
use gatekeeper_server::{
    AppState, GitHubClient, InstallationConnector, LocalPolicySource, PolicySource,
    RecordingLogger, RepositoryEventQueue, RepositoryPolicySource, ReviewDispatcher,
    ReviewOrchestrator, ReviewSettings,
};

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "gatekeeper",
        "version": gatekeeper_server::get_bot_version(),
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config =
        Config::from_env().expect("Failed to load configuration from environment variables");

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    info!("Starting gatekeeper {}", gatekeeper_server::get_bot_version());

    let recording_logger = if config.recording_enabled {
        info!(
            "Recording enabled, logging to: {}",
            config.recording_log_path
        );
        Some(RecordingLogger::new(PathBuf::from(&config.recording_log_path)))
    } else {
        None
    };

    let github_client = Arc::new(GitHubClient::new_app(
        config.github_app_id,
        config.github_private_key.clone(),
        &config.github_api_url,
        recording_logger.clone(),
    ));

    let policy_source: Arc<dyn PolicySource> = match &config.local_config_path {
        Some(dir) => {
            info!("Using local policy from {}", dir.display());
            Arc::new(LocalPolicySource::new(dir))
        }
        None => Arc::new(RepositoryPolicySource::new(github_client.clone())),
    };

    let connector = Arc::new(InstallationConnector::new(
        github_client,
        config.github_approver_token.clone(),
    ));
    let orchestrator = Arc::new(ReviewOrchestrator::new(
        connector,
        Arc::new(BuiltinTemplates),
        ReviewSettings {
            log_search_url: config.log_search_url.clone(),
            ..Default::default()
        },
    ));

    let queue = RepositoryEventQueue::new();
    info!("Reviewer mode: {:?}", config.reviewer_type);
    let dispatcher = Arc::new(ReviewDispatcher::new(
        orchestrator,
        queue.clone(),
        config.reviewer_type,
    ));

    let app_state = Arc::new(AppState {
        webhook_secret: config.github_webhook_secret.clone(),
        dispatcher,
        policy_source,
        recording_logger,
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(webhook_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    queue.drain_and_shutdown().await;
    info!("Shutdown complete");

    Ok(())
}
