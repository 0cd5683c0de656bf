mod api;
mod config;
mod console;
mod error;
mod events;
mod lifecycle;
mod registry;
mod server;
mod state;
mod supervisor;

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, services::ServeDir};

use crate::supervisor::{SimulatedCommandChannel, SimulatedSupervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = config::config_path();
    let cfg = config::load_config(&config_path).await?;
    let bind_address = cfg.agent.bind_address.clone();
    let public_dir = cfg.agent.public_dir.clone();

    let state = state::AppState::new(
        cfg.clone(),
        config_path,
        Arc::new(SimulatedSupervisor::from_config(&cfg.lifecycle)),
        Arc::new(SimulatedCommandChannel),
    );

    // Autostart servers
    for server in &cfg.servers {
        if server.autostart {
            if let Err(e) = state.lifecycle.start(&server.id) {
                tracing::error!("Autostart failed for '{}': {}", server.id, e);
            }
        }
    }

    let app = Router::new()
        .route("/api/summary", get(api::summary))
        .route("/api/servers", get(api::list_servers).post(api::create_server))
        .route(
            "/api/servers/{id}",
            get(api::get_server).delete(api::delete_server),
        )
        .route("/api/servers/{id}/start", post(api::start_server_handler))
        .route("/api/servers/{id}/stop", post(api::stop_server_handler))
        .route("/api/servers/{id}/restart", post(api::restart_server_handler))
        .route("/api/servers/{id}/stats", put(api::report_stats))
        .route(
            "/api/servers/{id}/console/logs",
            get(api::console_logs)
                .post(api::append_console_log)
                .delete(api::clear_console_logs),
        )
        .route("/api/servers/{id}/console/export", get(api::export_console_logs))
        .route("/api/servers/{id}/console/commands", post(api::submit_command))
        .route("/api/servers/{id}/console/history", get(api::console_history))
        .route("/api/servers/{id}/console/history/older", post(api::history_older))
        .route("/api/servers/{id}/console/history/newer", post(api::history_newer))
        .route("/api/servers/{id}/console/ws", get(api::console_ws))
        .route("/api/events/ws", get(api::events_ws))
        .layer(CorsLayer::permissive())
        .with_state(state.clone())
        .fallback_service(ServeDir::new(public_dir));

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down servers...");
    state.lifecycle.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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
