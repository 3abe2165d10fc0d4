//! Axum server setup, shared application state, and graceful shutdown.
//!
//! Contains [`AppState`] (the `Arc`-shared state holding the router, the
//! optional dynamic manager, desired-state metadata and uptime),
//! [`build_router`] for the health endpoint with its middleware layers,
//! and [`shutdown_signal`] for SIGTERM / Ctrl+C handling.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::ConfigVersion;
use crate::health::health_handler;
use crate::manager::DynamicConfigManager;
use crate::router::TemplateRouter;

/// Metadata of the desired state currently applied.
#[derive(Debug)]
pub struct LoadedState {
    pub version: ConfigVersion,
    pub source_name: String,
    pub loaded_at: Instant,
}

#[derive(Debug, Default)]
pub struct Stats {
    /// Desired-state changes picked up by the poll loop.
    pub refreshes: AtomicU64,
    pub refresh_failures: AtomicU64,
}

pub struct AppState {
    pub router: Arc<TemplateRouter>,
    pub manager: Option<DynamicConfigManager>,
    pub desired: RwLock<LoadedState>,
    pub start_time: Instant,
    pub stats: Stats,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
