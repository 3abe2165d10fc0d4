//! `GET /health` endpoint handler.
//!
//! Returns a [`HealthResponse`] JSON payload with the version and build,
//! uptime, the applied desired state, reload counters and, when dynamic
//! configuration is enabled, the manager's pool usage.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::router::RouterStatsSnapshot;
use crate::server::AppState;

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub build: BuildInfo,
    pub uptime_seconds: u64,
    pub desired: DesiredHealth,
    pub router: RouterHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
pub struct BuildInfo {
    pub git: String,
    pub profile: String,
}

#[derive(Serialize, Deserialize)]
pub struct DesiredHealth {
    pub source: String,
    pub version: String,
    pub loaded_ago_seconds: u64,
    pub routes: usize,
    pub endpoints: usize,
    pub refreshes: u64,
    pub refresh_failures: u64,
}

#[derive(Serialize, Deserialize)]
pub struct RouterHealth {
    pub reloads: u64,
    pub reload_failures: u64,
    pub dynamic_updates: u64,
    pub dynamic_fallbacks: u64,
}

impl From<RouterStatsSnapshot> for RouterHealth {
    fn from(s: RouterStatsSnapshot) -> Self {
        Self {
            reloads: s.reloads,
            reload_failures: s.reload_failures,
            dynamic_updates: s.dynamic_updates,
            dynamic_fallbacks: s.dynamic_fallbacks,
        }
    }
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (source_name, version_str, loaded_ago) = {
        let loaded = state.desired.read().await;
        let version_str = match &loaded.version {
            crate::config::ConfigVersion::Hash(h) => h.get(..8).unwrap_or(h).to_string(),
        };
        (
            loaded.source_name.clone(),
            version_str,
            loaded.loaded_at.elapsed().as_secs(),
        )
    };

    let (routes, endpoints) = state.router.counts().await;
    let router_stats = state.router.stats();

    let dynamic = match &state.manager {
        Some(manager) => serde_json::to_value(manager.snapshot().await).ok(),
        None => None,
    };

    let status = if router_stats.reload_failures > 0 && router_stats.reloads == 0 {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        build: BuildInfo {
            git: env!("DYNCONF_GIT_SHORT").to_string(),
            profile: env!("DYNCONF_BUILD_PROFILE").to_string(),
        },
        uptime_seconds: state.start_time.elapsed().as_secs(),
        desired: DesiredHealth {
            source: source_name,
            version: version_str,
            loaded_ago_seconds: loaded_ago,
            routes,
            endpoints,
            refreshes: state.stats.refreshes.load(Ordering::Relaxed),
            refresh_failures: state.stats.refresh_failures.load(Ordering::Relaxed),
        },
        router: router_stats.into(),
        dynamic,
    })
}
