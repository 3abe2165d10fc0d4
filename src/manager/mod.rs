//! Dynamic configuration of a running HAProxy without reloads.
//!
//! The [`ConfigManager`] trait is the capability the router consumes;
//! [`DynamicConfigManager`](dynamic::DynamicConfigManager) implements it
//! against the control socket. A router without a manager (`None`) simply
//! reloads for every change.
//!
//! - [`blueprint`] -- blueprint routes, their pre-provisioned pools and
//!   route-to-blueprint matching.
//! - [`entry`] -- per-route backend bookkeeping and map association
//!   generation.
//! - [`dynamic`] -- the orchestrator.

pub mod blueprint;
pub mod dynamic;
pub mod entry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DynconfError;
use crate::route::{Endpoint, RouteSpec};

pub use dynamic::{DynamicConfigManager, ManagerSnapshot};

/// Reload lifecycle notifications sent by the reload pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterEvent {
    ReloadStart,
    ReloadEnd,
    ReloadError,
}

/// What the manager needs from the surrounding router.
#[async_trait]
pub trait RouterInterface: Send + Sync {
    /// Add or replace a route in the desired configuration.
    async fn add_route(&self, route: &RouteSpec);

    async fn remove_route(&self, route: &RouteSpec);

    /// Request a (debounced) render and reload if anything changed.
    async fn commit(&self);
}

// async_trait is required here because ConfigManager is used as Arc<dyn ConfigManager>
// and native async fn in traits does not support dyn dispatch.
#[async_trait]
pub trait ConfigManager: Send + Sync {
    /// Remember the router and provision every blueprint pool through it.
    async fn initialize(&self, router: Arc<dyn RouterInterface>, cert_path: &str);

    /// Add or replace a custom blueprint route.
    async fn add_blueprint(&self, route: &RouteSpec) -> Result<(), DynconfError>;

    async fn remove_blueprint(&self, route: &RouteSpec);

    /// Track a route served by its permanent backend.
    async fn register(&self, id: &str, route: &RouteSpec);

    /// Serve `route` from a free blueprint pool slot.
    async fn add_route(
        &self,
        id: &str,
        routing_key: &str,
        route: &RouteSpec,
    ) -> Result<(), DynconfError>;

    async fn remove_route(&self, id: &str, route: &RouteSpec) -> Result<(), DynconfError>;

    /// Forget route `id` without touching HAProxy. A pool slot it held is
    /// not reused before the next reload.
    async fn unregister(&self, id: &str);

    /// Reconcile the route's servers with `new_endpoints`.
    async fn replace_route_endpoints(
        &self,
        id: &str,
        old_endpoints: &[Endpoint],
        new_endpoints: &[Endpoint],
        weight: u32,
    ) -> Result<(), DynconfError>;

    async fn remove_route_endpoints(
        &self,
        id: &str,
        endpoints: &[Endpoint],
    ) -> Result<(), DynconfError>;

    async fn notify(&self, event: RouterEvent);

    /// Name prefix of the dynamic servers declared for a backend.
    fn server_template_name(&self, id: &str) -> String;

    /// Number of dynamic servers declared for a backend.
    fn server_template_size(&self, id: &str) -> usize;

    fn generate_dynamic_server_names(&self, id: &str) -> Vec<String>;
}

pub const DEFAULT_BLUEPRINT_POOL_SIZE: usize = 10;
pub const DEFAULT_MAX_DYNAMIC_SERVERS: usize = 5;
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Pool size for blueprints without a pool-size annotation.
    pub blueprint_pool_size: usize,
    pub max_dynamic_servers: usize,
    /// Debounce before dynamically applied changes are persisted by a
    /// router commit.
    pub commit_interval: Duration,
    /// Namespace every blueprint and pool route lives in.
    pub blueprint_namespace: String,
    /// Operator-supplied blueprints, in addition to the per-termination defaults.
    pub blueprint_routes: Vec<RouteSpec>,
    pub wildcard_routes_allowed: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            blueprint_pool_size: DEFAULT_BLUEPRINT_POOL_SIZE,
            max_dynamic_servers: DEFAULT_MAX_DYNAMIC_SERVERS,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            blueprint_namespace: blueprint::DEFAULT_BLUEPRINT_NAMESPACE.to_string(),
            blueprint_routes: Vec::new(),
            wildcard_routes_allowed: false,
        }
    }
}
