//! Desired routing state and the reload pipeline.
//!
//! [`TemplateRouter`] owns the routes and endpoints HAProxy should serve.
//! Every change is first offered to the [`ConfigManager`] so it can be
//! applied to the running process; if that fails (or no manager is
//! configured) the router marks itself dirty and asks the
//! [`CoalescingScheduler`] for a reload. A reload renders the state to
//! the state file, runs the reload command and reports the outcome back
//! to the manager.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::model::{service_key, DesiredState};
use crate::config::sources::sha256_hex;
use crate::error::DynconfError;
use crate::haproxy::map::sort_by_specificity;
use crate::manager::entry::{backend_name, RouteBackendEntry};
use crate::manager::{ConfigManager, RouterEvent, RouterInterface};
use crate::route::{Endpoint, RouteSpec};
use crate::scheduler::CoalescingScheduler;

pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RouterOptions {
    /// Minimum time between two reload starts.
    pub reload_interval: Duration,
    /// Shell command that makes HAProxy pick up the rendered state.
    pub reload_command: Option<String>,
    /// Where the rendered state is written before each reload.
    pub state_file: Option<PathBuf>,
    pub cert_path: String,
    pub wildcard_routes_allowed: bool,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            reload_interval: DEFAULT_RELOAD_INTERVAL,
            reload_command: None,
            state_file: None,
            cert_path: String::new(),
            wildcard_routes_allowed: false,
        }
    }
}

#[derive(Debug, Default)]
struct RouterStats {
    reloads: AtomicU64,
    reload_failures: AtomicU64,
    dynamic_updates: AtomicU64,
    dynamic_fallbacks: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStatsSnapshot {
    pub reloads: u64,
    pub reload_failures: u64,
    pub dynamic_updates: u64,
    pub dynamic_fallbacks: u64,
}

#[derive(Default)]
struct RouterState {
    /// Desired routes by id.
    routes: BTreeMap<String, RouteSpec>,
    /// Pool and marker routes added by the manager.
    managed: BTreeMap<String, RouteSpec>,
    /// Endpoints by `<namespace>/<service>`.
    endpoints: BTreeMap<String, Vec<Endpoint>>,
    blueprints: Vec<RouteSpec>,
    dirty: bool,
    synced: bool,
}

impl RouterState {
    fn endpoints_for(&self, route: &RouteSpec) -> Vec<Endpoint> {
        self.endpoints
            .get(&service_key(&route.namespace, &route.service))
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedServer {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedBackend {
    pub name: String,
    pub route: String,
    pub servers: Vec<RenderedServer>,
    /// Placeholder servers declared for runtime endpoint binding.
    pub dynamic_servers: Vec<String>,
}

/// The configuration a reload hands to HAProxy: backends with their
/// servers and the content of every map, most specific pattern first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenderedConfig {
    pub backends: Vec<RenderedBackend>,
    pub maps: BTreeMap<String, Vec<(String, String)>>,
}

pub struct TemplateRouter {
    manager: Option<Arc<dyn ConfigManager>>,
    options: RouterOptions,
    state: Mutex<RouterState>,
    scheduler: CoalescingScheduler,
    stats: RouterStats,
}

impl std::fmt::Debug for TemplateRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRouter")
            .field("options", &self.options)
            .field("dynamic", &self.manager.is_some())
            .finish_non_exhaustive()
    }
}

/// Cookie key for a route: stable across backends and reloads.
fn routing_key(id: &str) -> String {
    sha256_hex(id.as_bytes())
}

impl TemplateRouter {
    #[must_use]
    pub fn new(options: RouterOptions, manager: Option<Arc<dyn ConfigManager>>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let handle = weak.clone();
            let scheduler = CoalescingScheduler::new(options.reload_interval, move || {
                let router = handle.clone();
                async move {
                    if let Some(router) = router.upgrade() {
                        router.reload().await;
                    }
                }
            });
            Self {
                manager,
                options,
                state: Mutex::new(RouterState::default()),
                scheduler,
                stats: RouterStats::default(),
            }
        })
    }

    /// Hand the router to the manager, which provisions its pools.
    pub async fn start(self: &Arc<Self>) {
        if let Some(manager) = &self.manager {
            let router: Arc<dyn RouterInterface> = Arc::clone(self) as Arc<dyn RouterInterface>;
            manager.initialize(router, &self.options.cert_path).await;
        }
    }

    /// Stop reloading; waits for a reload in flight.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    #[must_use]
    pub fn stats(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            reloads: self.stats.reloads.load(Ordering::Relaxed),
            reload_failures: self.stats.reload_failures.load(Ordering::Relaxed),
            dynamic_updates: self.stats.dynamic_updates.load(Ordering::Relaxed),
            dynamic_fallbacks: self.stats.dynamic_fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Desired route and endpoint counts.
    pub async fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (
            state.routes.len(),
            state.endpoints.values().map(Vec::len).sum(),
        )
    }

    pub async fn route(&self, id: &str) -> Option<RouteSpec> {
        self.state.lock().await.routes.get(id).cloned()
    }

    /// Ids of routes added by the manager (pool and marker routes).
    pub async fn managed_routes(&self) -> Vec<String> {
        self.state.lock().await.managed.keys().cloned().collect()
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    /// Apply a freshly loaded desired state. The first call (and every
    /// call without a manager) goes straight to a reload; later calls are
    /// diffed and applied route by route.
    pub async fn sync(&self, desired: &DesiredState) {
        let first = {
            let mut state = self.state.lock().await;
            !std::mem::replace(&mut state.synced, true)
        };
        let Some(manager) = self.manager.clone().filter(|_| !first) else {
            self.replace_all(desired).await;
            return;
        };

        let previous_blueprints = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut state.blueprints, desired.blueprints.clone())
        };
        for old in &previous_blueprints {
            if !desired.blueprints.iter().any(|b| b.name == old.name) {
                manager.remove_blueprint(old).await;
            }
        }
        for blueprint in &desired.blueprints {
            if !previous_blueprints.contains(blueprint) {
                if let Err(e) = manager.add_blueprint(blueprint).await {
                    tracing::warn!(blueprint = %blueprint.name, error = %e, "blueprint rejected");
                }
            }
        }

        let (stale_routes, stale_services) = {
            let state = self.state.lock().await;
            let stale_routes: Vec<String> = state
                .routes
                .keys()
                .filter(|id| !desired.routes.iter().any(|r| r.id() == **id))
                .cloned()
                .collect();
            let stale_services: Vec<String> = state
                .endpoints
                .keys()
                .filter(|key| !desired.endpoints.contains_key(*key))
                .cloned()
                .collect();
            (stale_routes, stale_services)
        };

        for key in stale_services {
            self.update_endpoints(&key, Vec::new()).await;
        }
        for (key, endpoints) in &desired.endpoints {
            self.update_endpoints(key, endpoints.clone()).await;
        }
        for id in stale_routes {
            self.delete_route(&id).await;
        }
        for route in &desired.routes {
            self.upsert_route(route.clone()).await;
        }
    }

    async fn replace_all(&self, desired: &DesiredState) {
        {
            let mut state = self.state.lock().await;
            state.routes = desired
                .routes
                .iter()
                .map(|r| (r.id(), r.clone()))
                .collect();
            state.endpoints = desired.endpoints.clone();
            state.blueprints = desired.blueprints.clone();
            state.dirty = true;
        }
        if let Some(manager) = &self.manager {
            for blueprint in &desired.blueprints {
                if let Err(e) = manager.add_blueprint(blueprint).await {
                    tracing::warn!(blueprint = %blueprint.name, error = %e, "blueprint rejected");
                }
            }
            for route in &desired.routes {
                manager.register(&route.id(), route).await;
            }
        }
        tracing::info!(
            routes = desired.routes.len(),
            endpoints = desired.total_endpoints(),
            "desired state replaced"
        );
        self.commit().await;
    }

    /// Fall back to a reload.
    async fn fallback(&self, what: &str, id: &str, error: Option<&DynconfError>) {
        if self.manager.is_some() {
            self.stats.dynamic_fallbacks.fetch_add(1, Ordering::Relaxed);
            match error {
                Some(e) => tracing::info!(%what, route = %id, error = %e, "dynamic update failed, falling back to reload"),
                None => tracing::debug!(%what, route = %id, "change needs a reload"),
            }
        }
        self.state.lock().await.dirty = true;
        self.commit().await;
    }

    /// Add a route or replace an existing one with the same id.
    pub async fn upsert_route(&self, route: RouteSpec) {
        let id = route.id();
        let (previous, endpoints) = {
            let mut state = self.state.lock().await;
            let previous = state.routes.insert(id.clone(), route.clone());
            if previous.as_ref() == Some(&route) {
                return;
            }
            (previous, state.endpoints_for(&route))
        };

        let Some(manager) = &self.manager else {
            self.fallback("upsert", &id, None).await;
            return;
        };

        let applied = async {
            if let Some(previous) = &previous {
                manager.remove_route(&id, previous).await?;
            }
            manager.add_route(&id, &routing_key(&id), &route).await?;
            if !endpoints.is_empty() {
                manager
                    .replace_route_endpoints(&id, &[], &endpoints, route.weight)
                    .await?;
            }
            Ok::<(), DynconfError>(())
        }
        .await;

        match applied {
            Ok(()) => {
                self.stats.dynamic_updates.fetch_add(1, Ordering::Relaxed);
                tracing::info!(route = %id, host = %route.host, replaced = previous.is_some(), "route applied");
            }
            Err(e) => {
                manager.register(&id, &route).await;
                self.fallback("upsert", &id, Some(&e)).await;
            }
        }
    }

    pub async fn delete_route(&self, id: &str) {
        let Some(removed) = self.state.lock().await.routes.remove(id) else {
            return;
        };

        let Some(manager) = &self.manager else {
            self.fallback("delete", id, None).await;
            return;
        };
        match manager.remove_route(id, &removed).await {
            Ok(()) => {
                self.stats.dynamic_updates.fetch_add(1, Ordering::Relaxed);
                tracing::info!(route = %id, "route deleted");
            }
            Err(e) => {
                manager.unregister(id).await;
                self.fallback("delete", id, Some(&e)).await;
            }
        }
    }

    /// Replace the endpoints of service `key` (`<namespace>/<service>`).
    /// An empty list removes the service's endpoints.
    pub async fn update_endpoints(&self, key: &str, endpoints: Vec<Endpoint>) {
        let (old, routes) = {
            let mut state = self.state.lock().await;
            let old = if endpoints.is_empty() {
                state.endpoints.remove(key)
            } else {
                state.endpoints.insert(key.to_string(), endpoints.clone())
            }
            .unwrap_or_default();
            if old == endpoints {
                return;
            }
            let routes: Vec<RouteSpec> = state
                .routes
                .values()
                .filter(|r| service_key(&r.namespace, &r.service) == key)
                .cloned()
                .collect();
            (old, routes)
        };
        if routes.is_empty() {
            // Not rendered anywhere; picked up with the next route using it.
            return;
        }

        let Some(manager) = &self.manager else {
            self.fallback("endpoints", key, None).await;
            return;
        };
        for route in &routes {
            let id = route.id();
            let result = if endpoints.is_empty() {
                manager.remove_route_endpoints(&id, &old).await
            } else {
                manager
                    .replace_route_endpoints(&id, &old, &endpoints, route.weight)
                    .await
            };
            if let Err(e) = result {
                self.fallback("endpoints", &id, Some(&e)).await;
                return;
            }
        }
        self.stats.dynamic_updates.fetch_add(1, Ordering::Relaxed);
        tracing::info!(service = %key, endpoints = endpoints.len(), routes = routes.len(), "endpoints applied");
    }

    /// Render the current state the way a reload would.
    pub async fn rendered(&self) -> RenderedConfig {
        let state = self.state.lock().await;
        self.render(&state)
    }

    fn render(&self, state: &RouterState) -> RenderedConfig {
        let mut rendered = RenderedConfig::default();

        for (id, route) in state.routes.iter().chain(state.managed.iter()) {
            let name = backend_name(route.termination(), id);
            let servers = state
                .endpoints_for(route)
                .into_iter()
                .map(|e| RenderedServer {
                    name: e.id,
                    ip: e.ip,
                    port: e.port,
                    weight: route.weight,
                })
                .collect();
            let dynamic_servers = self
                .manager
                .as_ref()
                .map(|m| m.generate_dynamic_server_names(&name))
                .unwrap_or_default();
            rendered.backends.push(RenderedBackend {
                name,
                route: id.clone(),
                servers,
                dynamic_servers,
            });

            let entry = RouteBackendEntry::new(id, route, self.options.wildcard_routes_allowed);
            for (map, patterns) in entry.map_associations {
                rendered
                    .maps
                    .entry(map)
                    .or_default()
                    .extend(patterns.into_iter());
            }
        }

        for entries in rendered.maps.values_mut() {
            sort_by_specificity(entries);
        }
        rendered
    }

    /// Scheduler handler.
    async fn reload(&self) {
        let started = Instant::now();
        if let Some(manager) = &self.manager {
            manager.notify(RouterEvent::ReloadStart).await;
        }

        match self.write_and_reload().await {
            Ok(()) => {
                self.stats.reloads.fetch_add(1, Ordering::Relaxed);
                tracing::info!(elapsed = ?started.elapsed(), "reload complete");
                if let Some(manager) = &self.manager {
                    manager.notify(RouterEvent::ReloadEnd).await;
                }
            }
            Err(e) => {
                self.stats.reload_failures.fetch_add(1, Ordering::Relaxed);
                self.state.lock().await.dirty = true;
                tracing::error!(error = %e, "reload failed");
                if let Some(manager) = &self.manager {
                    manager.notify(RouterEvent::ReloadError).await;
                }
            }
        }
    }

    async fn write_and_reload(&self) -> Result<(), DynconfError> {
        let rendered = {
            let mut state = self.state.lock().await;
            state.dirty = false;
            self.render(&state)
        };

        if let Some(path) = &self.options.state_file {
            write_state_file(path, &rendered).await?;
        }
        if let Some(command) = &self.options.reload_command {
            run_reload_command(command).await?;
        }
        Ok(())
    }
}

/// Write through a temporary file so readers never see a partial file.
async fn write_state_file(path: &Path, rendered: &RenderedConfig) -> Result<(), DynconfError> {
    let json = serde_json::to_vec_pretty(rendered)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    tracing::debug!(path = %path.display(), backends = rendered.backends.len(), "state file written");
    Ok(())
}

async fn run_reload_command(command: &str) -> Result<(), DynconfError> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(DynconfError::ReloadFailed(if stderr.is_empty() {
        output.status.to_string()
    } else {
        stderr
    }))
}

#[async_trait]
impl RouterInterface for TemplateRouter {
    async fn add_route(&self, route: &RouteSpec) {
        let mut state = self.state.lock().await;
        state.managed.insert(route.id(), route.clone());
        state.dirty = true;
    }

    async fn remove_route(&self, route: &RouteSpec) {
        let mut state = self.state.lock().await;
        if state.managed.remove(&route.id()).is_some() {
            state.dirty = true;
        }
    }

    async fn commit(&self) {
        if self.state.lock().await.dirty {
            self.scheduler.register_change();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::entry::HTTP_BACKEND_MAP;

    fn route(name: &str, host: &str) -> RouteSpec {
        let mut route = RouteSpec::new("shop", name);
        route.host = host.into();
        route.service = "web".into();
        route
    }

    #[tokio::test]
    async fn render_orders_maps_by_specificity() {
        let router = TemplateRouter::new(RouterOptions::default(), None);
        let desired = DesiredState {
            routes: vec![route("b", "route.test"), route("a", "sub.route.test")],
            endpoints: BTreeMap::from([(
                "shop/web".to_string(),
                vec![Endpoint {
                    id: "pod-1".into(),
                    ip: "10.0.0.1".into(),
                    port: 8080,
                    app_protocol: None,
                }],
            )]),
            ..DesiredState::default()
        };
        router.sync(&desired).await;

        let rendered = router.rendered().await;
        let keys: Vec<&str> = rendered.maps[HTTP_BACKEND_MAP]
            .iter()
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(
            keys,
            vec![r"^sub\.route\.test(:[0-9]+)?(/.*)?$", r"^route\.test(:[0-9]+)?(/.*)?$"]
        );
        assert_eq!(rendered.backends.len(), 2);
        assert_eq!(rendered.backends[0].servers[0].name, "pod-1");
        assert!(rendered.backends[0].dynamic_servers.is_empty());
    }

    #[tokio::test]
    async fn unchanged_routes_are_ignored() {
        let router = TemplateRouter::new(RouterOptions::default(), None);
        router.upsert_route(route("a", "a.test")).await;
        router.state.lock().await.dirty = false;
        router.upsert_route(route("a", "a.test")).await;
        assert!(!router.is_dirty().await);
    }

    #[test]
    fn routing_key_is_stable() {
        assert_eq!(routing_key("shop:web"), routing_key("shop:web"));
        assert_ne!(routing_key("shop:web"), routing_key("shop:api"));
        assert_eq!(routing_key("shop:web").len(), 64);
    }
}
