//! [`DynamicConfigManager`]: applies route and endpoint changes through
//! the control socket.
//!
//! State lives behind one async mutex. Operations hold it only to read
//! and update bookkeeping, never across control socket I/O: they snapshot
//! what they need, release the lock, talk to HAProxy, then re-acquire the
//! lock to record the outcome. Results recorded after a reload has reset
//! the state are dropped (tracked through a reload generation counter).
//!
//! Successful dynamic changes arm a commit timer; when it fires the
//! router is asked to persist everything with a regular reload.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::blueprint;
use super::entry::{association_pairs, backend_name, MapAssociations, PoolSlot, RouteBackendEntry};
use super::{ConfigManager, ManagerOptions, RouterEvent, RouterInterface};
use crate::error::DynconfError;
use crate::haproxy::{Backend, Client, DYNAMIC_SERVER_PREFIX};
use crate::route::{Endpoint, RouteSpec, Termination};

#[derive(Default)]
struct ManagerState {
    router: Option<Weak<dyn RouterInterface>>,
    cert_path: String,
    blueprints: Vec<RouteSpec>,
    /// Pool slot id -> route id.
    pool_usage: BTreeMap<String, String>,
    /// Slots whose live content is unknown. Only a reload frees them.
    retired: BTreeSet<String>,
    entries: HashMap<String, RouteBackendEntry>,
    reload_in_progress: bool,
    generation: u64,
    commit_timer: Option<JoinHandle<()>>,
}

impl ManagerState {
    fn reject_during_reload(&self, operation: &'static str, id: &str) -> Result<(), DynconfError> {
        if self.reload_in_progress {
            return Err(DynconfError::ReloadInProgress {
                operation,
                route: id.to_string(),
            });
        }
        Ok(())
    }

    /// Give back any pool slot held by `id`. Only valid once the slot's
    /// associations are gone and its servers are disabled.
    fn release_slot(&mut self, id: &str) {
        self.pool_usage.retain(|_, owner| *owner != id);
        if let Some(entry) = self.entries.get_mut(id) {
            entry.set_pool_slot(None);
        }
    }

    /// Take any pool slot held by `id` out of circulation. Its servers and
    /// map entries may still point at the old route, so it stays unusable
    /// until the next reload.
    fn retire_slot(&mut self, id: &str) {
        let held: Vec<String> = self
            .pool_usage
            .iter()
            .filter(|(_, owner)| *owner == id)
            .map(|(slot, _)| slot.clone())
            .collect();
        for slot in held {
            self.pool_usage.remove(&slot);
            tracing::debug!(route = %id, slot = %slot, "pool slot retired until next reload");
            self.retired.insert(slot);
        }
        if let Some(entry) = self.entries.get_mut(id) {
            entry.set_pool_slot(None);
        }
    }

    fn slot_available(&self, slot: &str) -> bool {
        !self.pool_usage.contains_key(slot) && !self.retired.contains(slot)
    }

    fn cancel_commit(&mut self) {
        if let Some(timer) = self.commit_timer.take() {
            timer.abort();
        }
    }

    /// Forget everything applied dynamically: after a reload HAProxy runs
    /// the freshly rendered configuration where every route has its
    /// permanent backend.
    fn reset(&mut self) {
        self.cancel_commit();
        self.pool_usage.clear();
        self.retired.clear();
        self.generation += 1;
        for entry in self.entries.values_mut() {
            entry.dynamic_servers.clear();
            entry.set_pool_slot(None);
        }
    }

    fn router(&self) -> Option<Arc<dyn RouterInterface>> {
        self.router.as_ref().and_then(Weak::upgrade)
    }
}

struct Inner {
    client: Arc<Client>,
    options: ManagerOptions,
    state: Mutex<ManagerState>,
}

/// Point-in-time view of the manager, reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub blueprints: usize,
    pub pool_slots: usize,
    pub pool_slots_in_use: usize,
    pub pool_slots_retired: usize,
    pub registered_routes: usize,
    pub bound_dynamic_servers: usize,
    pub reload_in_progress: bool,
    pub commit_pending: bool,
    pub cert_path: String,
}

#[derive(Clone)]
pub struct DynamicConfigManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DynamicConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicConfigManager")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

/// Blueprints always live in the pool namespace and never carry a host.
fn normalize_blueprint(route: &RouteSpec, namespace: &str) -> RouteSpec {
    let mut blueprint = route.clone();
    blueprint.namespace = namespace.to_string();
    blueprint.host = String::new();
    blueprint
}

impl DynamicConfigManager {
    #[must_use]
    pub fn new(client: Arc<Client>, options: ManagerOptions) -> Self {
        let namespace = options.blueprint_namespace.clone();
        let mut blueprints = blueprint::default_blueprints(&namespace);
        for custom in &options.blueprint_routes {
            let custom = normalize_blueprint(custom, &namespace);
            match blueprints.iter_mut().find(|b| b.name == custom.name) {
                Some(existing) => *existing = custom,
                None => blueprints.push(custom),
            }
        }

        let state = ManagerState {
            blueprints,
            ..ManagerState::default()
        };
        Self {
            inner: Arc::new(Inner {
                client,
                options,
                state: Mutex::new(state),
            }),
        }
    }

    #[must_use]
    pub fn client(&self) -> &Arc<Client> {
        &self.inner.client
    }

    #[must_use]
    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    pub async fn blueprints(&self) -> Vec<RouteSpec> {
        self.inner.state.lock().await.blueprints.clone()
    }

    /// Route id currently bound to each pool slot.
    pub async fn pool_usage(&self) -> BTreeMap<String, String> {
        self.inner.state.lock().await.pool_usage.clone()
    }

    /// Backend currently serving route `id`, if registered.
    pub async fn route_backend(&self, id: &str) -> Option<String> {
        let state = self.inner.state.lock().await;
        state.entries.get(id).map(RouteBackendEntry::backend_name)
    }

    pub async fn snapshot(&self) -> ManagerSnapshot {
        let default_size = self.inner.options.blueprint_pool_size;
        let state = self.inner.state.lock().await;
        ManagerSnapshot {
            blueprints: state.blueprints.len(),
            pool_slots: state
                .blueprints
                .iter()
                .map(|b| blueprint::pool_size(b, default_size))
                .sum(),
            pool_slots_in_use: state.pool_usage.len(),
            pool_slots_retired: state.retired.len(),
            registered_routes: state.entries.len(),
            bound_dynamic_servers: state.entries.values().map(|e| e.dynamic_servers.len()).sum(),
            reload_in_progress: state.reload_in_progress,
            commit_pending: state.commit_timer.is_some(),
            cert_path: state.cert_path.clone(),
        }
    }
}

impl Inner {
    /// (Re)arm the commit timer.
    fn schedule_commit(this: &Arc<Self>, state: &mut ManagerState) {
        state.cancel_commit();
        let weak = Arc::downgrade(this);
        let interval = this.options.commit_interval;
        state.commit_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(inner) = weak.upgrade() {
                inner.commit_router_config().await;
            }
        }));
        tracing::debug!(interval = ?interval, "router commit scheduled");
    }

    /// Make the router see a change so the next commit renders and reloads
    /// the configuration, persisting what was applied dynamically.
    async fn commit_router_config(&self) {
        let router = {
            let mut state = self.state.lock().await;
            state.commit_timer = None;
            state.router()
        };
        let Some(router) = router else {
            tracing::warn!("router gone, dynamic changes not persisted");
            return;
        };

        let marker = RouteSpec::new(
            &self.options.blueprint_namespace,
            format!("_dynamic-commit-{}", Uuid::new_v4()),
        );
        router.add_route(&marker).await;
        router.remove_route(&marker).await;
        router.commit().await;
        tracing::info!("dynamic changes handed to the router for persisting");
    }

    async fn provision_pool(&self, router: &dyn RouterInterface, blueprint: &RouteSpec) {
        let routes = blueprint::pool_routes(blueprint, self.options.blueprint_pool_size);
        for route in &routes {
            router.add_route(route).await;
        }
        tracing::debug!(blueprint = %blueprint.id(), slots = routes.len(), "blueprint pool provisioned");
    }

    async fn remove_pool(&self, router: &dyn RouterInterface, blueprint: &RouteSpec) {
        for route in blueprint::pool_routes(blueprint, self.options.blueprint_pool_size) {
            router.remove_route(&route).await;
        }
        tracing::debug!(blueprint = %blueprint.id(), "blueprint pool removed");
    }

    /// Add (or with `add == false`, remove) every association in its map.
    async fn sync_associations(
        &self,
        associations: &MapAssociations,
        add: bool,
    ) -> Result<(), DynconfError> {
        for (map_name, entries) in associations {
            let mut map = self.client.find_map(map_name).await?;
            map.sync_entries(&association_pairs(entries), add).await?;
        }
        Ok(())
    }

    /// Record endpoint bindings produced by a reconcile pass, unless a
    /// reload reset the state meanwhile.
    async fn store_bindings(
        this: &Arc<Self>,
        id: &str,
        generation: u64,
        bindings: BTreeMap<String, String>,
        applied: bool,
    ) {
        let mut state = this.state.lock().await;
        if state.generation != generation {
            tracing::debug!(route = %id, "reload happened during endpoint update, bindings dropped");
            return;
        }
        if let Some(entry) = state.entries.get_mut(id) {
            entry.dynamic_servers = bindings;
        }
        if applied {
            Self::schedule_commit(this, &mut state);
        }
    }
}

async fn bind_endpoint(
    backend: &mut Backend,
    server: &str,
    endpoint: &Endpoint,
    weight: u32,
    relative: bool,
) -> Result<(), DynconfError> {
    backend
        .update_server_info(
            server,
            &endpoint.ip,
            endpoint.port,
            endpoint.app_protocol.as_deref(),
            weight,
            relative,
        )
        .await?;
    backend.enable_server(server).await
}

/// Endpoint id a server stands for: dynamic servers through their
/// binding, static servers by name.
fn endpoint_of(server: &str, dynamic: bool, bindings: &BTreeMap<String, String>) -> Option<String> {
    if dynamic {
        bindings.get(server).cloned()
    } else {
        Some(server.to_string())
    }
}

/// Bring `backend`'s servers in line with `new`, given the previous
/// endpoint list `old`. Applied changes are committed even when some new
/// endpoints found no free dynamic server.
async fn reconcile_servers(
    backend: &mut Backend,
    bindings: &mut BTreeMap<String, String>,
    old: &[Endpoint],
    new: &[Endpoint],
    (weight, relative): (u32, bool),
    max_dynamic_servers: usize,
) -> Result<(), DynconfError> {
    let deleted: HashSet<&str> = old
        .iter()
        .filter(|o| !new.iter().any(|n| n.id == o.id))
        .map(|o| o.id.as_str())
        .collect();

    // New or changed, in the order given; unchanged endpoints are skipped.
    let mut pending: Vec<&Endpoint> = Vec::new();
    for endpoint in new {
        if !old.contains(endpoint) && !pending.iter().any(|p| p.id == endpoint.id) {
            pending.push(endpoint);
        }
    }

    let mut free = Vec::new();
    for server in backend.servers().await? {
        let dynamic = server.is_dynamic();
        let Some(endpoint_id) = endpoint_of(&server.name, dynamic, bindings) else {
            free.push(server.name);
            continue;
        };

        if deleted.contains(endpoint_id.as_str()) {
            backend.disable_server(&server.name).await?;
            if dynamic {
                bindings.remove(&server.name);
                free.push(server.name);
            }
            continue;
        }

        if let Some(pos) = pending.iter().position(|e| e.id == endpoint_id) {
            let endpoint = pending.remove(pos);
            bind_endpoint(backend, &server.name, endpoint, weight, relative).await?;
        }
    }

    for server in free {
        if pending.is_empty() || bindings.len() >= max_dynamic_servers {
            break;
        }
        let endpoint = pending.remove(0);
        bindings.insert(server.clone(), endpoint.id.clone());
        bind_endpoint(backend, &server, endpoint, weight, relative).await?;
    }

    backend.commit().await?;

    if pending.is_empty() {
        Ok(())
    } else {
        Err(DynconfError::NoFreeDynamicServer {
            backend: backend.name().to_string(),
            remaining: pending.len(),
        })
    }
}

#[async_trait]
impl ConfigManager for DynamicConfigManager {
    async fn initialize(&self, router: Arc<dyn RouterInterface>, cert_path: &str) {
        let blueprints = {
            let mut state = self.inner.state.lock().await;
            state.router = Some(Arc::downgrade(&router));
            state.cert_path = cert_path.to_string();
            state.blueprints.clone()
        };
        for blueprint in &blueprints {
            self.inner.provision_pool(router.as_ref(), blueprint).await;
        }
        tracing::info!(
            blueprints = blueprints.len(),
            pool_size = self.inner.options.blueprint_pool_size,
            max_dynamic_servers = self.inner.options.max_dynamic_servers,
            cert_path,
            "dynamic configuration manager initialized"
        );
    }

    async fn add_blueprint(&self, route: &RouteSpec) -> Result<(), DynconfError> {
        let namespace = &self.inner.options.blueprint_namespace;
        let blueprint = normalize_blueprint(route, namespace);
        if blueprint::is_pool_route(&blueprint, namespace) {
            return Err(DynconfError::ManagedPoolRoute(blueprint.id()));
        }

        let (router, previous) = {
            let mut state = self.inner.state.lock().await;
            let previous = match state.blueprints.iter().position(|b| b.name == blueprint.name) {
                Some(i) if state.blueprints[i] == blueprint => {
                    tracing::debug!(blueprint = %blueprint.id(), "blueprint unchanged");
                    return Ok(());
                }
                Some(i) => Some(std::mem::replace(&mut state.blueprints[i], blueprint.clone())),
                None => {
                    state.blueprints.push(blueprint.clone());
                    None
                }
            };
            if state.router.is_none() {
                // Provisioned by initialize.
                return Ok(());
            }
            (state.router(), previous)
        };
        let router = router.ok_or(DynconfError::RouterUnavailable)?;

        if let Some(previous) = &previous {
            self.inner.remove_pool(router.as_ref(), previous).await;
        }
        self.inner.provision_pool(router.as_ref(), &blueprint).await;
        router.commit().await;

        tracing::info!(
            blueprint = %blueprint.id(),
            replaced = previous.is_some(),
            "blueprint added"
        );
        Ok(())
    }

    async fn remove_blueprint(&self, route: &RouteSpec) {
        let (router, removed) = {
            let mut state = self.inner.state.lock().await;
            let Some(i) = state.blueprints.iter().position(|b| b.name == route.name) else {
                tracing::debug!(blueprint = %route.name, "blueprint not known, nothing to remove");
                return;
            };
            let removed = state.blueprints.remove(i);
            (state.router(), removed)
        };
        if let Some(router) = router {
            self.inner.remove_pool(router.as_ref(), &removed).await;
            router.commit().await;
        }
        tracing::info!(blueprint = %removed.id(), "blueprint removed");
    }

    async fn register(&self, id: &str, route: &RouteSpec) {
        let entry = RouteBackendEntry::new(id, route, self.inner.options.wildcard_routes_allowed);
        let mut state = self.inner.state.lock().await;
        state.retire_slot(id);
        state.entries.insert(id.to_string(), entry);
    }

    async fn add_route(
        &self,
        id: &str,
        routing_key: &str,
        route: &RouteSpec,
    ) -> Result<(), DynconfError> {
        let options = &self.inner.options;
        if blueprint::is_pool_route(route, &options.blueprint_namespace) {
            return Err(DynconfError::ManagedPoolRoute(id.to_string()));
        }

        let (slot, associations) = {
            let mut state = self.inner.state.lock().await;
            state.reject_during_reload("add", id)?;

            let matched = state
                .blueprints
                .iter()
                .find(|b| blueprint::matches(route, b))
                .cloned()
                .ok_or_else(|| DynconfError::NoMatchingBlueprint {
                    route: id.to_string(),
                })?;

            state.retire_slot(id);
            let size = blueprint::pool_size(&matched, options.blueprint_pool_size);
            let slot_id = (1..=size)
                .map(|ordinal| blueprint::slot_id(&matched, ordinal))
                .find(|slot| state.slot_available(slot))
                .ok_or_else(|| DynconfError::NoFreePoolSlot {
                    blueprint: matched.id(),
                })?;

            let slot = PoolSlot {
                backend: backend_name(route.termination(), &slot_id),
                id: slot_id,
            };
            state.pool_usage.insert(slot.id.clone(), id.to_string());

            let mut entry = RouteBackendEntry::new(id, route, options.wildcard_routes_allowed);
            entry.set_pool_slot(Some(slot.clone()));
            let associations = entry.map_associations.clone();
            state.entries.insert(id.to_string(), entry);
            (slot, associations)
        };

        let applied = async {
            self.inner.sync_associations(&associations, true).await?;
            let backend = self.inner.client.find_backend(&slot.backend).await?;
            backend.set_routing_key(routing_key).await
        }
        .await;

        let mut state = self.inner.state.lock().await;
        match applied {
            Ok(()) => {
                Inner::schedule_commit(&self.inner, &mut state);
                tracing::info!(route = %id, backend = %slot.backend, "route added dynamically");
                Ok(())
            }
            Err(e) => {
                // Part of the binding may already be live.
                if state.pool_usage.get(&slot.id).is_some_and(|owner| owner == id) {
                    state.retire_slot(id);
                }
                Err(e)
            }
        }
    }

    async fn remove_route(&self, id: &str, route: &RouteSpec) -> Result<(), DynconfError> {
        let (associations, backend_name) = {
            let state = self.inner.state.lock().await;
            state.reject_during_reload("remove", id)?;
            let entry = state
                .entries
                .get(id)
                .ok_or_else(|| DynconfError::RouteNotRegistered(id.to_string()))?;
            (entry.map_associations.clone(), entry.backend_name())
        };

        self.inner.sync_associations(&associations, false).await?;

        let mut backend = self.inner.client.find_backend(&backend_name).await?;
        backend.disable().await?;
        backend.commit().await?;

        let mut state = self.inner.state.lock().await;
        state.release_slot(id);
        state.entries.remove(id);
        Inner::schedule_commit(&self.inner, &mut state);
        tracing::info!(route = %id, host = %route.host, backend = %backend_name, "route removed dynamically");
        Ok(())
    }

    async fn unregister(&self, id: &str) {
        let mut state = self.inner.state.lock().await;
        state.retire_slot(id);
        if state.entries.remove(id).is_some() {
            tracing::debug!(route = %id, "route unregistered");
        }
    }

    async fn replace_route_endpoints(
        &self,
        id: &str,
        old_endpoints: &[Endpoint],
        new_endpoints: &[Endpoint],
        weight: u32,
    ) -> Result<(), DynconfError> {
        let (backend_name, passthrough, mut bindings, generation) = {
            let state = self.inner.state.lock().await;
            state.reject_during_reload("replace endpoints of", id)?;
            let entry = state
                .entries
                .get(id)
                .ok_or_else(|| DynconfError::RouteNotRegistered(id.to_string()))?;
            (
                entry.backend_name(),
                entry.route.termination() == Some(Termination::Passthrough),
                entry.dynamic_servers.clone(),
                state.generation,
            )
        };

        // Passthrough servers keep their rendered weight.
        let weight = if passthrough { (100, true) } else { (weight, false) };

        let mut backend = self.inner.client.find_backend(&backend_name).await?;
        let outcome = reconcile_servers(
            &mut backend,
            &mut bindings,
            old_endpoints,
            new_endpoints,
            weight,
            self.inner.options.max_dynamic_servers,
        )
        .await;

        let applied = matches!(outcome, Ok(()) | Err(DynconfError::NoFreeDynamicServer { .. }));
        Inner::store_bindings(&self.inner, id, generation, bindings, applied).await;

        match &outcome {
            Ok(()) => tracing::info!(
                route = %id,
                backend = %backend_name,
                endpoints = new_endpoints.len(),
                "route endpoints replaced dynamically"
            ),
            Err(e) => tracing::warn!(route = %id, backend = %backend_name, error = %e, "dynamic endpoint update incomplete"),
        }
        outcome
    }

    async fn remove_route_endpoints(
        &self,
        id: &str,
        endpoints: &[Endpoint],
    ) -> Result<(), DynconfError> {
        let (backend_name, mut bindings, generation) = {
            let state = self.inner.state.lock().await;
            state.reject_during_reload("remove endpoints of", id)?;
            let entry = state
                .entries
                .get(id)
                .ok_or_else(|| DynconfError::RouteNotRegistered(id.to_string()))?;
            (entry.backend_name(), entry.dynamic_servers.clone(), state.generation)
        };

        let removed: HashSet<&str> = endpoints.iter().map(|e| e.id.as_str()).collect();
        let mut backend = self.inner.client.find_backend(&backend_name).await?;
        for server in backend.servers().await? {
            let dynamic = server.is_dynamic();
            let Some(endpoint_id) = endpoint_of(&server.name, dynamic, &bindings) else {
                continue;
            };
            if removed.contains(endpoint_id.as_str()) {
                backend.disable_server(&server.name).await?;
                if dynamic {
                    bindings.remove(&server.name);
                }
            }
        }
        backend.commit().await?;

        Inner::store_bindings(&self.inner, id, generation, bindings, true).await;
        tracing::info!(route = %id, backend = %backend_name, endpoints = endpoints.len(), "route endpoints removed dynamically");
        Ok(())
    }

    async fn notify(&self, event: RouterEvent) {
        match event {
            RouterEvent::ReloadStart => {
                self.inner.state.lock().await.reload_in_progress = true;
                tracing::debug!("reload started, dynamic changes paused");
            }
            RouterEvent::ReloadError => {
                self.inner.state.lock().await.reload_in_progress = false;
                tracing::warn!("reload failed, dynamic changes resumed against the old configuration");
            }
            RouterEvent::ReloadEnd => {
                {
                    let mut state = self.inner.state.lock().await;
                    state.reload_in_progress = false;
                    state.reset();
                }
                self.inner.client.reset().await;
                tracing::info!("reload finished, dynamic state reset");
            }
        }
    }

    fn server_template_name(&self, _id: &str) -> String {
        DYNAMIC_SERVER_PREFIX.to_string()
    }

    fn server_template_size(&self, _id: &str) -> usize {
        self.inner.options.max_dynamic_servers
    }

    fn generate_dynamic_server_names(&self, _id: &str) -> Vec<String> {
        (1..=self.inner.options.max_dynamic_servers)
            .map(|n| format!("{DYNAMIC_SERVER_PREFIX}{n}"))
            .collect()
    }
}
