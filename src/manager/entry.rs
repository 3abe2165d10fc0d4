//! Per-route bookkeeping: which backend serves the route, which map
//! entries route traffic to it and which dynamic servers are bound.

use std::collections::BTreeMap;

use crate::route::{InsecurePolicy, RouteSpec, Termination};

pub const HTTP_BACKEND_MAP: &str = "os_http_be.map";
pub const EDGE_REENCRYPT_BACKEND_MAP: &str = "os_edge_reencrypt_be.map";
pub const HTTP_REDIRECT_MAP: &str = "os_route_http_redirect.map";
pub const SNI_PASSTHROUGH_MAP: &str = "os_sni_passthrough.map";
pub const TCP_BACKEND_MAP: &str = "os_tcp_be.map";
pub const WILDCARD_DOMAIN_MAP: &str = "os_wildcard_domain.map";

/// Map file name -> pattern -> value.
pub type MapAssociations = BTreeMap<String, BTreeMap<String, String>>;

/// Backend name HAProxy knows route `id` by, derived from its termination.
#[must_use]
pub fn backend_name(termination: Option<Termination>, id: &str) -> String {
    let prefix = match termination {
        None => "be_http",
        Some(Termination::Edge) => "be_edge_http",
        Some(Termination::Reencrypt) => "be_secure",
        Some(Termination::Passthrough) => "be_tcp",
    };
    format!("{prefix}:{id}")
}

/// Escape every regular expression metacharacter in `text`.
fn quote_meta(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len());
    for c in text.chars() {
        if r"\.+*?()|[]{}^$".contains(c) {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted
}

/// Anchored pattern matching `host` (with an optional port) and anything
/// below `path`. A wildcard host matches any single label in place of the
/// first one.
#[must_use]
pub fn route_regexp(host: &str, path: &str, wildcard: bool) -> String {
    let mut host_re = quote_meta(host);
    if wildcard {
        match host.split_once('.') {
            Some((_, domain)) if !domain.is_empty() => {
                host_re = format!(r"[^\.]*\.{}", quote_meta(domain));
            }
            _ => tracing::warn!(host, "wildcard host has no domain part, matching it exactly"),
        }
    }

    let (path_re, subpath_re) = if path.is_empty() || path == "/" {
        (String::new(), "(/.*)?")
    } else if path.ends_with('/') {
        (quote_meta(path), "(.*)?")
    } else {
        (quote_meta(path), "(/.*)?")
    };

    format!("^{host_re}(:[0-9]+)?{path_re}{subpath_re}$")
}

/// Pool slot a route is currently bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSlot {
    /// Route id of the pool route.
    pub id: String,
    pub backend: String,
}

#[derive(Debug, Clone)]
pub struct RouteBackendEntry {
    pub id: String,
    pub route: RouteSpec,
    /// Wildcard routing in effect: requested by the route and allowed.
    pub wildcard: bool,
    pub pool_slot: Option<PoolSlot>,
    pub map_associations: MapAssociations,
    /// Dynamic server name -> endpoint id.
    pub dynamic_servers: BTreeMap<String, String>,
}

impl RouteBackendEntry {
    #[must_use]
    pub fn new(id: &str, route: &RouteSpec, wildcard_routes_allowed: bool) -> Self {
        let mut entry = Self {
            id: id.to_string(),
            route: route.clone(),
            wildcard: wildcard_routes_allowed && route.is_wildcard(),
            pool_slot: None,
            map_associations: MapAssociations::new(),
            dynamic_servers: BTreeMap::new(),
        };
        entry.map_associations = entry.build_map_associations();
        entry
    }

    #[must_use]
    pub fn permanent_backend(&self) -> String {
        backend_name(self.route.termination(), &self.id)
    }

    /// The pool slot's backend while one is bound, else the permanent one.
    #[must_use]
    pub fn backend_name(&self) -> String {
        self.pool_slot
            .as_ref()
            .map_or_else(|| self.permanent_backend(), |slot| slot.backend.clone())
    }

    /// Bind to (or with `None`, release) a pool slot and recompute the map
    /// associations for the resulting backend.
    pub fn set_pool_slot(&mut self, slot: Option<PoolSlot>) {
        self.pool_slot = slot;
        self.map_associations = self.build_map_associations();
    }

    /// Map entries that route this route's traffic to [`backend_name`](Self::backend_name).
    #[must_use]
    pub fn build_map_associations(&self) -> MapAssociations {
        let mut associations = MapAssociations::new();
        let route = &self.route;
        if route.host.is_empty() {
            return associations;
        }

        let mut associate = |map: &str, pattern: &str, value: &str| {
            associations
                .entry(map.to_string())
                .or_default()
                .insert(pattern.to_string(), value.to_string());
        };

        let backend = self.backend_name();
        let termination = route.termination();
        let policy = route.insecure_policy();

        let path_re = route_regexp(&route.host, &route.path, self.wildcard);
        if policy == InsecurePolicy::Redirect {
            associate(HTTP_REDIRECT_MAP, &path_re, &backend);
        }
        match termination {
            None => associate(HTTP_BACKEND_MAP, &path_re, &backend),
            Some(Termination::Edge | Termination::Reencrypt) => {
                associate(EDGE_REENCRYPT_BACKEND_MAP, &path_re, &backend);
                if policy == InsecurePolicy::Allow {
                    associate(HTTP_BACKEND_MAP, &path_re, &backend);
                }
            }
            Some(Termination::Passthrough) => {}
        }

        let host_re = route_regexp(&route.host, "", self.wildcard);
        if self.wildcard {
            associate(WILDCARD_DOMAIN_MAP, &host_re, "1");
        }
        match termination {
            Some(Termination::Reencrypt) => associate(TCP_BACKEND_MAP, &host_re, &backend),
            Some(Termination::Passthrough) => {
                associate(TCP_BACKEND_MAP, &host_re, &backend);
                associate(SNI_PASSTHROUGH_MAP, &host_re, "1");
            }
            _ => {}
        }

        associations
    }
}

/// Flatten one map's associations into the `(key, value)` list
/// [`MapStore::sync_entries`](crate::haproxy::MapStore::sync_entries) takes.
#[must_use]
pub fn association_pairs(entries: &BTreeMap<String, String>) -> Vec<(String, String)> {
    entries
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
