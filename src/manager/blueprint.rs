//! Blueprint routes and their backend pools.
//!
//! A blueprint is a placeholder route whose backend shape (termination,
//! TLS settings, backend-modifying annotations) can host a real route.
//! Each blueprint is rendered `pool size` times into the configuration
//! as `_dynamic-<blueprint>-<n>` routes, so a matching route can be bound
//! to a free copy at runtime instead of reloading.

use std::collections::BTreeMap;

use crate::route::{route_id, RouteSpec, TlsConfig, Termination};

pub const DEFAULT_BLUEPRINT_NAMESPACE: &str = "openshift";

/// Per-blueprint override of the global pool size.
pub const POOL_SIZE_ANNOTATION: &str = "router.openshift.io/pool-size";

const POOL_ROUTE_PREFIX: &str = "_dynamic-";

/// Annotations that change the rendered backend of http, edge and
/// reencrypt routes.
pub const BACKEND_MOD_ANNOTATIONS: &[&str] = &[
    "haproxy.router.openshift.io/balance",
    "haproxy.router.openshift.io/ip_whitelist",
    "haproxy.router.openshift.io/timeout",
    "haproxy.router.openshift.io/timeout-tunnel",
    "haproxy.router.openshift.io/rate-limit-connections",
    "haproxy.router.openshift.io/rate-limit-connections.concurrent-tcp",
    "haproxy.router.openshift.io/rate-limit-connections.rate-tcp",
    "haproxy.router.openshift.io/rate-limit-connections.rate-http",
    "haproxy.router.openshift.io/pod-concurrent-connections",
    "router.openshift.io/haproxy.health.check.interval",
    "haproxy.router.openshift.io/disable_cookies",
    "router.openshift.io/cookie_name",
    "router.openshift.io/cookie-same-site",
    "haproxy.router.openshift.io/hsts_header",
    "haproxy.router.openshift.io/set-forwarded-headers",
    "haproxy.router.openshift.io/rewrite-target",
];

/// Passthrough backends are plain TCP, so only connection-level
/// annotations apply.
pub const PASSTHROUGH_MOD_ANNOTATIONS: &[&str] = &[
    "haproxy.router.openshift.io/balance",
    "haproxy.router.openshift.io/ip_whitelist",
    "haproxy.router.openshift.io/timeout",
    "haproxy.router.openshift.io/timeout-tunnel",
    "haproxy.router.openshift.io/rate-limit-connections",
    "haproxy.router.openshift.io/rate-limit-connections.concurrent-tcp",
    "haproxy.router.openshift.io/rate-limit-connections.rate-tcp",
    "haproxy.router.openshift.io/pod-concurrent-connections",
    "router.openshift.io/haproxy.health.check.interval",
];

/// One blueprint per termination family: plain http, edge, reencrypt
/// and passthrough.
#[must_use]
pub fn default_blueprints(namespace: &str) -> Vec<RouteSpec> {
    [
        ("http", None),
        ("edge", Some(Termination::Edge)),
        ("reencrypt", Some(Termination::Reencrypt)),
        ("passthrough", Some(Termination::Passthrough)),
    ]
    .into_iter()
    .map(|(kind, termination)| {
        let mut route = RouteSpec::new(namespace, format!("blueprint-{kind}"));
        route.tls = termination.map(TlsConfig::new);
        route
    })
    .collect()
}

/// Allow-listed annotations of `route` for its termination family.
#[must_use]
pub fn backend_mod_annotations(route: &RouteSpec) -> BTreeMap<&str, &str> {
    let allowed = if route.termination() == Some(Termination::Passthrough) {
        PASSTHROUGH_MOD_ANNOTATIONS
    } else {
        BACKEND_MOD_ANNOTATIONS
    };
    route
        .annotations
        .iter()
        .filter(|(k, _)| allowed.contains(&k.as_str()))
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

/// Whether `route` can be served by a pool slot of `blueprint`.
///
/// Terminations and backend-modifying annotations must be equal, and so
/// must the TLS settings except the insecure policy, which is expressed
/// per route through the redirect and http maps.
#[must_use]
pub fn matches(route: &RouteSpec, blueprint: &RouteSpec) -> bool {
    if route.termination() != blueprint.termination() {
        return false;
    }
    if backend_mod_annotations(route) != backend_mod_annotations(blueprint) {
        return false;
    }
    match (&route.tls, &blueprint.tls) {
        (None, None) => true,
        (Some(route_tls), Some(blueprint_tls)) => {
            let mut tls = route_tls.clone();
            tls.insecure_edge_termination_policy = blueprint_tls.insecure_edge_termination_policy;
            tls == *blueprint_tls
        }
        _ => false,
    }
}

/// Pool size from the blueprint's annotation, else `default`.
#[must_use]
pub fn pool_size(blueprint: &RouteSpec, default: usize) -> usize {
    match blueprint.annotations.get(POOL_SIZE_ANNOTATION) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(
                blueprint = %blueprint.id(),
                value = %raw,
                default,
                "invalid pool size annotation, using default"
            );
            default
        }),
    }
}

#[must_use]
pub fn pool_route_name(blueprint: &RouteSpec, ordinal: usize) -> String {
    format!("{POOL_ROUTE_PREFIX}{}-{ordinal}", blueprint.name)
}

/// Route id of the `ordinal`-th pool slot (1-based).
#[must_use]
pub fn slot_id(blueprint: &RouteSpec, ordinal: usize) -> String {
    route_id(&blueprint.namespace, &pool_route_name(blueprint, ordinal))
}

/// Whether `route` is one of the pre-provisioned pool routes.
#[must_use]
pub fn is_pool_route(route: &RouteSpec, namespace: &str) -> bool {
    route.namespace == namespace && route.name.starts_with(POOL_ROUTE_PREFIX)
}

/// The placeholder routes rendered for `blueprint`.
#[must_use]
pub fn pool_routes(blueprint: &RouteSpec, default_size: usize) -> Vec<RouteSpec> {
    (1..=pool_size(blueprint, default_size))
        .map(|ordinal| {
            let mut route = blueprint.clone();
            route.name = pool_route_name(blueprint, ordinal);
            route.host = String::new();
            route
        })
        .collect()
}
