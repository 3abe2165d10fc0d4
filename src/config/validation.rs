//! Desired-state validation with detailed error reporting.
//!
//! The [`validate`] function checks a parsed [`DesiredState`] for
//! problems the load balancer would reject or silently misroute: bad
//! names and hosts, duplicate routes, inconsistent TLS settings,
//! reserved pool names and malformed endpoints. Returns a list of
//! [`ValidationError`] values with per-field suggestions.

use std::collections::HashSet;
use std::net::IpAddr;

use super::model::DesiredState;
use crate::error::ValidationError;
use crate::manager::blueprint::POOL_SIZE_ANNOTATION;
use crate::route::{InsecurePolicy, RouteSpec, Termination};

const MAX_WEIGHT: u32 = 256;
const RESERVED_PREFIX: &str = "_dynamic-";

/// Validate a namespace or route name. Returns `Ok(())` or a human-readable error.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("cannot be empty".into());
    }
    if let Some(c) = name.chars().find(|c| c.is_whitespace() || matches!(c, ':' | '/')) {
        return Err(format!("'{name}' contains forbidden character '{c}'"));
    }
    Ok(())
}

/// Validate a DNS host name. Returns `Ok(())` or a human-readable error.
pub fn validate_host(host: &str) -> Result<(), String> {
    if host.is_empty() {
        return Err("host cannot be empty".into());
    }
    if host.len() > 253 {
        return Err(format!("host is {} characters long, at most 253 allowed", host.len()));
    }
    for label in host.split('.') {
        if label.is_empty() {
            return Err(format!("'{host}' has an empty label"));
        }
        if label.len() > 63 {
            return Err(format!("label '{label}' is longer than 63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("label '{label}' cannot start or end with '-'"));
        }
        if let Some(c) = label
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(format!("'{host}' contains invalid character '{c}'"));
        }
    }
    Ok(())
}

/// Validate a route path. Returns `Ok(())` or a human-readable error.
pub fn validate_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Ok(());
    }
    if !path.starts_with('/') {
        return Err(format!("path must start with '/' (did you mean '/{path}'?)"));
    }
    if path.chars().any(char::is_whitespace) {
        return Err("path cannot contain whitespace".into());
    }
    Ok(())
}

struct Collector {
    errors: Vec<ValidationError>,
}

impl Collector {
    fn push(&mut self, route: &str, field: &str, message: String, suggestion: Option<String>) {
        self.errors.push(ValidationError {
            route: route.to_string(),
            field: field.to_string(),
            message,
            suggestion,
        });
    }
}

fn route_label(route: &RouteSpec, kind: &str, index: usize) -> String {
    if route.namespace.is_empty() || route.name.is_empty() {
        format!("{kind}[{index}]")
    } else {
        route.id()
    }
}

fn check_names(out: &mut Collector, label: &str, route: &RouteSpec) {
    if let Err(msg) = validate_name(&route.namespace) {
        out.push(label, "namespace", msg, None);
    }
    if let Err(msg) = validate_name(&route.name) {
        out.push(label, "name", msg, None);
    }
    if route.name.starts_with(RESERVED_PREFIX) {
        out.push(
            label,
            "name",
            format!("names starting with '{RESERVED_PREFIX}' are reserved for blueprint pools"),
            Some(format!("rename to '{}'", route.name.trim_start_matches(RESERVED_PREFIX))),
        );
    }
}

fn check_tls(out: &mut Collector, label: &str, route: &RouteSpec) {
    let Some(tls) = &route.tls else {
        return;
    };
    if tls.certificate.is_some() != tls.key.is_some() {
        out.push(
            label,
            "tls",
            "certificate and key must be set together".into(),
            None,
        );
    }
    if tls.destination_ca_certificate.is_some() && tls.termination != Termination::Reencrypt {
        out.push(
            label,
            "tls.destination_ca_certificate",
            format!("only valid for reencrypt routes, not {}", tls.termination.as_str()),
            None,
        );
    }
    if tls.termination == Termination::Passthrough {
        if tls.certificate.is_some() || tls.ca_certificate.is_some() {
            out.push(
                label,
                "tls",
                "passthrough routes cannot carry certificates".into(),
                Some("the backend presents its own certificate".into()),
            );
        }
        if tls.insecure_edge_termination_policy == InsecurePolicy::Allow {
            out.push(
                label,
                "tls.insecure_edge_termination_policy",
                "Allow is not supported for passthrough routes".into(),
                Some("use None or Redirect".into()),
            );
        }
        if !route.path.is_empty() && route.path != "/" {
            out.push(
                label,
                "path",
                "passthrough routes cannot be path based".into(),
                None,
            );
        }
    }
}

pub fn validate(state: &DesiredState) -> Result<(), Vec<ValidationError>> {
    let mut out = Collector { errors: Vec::new() };

    let mut blueprint_names = HashSet::new();
    for (i, blueprint) in state.blueprints.iter().enumerate() {
        let label = format!("blueprints[{i}]");
        if let Err(msg) = validate_name(&blueprint.name) {
            out.push(&label, "name", msg, None);
        }
        if !blueprint_names.insert(blueprint.name.as_str()) {
            out.push(&label, "name", format!("duplicate blueprint '{}'", blueprint.name), None);
        }
        if let Some(raw) = blueprint.annotations.get(POOL_SIZE_ANNOTATION) {
            if !raw.trim().parse::<usize>().is_ok_and(|n| n > 0) {
                out.push(
                    &label,
                    &format!("annotations.{POOL_SIZE_ANNOTATION}"),
                    format!("'{raw}' is not a positive integer"),
                    None,
                );
            }
        }
        check_tls(&mut out, &label, blueprint);
    }

    let mut seen_ids = HashSet::new();
    let mut seen_hosts = HashSet::new();
    for (i, route) in state.routes.iter().enumerate() {
        let label = route_label(route, "routes", i);
        check_names(&mut out, &label, route);

        if !seen_ids.insert(route.id()) {
            out.push(&label, "name", "duplicate route".into(), None);
        }

        match validate_host(&route.host) {
            Err(msg) => {
                let lower = route.host.to_lowercase();
                let suggestion = (lower != route.host && validate_host(&lower).is_ok())
                    .then(|| format!("did you mean '{lower}'?"));
                out.push(&label, "host", msg, suggestion);
            }
            Ok(()) => {
                if route.is_wildcard() && !route.host.contains('.') {
                    out.push(
                        &label,
                        "wildcard_policy",
                        format!("wildcard host '{}' has no domain to match under", route.host),
                        None,
                    );
                }
                if !seen_hosts.insert((route.host.as_str(), route.path.as_str())) {
                    out.push(
                        &label,
                        "host",
                        format!("host '{}' and path '{}' already claimed", route.host, route.path),
                        None,
                    );
                }
            }
        }

        if let Err(msg) = validate_path(&route.path) {
            let suggestion = (!route.path.starts_with('/')).then(|| format!("did you mean '/{}'?", route.path));
            out.push(&label, "path", msg, suggestion);
        }

        if route.weight > MAX_WEIGHT {
            out.push(
                &label,
                "weight",
                format!("{} is out of range 0..={MAX_WEIGHT}", route.weight),
                None,
            );
        }

        check_tls(&mut out, &label, route);
    }

    for (key, endpoints) in &state.endpoints {
        let label = format!("endpoints[{key}]");
        match key.split_once('/') {
            Some((ns, service)) if validate_name(ns).is_ok() && validate_name(service).is_ok() => {}
            _ => out.push(
                &label,
                "key",
                "expected '<namespace>/<service>'".into(),
                None,
            ),
        }

        let mut seen = HashSet::new();
        for endpoint in endpoints {
            if endpoint.id.is_empty() {
                out.push(&label, "id", "endpoint id cannot be empty".into(), None);
            } else if !seen.insert(endpoint.id.as_str()) {
                out.push(&label, "id", format!("duplicate endpoint '{}'", endpoint.id), None);
            }
            if endpoint.ip.parse::<IpAddr>().is_err() {
                out.push(
                    &label,
                    "ip",
                    format!("'{}' is not an IP address", endpoint.ip),
                    None,
                );
            }
            if endpoint.port == 0 {
                out.push(&label, "port", format!("endpoint '{}' has port 0", endpoint.id), None);
            }
        }
    }

    if out.errors.is_empty() {
        Ok(())
    } else {
        Err(out.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Endpoint, TlsConfig, WildcardPolicy};

    fn route(name: &str, host: &str) -> RouteSpec {
        let mut route = RouteSpec::new("shop", name);
        route.host = host.into();
        route.service = "web".into();
        route
    }

    fn state(routes: Vec<RouteSpec>) -> DesiredState {
        DesiredState {
            routes,
            ..DesiredState::default()
        }
    }

    fn endpoint(id: &str, ip: &str, port: u16) -> Endpoint {
        Endpoint {
            id: id.into(),
            ip: ip.into(),
            port,
            app_protocol: None,
        }
    }

    #[test]
    fn valid_state_passes() {
        let mut s = state(vec![route("web", "shop.example.com")]);
        s.endpoints
            .insert("shop/web".into(), vec![endpoint("pod-1", "10.0.0.1", 8080)]);
        assert!(validate(&s).is_ok());
    }

    #[test]
    fn empty_state_passes() {
        assert!(validate(&DesiredState::default()).is_ok());
    }

    #[test]
    fn uppercase_host_suggests_lowercase() {
        let errors = validate(&state(vec![route("web", "Shop.Example.com")])).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.suggestion.as_deref() == Some("did you mean 'shop.example.com'?")));
    }

    #[test]
    fn duplicate_routes_and_hosts_fail() {
        let errors = validate(&state(vec![
            route("web", "a.example.com"),
            route("web", "b.example.com"),
            route("api", "a.example.com"),
        ]))
        .unwrap_err();
        assert!(errors.iter().any(|e| e.message == "duplicate route"));
        assert!(errors.iter().any(|e| e.message.contains("already claimed")));
    }

    #[test]
    fn reserved_names_fail() {
        let errors = validate(&state(vec![route("_dynamic-web", "a.example.com")])).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("reserved")));
    }

    #[test]
    fn path_without_slash_fails() {
        let mut r = route("web", "a.example.com");
        r.path = "api".into();
        let errors = validate(&state(vec![r])).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.suggestion.as_deref() == Some("did you mean '/api'?")));
    }

    #[test]
    fn passthrough_restrictions() {
        let mut r = route("web", "a.example.com");
        r.path = "/api".into();
        let mut tls = TlsConfig::new(Termination::Passthrough);
        tls.insecure_edge_termination_policy = InsecurePolicy::Allow;
        r.tls = Some(tls);
        let errors = validate(&state(vec![r])).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "path"));
        assert!(errors
            .iter()
            .any(|e| e.field == "tls.insecure_edge_termination_policy"));
    }

    #[test]
    fn certificate_without_key_fails() {
        let mut r = route("web", "a.example.com");
        let mut tls = TlsConfig::new(Termination::Edge);
        tls.certificate = Some("cert".into());
        r.tls = Some(tls);
        let errors = validate(&state(vec![r])).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("set together")));
    }

    #[test]
    fn wildcard_needs_a_domain() {
        let mut r = route("web", "localhost");
        r.wildcard_policy = WildcardPolicy::Subdomain;
        let errors = validate(&state(vec![r])).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "wildcard_policy"));
    }

    #[test]
    fn malformed_endpoints_fail() {
        let mut s = DesiredState::default();
        s.endpoints.insert(
            "web".into(),
            vec![endpoint("a", "10.0.0.1", 80), endpoint("a", "not-an-ip", 0)],
        );
        let errors = validate(&s).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"key"));
        assert!(fields.contains(&"id"));
        assert!(fields.contains(&"ip"));
        assert!(fields.contains(&"port"));
    }

    #[test]
    fn bad_pool_size_fails() {
        let mut blueprint = RouteSpec::new("openshift", "sticky");
        blueprint
            .annotations
            .insert(POOL_SIZE_ANNOTATION.into(), "0".into());
        let s = DesiredState {
            blueprints: vec![blueprint],
            ..DesiredState::default()
        };
        assert!(validate(&s).is_err());
    }
}
