//! Serde data structures for the desired-state file.
//!
//! [`DesiredState`] is the root: custom blueprint routes, the routes to
//! serve, and the endpoints of every service keyed by
//! `<namespace>/<service>`. Route and endpoint types live in
//! [`crate::route`]; like them, everything here is parsed with
//! `deny_unknown_fields`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::route::{Endpoint, RouteSpec};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DesiredState {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blueprints: Vec<RouteSpec>,

    #[serde(default)]
    pub routes: Vec<RouteSpec>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub endpoints: BTreeMap<String, Vec<Endpoint>>,
}

/// Key of a service's endpoint list.
#[must_use]
pub fn service_key(namespace: &str, service: &str) -> String {
    format!("{namespace}/{service}")
}

impl DesiredState {
    #[must_use]
    pub fn total_endpoints(&self) -> usize {
        self.endpoints.values().map(Vec::len).sum()
    }

    /// Endpoints serving `route`, empty when its service has none.
    #[must_use]
    pub fn endpoints_for(&self, route: &RouteSpec) -> &[Endpoint] {
        self.endpoints
            .get(&service_key(&route.namespace, &route.service))
            .map_or(&[], Vec::as_slice)
    }
}
