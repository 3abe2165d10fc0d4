//! Route and endpoint data structures shared by the router and the
//! dynamic configuration manager.
//!
//! A [`RouteSpec`] is the externally visible routing rule (host, path,
//! TLS policy, target service); an [`Endpoint`] is one address serving
//! that service. Both derive `Serialize`/`Deserialize` with
//! `deny_unknown_fields` so they can be read straight from the
//! desired-state file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const fn default_weight() -> u32 {
    100
}

fn is_default_weight(v: &u32) -> bool {
    *v == default_weight()
}

/// How TLS is terminated for a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Termination {
    Edge,
    Reencrypt,
    Passthrough,
}

impl Termination {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Edge => "edge",
            Self::Reencrypt => "reencrypt",
            Self::Passthrough => "passthrough",
        }
    }
}

/// What to do with plain-HTTP traffic for a TLS route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum InsecurePolicy {
    #[default]
    None,
    Allow,
    Redirect,
}

impl InsecurePolicy {
    fn is_none(&self) -> bool {
        *self == Self::None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum WildcardPolicy {
    #[default]
    None,
    Subdomain,
}

impl WildcardPolicy {
    fn is_none(&self) -> bool {
        *self == Self::None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub termination: Termination,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_ca_certificate: Option<String>,

    #[serde(default, skip_serializing_if = "InsecurePolicy::is_none")]
    pub insecure_edge_termination_policy: InsecurePolicy,
}

impl TlsConfig {
    #[must_use]
    pub const fn new(termination: Termination) -> Self {
        Self {
            termination,
            certificate: None,
            key: None,
            ca_certificate: None,
            destination_ca_certificate: None,
            insecure_edge_termination_policy: InsecurePolicy::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RouteSpec {
    pub namespace: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    #[serde(default, skip_serializing_if = "WildcardPolicy::is_none")]
    pub wildcard_policy: WildcardPolicy,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,

    #[serde(default = "default_weight", skip_serializing_if = "is_default_weight")]
    pub weight: u32,
}

impl RouteSpec {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            host: String::new(),
            path: String::new(),
            tls: None,
            wildcard_policy: WildcardPolicy::None,
            annotations: BTreeMap::new(),
            service: String::new(),
            weight: default_weight(),
        }
    }

    /// Stable route identity, `<namespace>:<name>`.
    #[must_use]
    pub fn id(&self) -> String {
        route_id(&self.namespace, &self.name)
    }

    /// `None` means plain HTTP.
    #[must_use]
    pub fn termination(&self) -> Option<Termination> {
        self.tls.as_ref().map(|tls| tls.termination)
    }

    #[must_use]
    pub fn insecure_policy(&self) -> InsecurePolicy {
        self.tls
            .as_ref()
            .map_or(InsecurePolicy::None, |tls| tls.insecure_edge_termination_policy)
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.wildcard_policy == WildcardPolicy::Subdomain
    }
}

#[must_use]
pub fn route_id(namespace: &str, name: &str) -> String {
    format!("{namespace}:{name}")
}

/// One address serving a route's target service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    pub id: String,

    pub ip: String,

    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,
}
