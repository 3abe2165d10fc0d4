//! Unified error types for the reconfiguration engine.
//!
//! Defines [`DynconfError`] (the main crate error enum) and
//! [`ValidationError`] for desired-state validation failures. Every
//! dynamic-path failure maps to one variant so callers can log it and
//! fall back to a full reload.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub route: String,
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "  route {}: {}: {}", self.route, self.field, self.message)?;
        if let Some(ref suggestion) = self.suggestion {
            write!(f, " ({suggestion})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

fn format_errors(errors: &[ValidationError]) -> String {
    use std::fmt::Write;
    let mut buf = String::new();
    for (i, e) in errors.iter().enumerate() {
        if i > 0 {
            buf.push('\n');
        }
        // write! to String is infallible (only fails on OOM which is unrecoverable)
        let _ = write!(buf, "{e}");
    }
    buf
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DynconfError {
    // -- Desired-state configuration --
    #[error("No config source found.\n\n  {hint}")]
    NoConfigSource { hint: String },

    #[error("Config file not found: {}", path.display())]
    ConfigFileNotFound { path: PathBuf },

    #[error("Config parse error in {path}:\n  {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Config validation failed:\n{}", format_errors(.errors))]
    ConfigValidation { errors: Vec<ValidationError> },

    #[error("Unsupported config format: '{0}'")]
    UnsupportedFormat(String),

    #[error("Invalid address: {0}")]
    AddressParse(#[from] std::net::AddrParseError),

    // -- Control socket transport and protocol --
    #[error("invalid control socket address: {0}")]
    InvalidSocketAddress(String),

    #[error("control socket command '{command}' failed: {source}")]
    Socket {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("control socket command '{command}' returned: {response}")]
    CommandFailed { command: String, response: String },

    #[error("unexpected response to '{command}': {detail}")]
    UnexpectedResponse { command: String, detail: String },

    #[error("map '{0}' not found")]
    MapNotFound(String),

    #[error("backend '{0}' not found")]
    BackendNotFound(String),

    #[error("server '{server}' not found in backend '{backend}'")]
    ServerNotFound { backend: String, server: String },

    // -- Capacity --
    #[error("no blueprint found that would match route {route}")]
    NoMatchingBlueprint { route: String },

    #[error("no free pool slot available for blueprint {blueprint}")]
    NoFreePoolSlot { blueprint: String },

    #[error("no free dynamic server slots for backend {backend}, {remaining} endpoint(s) remaining")]
    NoFreeDynamicServer { backend: String, remaining: usize },

    // -- State --
    #[error("router reload in progress, cannot dynamically {operation} route {route}")]
    ReloadInProgress {
        operation: &'static str,
        route: String,
    },

    #[error("route {0} is not registered")]
    RouteNotRegistered(String),

    #[error("managed pool route {0} ignored")]
    ManagedPoolRoute(String),

    #[error("dynamic config manager is not initialized with a router")]
    RouterUnavailable,

    // -- Reload pipeline --
    #[error("reload command failed: {0}")]
    ReloadFailed(String),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl DynconfError {
    /// True when the error came from the control socket connection itself
    /// rather than from the load balancer rejecting a command.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Socket { .. })
    }
}
