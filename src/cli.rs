//! Command-line interface definitions using clap derive macros.
//!
//! Contains the top-level [`Cli`] parser, the [`Commands`] enum for
//! subcommands (run, validate, inspect), and their associated argument
//! structs. Every `run` flag has an environment variable equivalent for
//! container deployments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

pub const DEFAULT_SOCKET: &str = "/var/lib/haproxy/run/haproxy.sock";

#[derive(Parser)]
#[command(
    name = "dynconf",
    version,
    about = "Reconfigure a running HAProxy without reloading it",
    propagate_version = true,
    after_help = "\x1b[1mQuick start:\x1b[0m\n  \
        dynconf validate state.yaml            Check a desired-state file\n  \
        dynconf run -c state.yaml              Serve the desired state\n  \
        dynconf inspect maps                   List maps on the control socket"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch a desired-state file and keep HAProxy in line with it
    Run(Box<RunArgs>),

    /// Validate a desired-state file without starting
    Validate(ValidateArgs),

    /// Query a running HAProxy through its control socket
    Inspect(InspectArgs),
}

#[derive(Args)]
pub struct SocketArgs {
    /// Control socket: a unix socket path or tcp://host:port
    #[arg(short, long, env = "HAPROXY_SOCKET", default_value = DEFAULT_SOCKET)]
    pub socket: String,

    /// Control socket command timeout in milliseconds
    #[arg(long, env = "HAPROXY_SOCKET_TIMEOUT_MS", default_value_t = 5000)]
    pub socket_timeout: u64,
}

#[derive(Args)]
#[command(after_help = "\x1b[1mExamples:\x1b[0m\n  \
        dynconf run -c state.yaml                                  Defaults\n  \
        dynconf run -c state.yaml --reload-command 'systemctl reload haproxy'\n  \
        dynconf run -c state.yaml --no-dynamic --pretty            Reload-only, local dev")]
pub struct RunArgs {
    /// Desired-state file (.yaml, .json, .toml)
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub socket: SocketArgs,

    /// Health endpoint port
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Health endpoint address
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    // -- Reloads --
    /// Command run after the state file is written
    #[arg(long, env = "RELOAD_COMMAND", help_heading = "Reloads")]
    pub reload_command: Option<String>,

    /// Rendered state written before every reload
    #[arg(long, env = "STATE_FILE", help_heading = "Reloads")]
    pub state_file: Option<PathBuf>,

    /// Minimum seconds between two reloads
    #[arg(
        long,
        env = "RELOAD_INTERVAL_SECS",
        default_value_t = 5,
        help_heading = "Reloads"
    )]
    pub reload_interval: u64,

    /// Directory holding route certificates
    #[arg(
        long,
        env = "CERT_PATH",
        default_value = "/var/lib/haproxy/router/certs",
        help_heading = "Reloads"
    )]
    pub cert_path: String,

    // -- Dynamic configuration --
    /// Apply every change with a reload
    #[arg(long, env = "DYNCONF_NO_DYNAMIC", help_heading = "Dynamic configuration")]
    pub no_dynamic: bool,

    /// Pool size of blueprints without a pool-size annotation
    #[arg(
        long,
        env = "ROUTER_BLUEPRINT_ROUTE_POOL_SIZE",
        default_value_t = crate::manager::DEFAULT_BLUEPRINT_POOL_SIZE,
        help_heading = "Dynamic configuration"
    )]
    pub pool_size: usize,

    /// Dynamic servers declared per backend
    #[arg(
        long,
        env = "ROUTER_MAX_DYNAMIC_SERVERS",
        default_value_t = crate::manager::DEFAULT_MAX_DYNAMIC_SERVERS,
        help_heading = "Dynamic configuration"
    )]
    pub max_dynamic_servers: usize,

    /// Namespace of blueprint and pool routes
    #[arg(
        long,
        env = "ROUTER_BLUEPRINT_ROUTE_NAMESPACE",
        default_value = crate::manager::blueprint::DEFAULT_BLUEPRINT_NAMESPACE,
        help_heading = "Dynamic configuration"
    )]
    pub blueprint_namespace: String,

    /// Seconds before dynamic changes are persisted with a reload
    #[arg(
        long,
        env = "COMMIT_INTERVAL_SECS",
        default_value_t = 3600,
        help_heading = "Dynamic configuration"
    )]
    pub commit_interval: u64,

    /// Serve wildcard (subdomain) routes
    #[arg(long, env = "ROUTER_ALLOW_WILDCARD_ROUTES", help_heading = "Dynamic configuration")]
    pub allow_wildcard_routes: bool,

    // -- Logging --
    /// Log level
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Force pretty (human-readable) log output
    #[arg(long)]
    pub pretty: bool,

    /// Force JSON log output (overrides TTY detection)
    #[arg(long, conflicts_with = "pretty")]
    pub json: bool,

    /// Desired-state refresh interval in seconds
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 5)]
    pub poll_interval: u64,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Desired-state file to validate
    #[arg(default_value = "dynconf.yaml")]
    pub config: PathBuf,

    /// Output format
    #[arg(long, default_value = "text")]
    pub format: ValidateFormat,
}

#[derive(Args)]
#[command(after_help = "\x1b[1mExamples:\x1b[0m\n  \
        dynconf inspect backends\n  \
        dynconf inspect map os_http_be.map\n  \
        dynconf inspect servers be_http:shop:web --json")]
pub struct InspectArgs {
    #[command(subcommand)]
    pub target: InspectTarget,

    #[command(flatten)]
    pub socket: SocketArgs,

    /// Output as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum InspectTarget {
    /// List backends
    Backends,
    /// List maps
    Maps,
    /// Show the entries of one map (file name or path)
    Map { name: String },
    /// Show the servers of one backend
    Servers { backend: String },
}

#[derive(Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn to_tracing_level(&self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Clone, Debug, ValueEnum)]
pub enum ValidateFormat {
    Text,
    Json,
}
