//! `dynconf run`: keep a running HAProxy in line with a desired-state file.
//!
//! Connects to the control socket, wires the dynamic configuration
//! manager into the router, applies the initial desired state and serves
//! the health endpoint while a background loop polls the file for
//! changes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cli::RunArgs;
use crate::cmd::connect;
use crate::config::{sources, ConfigSource};
use crate::error::DynconfError;
use crate::logging;
use crate::manager::{ConfigManager, DynamicConfigManager, ManagerOptions};
use crate::router::{RouterOptions, TemplateRouter};
use crate::server::{self, AppState, LoadedState, Stats};

pub async fn execute(args: RunArgs) -> Result<(), DynconfError> {
    let log_format = logging::resolve_format(args.pretty, args.json);
    logging::init(&args.log_level, log_format);

    let source = resolve_file_source(args.config.clone()).await?;
    let (desired, version) = source.load().await?;

    let manager = if args.no_dynamic {
        tracing::info!("dynamic configuration disabled, every change reloads");
        None
    } else {
        let client = connect(&args.socket)?;
        Some(DynamicConfigManager::new(client, manager_options(&args)))
    };

    let router = TemplateRouter::new(
        router_options(&args),
        manager
            .clone()
            .map(|m| Arc::new(m) as Arc<dyn ConfigManager>),
    );
    router.start().await;
    router.sync(&desired).await;

    let state = Arc::new(AppState {
        router: Arc::clone(&router),
        manager,
        desired: tokio::sync::RwLock::new(LoadedState {
            version,
            source_name: source.name().to_string(),
            loaded_at: Instant::now(),
        }),
        start_time: Instant::now(),
        stats: Stats::default(),
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let refresh_state = Arc::clone(&state);
    let poll_interval = args.poll_interval;
    let refresh_handle = tokio::spawn(async move {
        desired_state_refresh_loop(refresh_state, source, poll_interval, shutdown_rx).await;
    });

    let app = server::build_router(Arc::clone(&state));
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(
        addr = %addr,
        socket = %args.socket.socket,
        routes = desired.routes.len(),
        endpoints = desired.total_endpoints(),
        dynamic = !args.no_dynamic,
        "dynconf started"
    );

    let graceful_shutdown = async move {
        server::shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(graceful_shutdown)
        .await?;

    if let Err(e) = refresh_handle.await {
        tracing::error!(error = %e, "desired-state refresh task failed");
    }
    router.stop().await;

    tracing::info!("dynconf stopped");
    Ok(())
}

fn manager_options(args: &RunArgs) -> ManagerOptions {
    ManagerOptions {
        blueprint_pool_size: args.pool_size,
        max_dynamic_servers: args.max_dynamic_servers,
        commit_interval: Duration::from_secs(args.commit_interval),
        blueprint_namespace: args.blueprint_namespace.clone(),
        wildcard_routes_allowed: args.allow_wildcard_routes,
        ..ManagerOptions::default()
    }
}

fn router_options(args: &RunArgs) -> RouterOptions {
    RouterOptions {
        reload_interval: Duration::from_secs(args.reload_interval),
        reload_command: args.reload_command.clone(),
        state_file: args.state_file.clone(),
        cert_path: args.cert_path.clone(),
        wildcard_routes_allowed: args.allow_wildcard_routes,
    }
}

async fn resolve_file_source(
    explicit: Option<PathBuf>,
) -> Result<Box<dyn ConfigSource>, DynconfError> {
    if let Some(path) = explicit {
        return sources::source_for_path(path);
    }

    let candidates = ["dynconf.yaml", "dynconf.yml", "dynconf.json", "dynconf.toml"];
    for name in &candidates {
        let path = PathBuf::from(name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::info!(path = %path.display(), "auto-detected desired-state file");
            return sources::source_for_path(path);
        }
    }

    Err(DynconfError::NoConfigSource {
        hint: "Provide --config <file> or place dynconf.yaml in the working directory.\n  \
               Run 'dynconf validate <file>' to check it first."
            .into(),
    })
}

async fn desired_state_refresh_loop(
    state: Arc<AppState>,
    source: Box<dyn ConfigSource>,
    interval_secs: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                tracing::debug!("desired-state refresh loop shutting down");
                return;
            }
        }

        let current_version = state.desired.read().await.version.clone();

        match source.has_changed(&current_version).await {
            Ok(true) => {
                tracing::info!("desired-state change detected");
                match source.load().await {
                    Ok((desired, version)) => {
                        state.router.sync(&desired).await;
                        let mut loaded = state.desired.write().await;
                        loaded.version = version;
                        loaded.loaded_at = Instant::now();
                        drop(loaded);
                        state.stats.refreshes.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(
                            routes = desired.routes.len(),
                            endpoints = desired.total_endpoints(),
                            "desired state applied"
                        );
                    }
                    Err(e) => {
                        state.stats.refresh_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(error = %e, "desired-state load failed, keeping current state");
                    }
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "desired-state change check failed");
            }
        }
    }
}
