//! Retrying control socket client.
//!
//! [`Client`] sends one command per connection through its
//! [`Transport`] and retries only connection-level failures
//! ("connection refused", "connection reset by peer") with exponential
//! backoff. It also owns the lazily discovered lists of backends and
//! maps; [`Client::reset`] drops them after a reload, since backend and
//! map identities may change whenever HAProxy restarts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use super::backend::Backend;
use super::map::MapStore;
use super::transport::Transport;
use crate::error::DynconfError;

/// Total attempts per command, including the first one.
pub const MAX_ATTEMPTS: u32 = 3;

/// Delay before the first retry; doubles on every further retry.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(10);

const TRANSIENT_ERRORS: &[&str] = &["connection reset by peer", "connection refused"];

/// A map as listed by `show map`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInfo {
    pub id: String,
    /// File path; this is the name used in map commands.
    pub path: String,
}

impl MapInfo {
    /// File name without directories, e.g. `os_http_be.map`.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

pub struct Client {
    transport: Arc<dyn Transport>,
    backends: Mutex<Option<Vec<String>>>,
    maps: Mutex<Option<Vec<MapInfo>>>,
    transaction: Mutex<()>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    let message = err.to_string().to_lowercase();
    TRANSIENT_ERRORS.iter().any(|t| message.contains(t))
}

/// First line of a command, for logs and errors (payloads can be large).
#[must_use]
pub fn command_summary(command: &str) -> &str {
    command.lines().next().unwrap_or(command).trim_end_matches(" <<")
}

/// Mutating commands succeed with an empty response; anything else is the
/// load balancer's error text, unless it starts with one of the
/// informational `acknowledgements` the command is known to print.
pub fn expect_success(
    command: &str,
    response: &str,
    acknowledgements: &[&str],
) -> Result<(), DynconfError> {
    let trimmed = response.trim();
    if trimmed.is_empty() || acknowledgements.iter().any(|a| trimmed.starts_with(a)) {
        Ok(())
    } else {
        Err(DynconfError::CommandFailed {
            command: command_summary(command).to_string(),
            response: trimmed.to_string(),
        })
    }
}

impl Client {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            backends: Mutex::new(None),
            maps: Mutex::new(None),
            transaction: Mutex::new(()),
        }
    }

    /// Send a command and return the raw response.
    pub async fn execute(&self, command: &str) -> Result<String, DynconfError> {
        let mut delay = RETRY_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.transport.round_trip(command).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < MAX_ATTEMPTS && is_transient(&e) => {
                    tracing::debug!(
                        command = command_summary(command),
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "transient control socket error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(DynconfError::Socket {
                        command: command_summary(command).to_string(),
                        source: e,
                    });
                }
            }
        }
    }

    /// Send a command and parse its response with `converter`.
    pub async fn run_command<T, F>(&self, command: &str, converter: F) -> Result<T, DynconfError>
    where
        F: FnOnce(&str) -> Result<T, DynconfError>,
    {
        let response = self.execute(command).await?;
        converter(&response)
    }

    /// Drop discovered backends and maps so the next lookup re-queries.
    pub async fn reset(&self) {
        *self.backends.lock().await = None;
        *self.maps.lock().await = None;
        tracing::debug!("control socket discovery caches reset");
    }

    /// Serializes command sequences that must not interleave, such as the
    /// map prepare/add/commit triple.
    pub async fn lock_transaction(&self) -> MutexGuard<'_, ()> {
        self.transaction.lock().await
    }

    /// Backend names, discovered once via `show backend`.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn backends(&self) -> Result<Vec<String>, DynconfError> {
        let mut cache = self.backends.lock().await;
        if let Some(ref names) = *cache {
            return Ok(names.clone());
        }
        let names = self.run_command("show backend", parse_backend_list).await?;
        *cache = Some(names.clone());
        Ok(names)
    }

    /// Maps, discovered once via `show map`.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn maps(&self) -> Result<Vec<MapInfo>, DynconfError> {
        let mut cache = self.maps.lock().await;
        if let Some(ref maps) = *cache {
            return Ok(maps.clone());
        }
        let maps = self.run_command("show map", parse_map_list).await?;
        *cache = Some(maps.clone());
        Ok(maps)
    }

    pub async fn find_backend(self: &Arc<Self>, name: &str) -> Result<Backend, DynconfError> {
        if self.backends().await?.iter().any(|b| b == name) {
            Ok(Backend::new(Arc::clone(self), name))
        } else {
            Err(DynconfError::BackendNotFound(name.to_string()))
        }
    }

    /// Look a map up by file name (`os_http_be.map`) or full path.
    pub async fn find_map(self: &Arc<Self>, name: &str) -> Result<MapStore, DynconfError> {
        self.maps()
            .await?
            .into_iter()
            .find(|m| m.path == name || m.file_name() == name)
            .map(|m| MapStore::new(Arc::clone(self), m.path))
            .ok_or_else(|| DynconfError::MapNotFound(name.to_string()))
    }
}

/// Parse `show backend`: a `# name` header followed by one name per line.
pub fn parse_backend_list(response: &str) -> Result<Vec<String>, DynconfError> {
    Ok(response
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}

/// Parse `show map`: `<id> (<path>) <description...>` per line.
pub fn parse_map_list(response: &str) -> Result<Vec<MapInfo>, DynconfError> {
    let mut maps = Vec::new();
    for line in response.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(id), Some(path)) = (fields.next(), fields.next()) else {
            return Err(DynconfError::UnexpectedResponse {
                command: "show map".into(),
                detail: format!("malformed line '{line}'"),
            });
        };
        let path = path.trim_start_matches('(').trim_end_matches(')');
        maps.push(MapInfo {
            id: id.to_string(),
            path: path.to_string(),
        });
    }
    Ok(maps)
}
