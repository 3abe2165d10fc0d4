//! One HAProxy backend and its servers.
//!
//! Server changes (address, weight, admin state) are staged per server
//! and flushed together by [`Backend::commit`]. Servers whose name starts
//! with [`DYNAMIC_SERVER_PREFIX`] are pre-declared placeholders that can be
//! bound to any endpoint at runtime; every other server is addressed by
//! its endpoint id.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::client::{expect_success, Client};
use crate::error::DynconfError;

pub const DYNAMIC_SERVER_PREFIX: &str = "_dynamic-pod-";

/// HAProxy prints these after `set server ... addr`.
const ADDR_ACKNOWLEDGEMENTS: &[&str] = &["IP changed from", "no need to change", "port changed"];

// srv_admin_state bits (FMAINT, IMAINT, CMAINT, RMAINT, HMAINT / FDRAIN, IDRAIN)
const ADMIN_MAINT_MASK: u32 = 0x01 | 0x02 | 0x04 | 0x20 | 0x40;
const ADMIN_DRAIN_MASK: u32 = 0x08 | 0x10;

#[must_use]
pub fn is_dynamic_server(name: &str) -> bool {
    name.starts_with(DYNAMIC_SERVER_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Ready,
    Drain,
    Maintenance,
}

impl ServerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Drain => "drain",
            Self::Maintenance => "maint",
        }
    }

    const fn from_admin_bits(bits: u32) -> Self {
        if bits & ADMIN_MAINT_MASK != 0 {
            Self::Maintenance
        } else if bits & ADMIN_DRAIN_MASK != 0 {
            Self::Drain
        } else {
            Self::Ready
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub weight: u32,
    pub state: ServerState,
}

impl ServerInfo {
    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        is_dynamic_server(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PendingChange {
    addr: Option<(String, u16)>,
    app_protocol: Option<String>,
    weight: Option<(u32, bool)>,
    state: Option<ServerState>,
}

#[derive(Debug)]
pub struct Backend {
    client: Arc<Client>,
    name: String,
    servers: Option<Vec<ServerInfo>>,
    pending: BTreeMap<String, PendingChange>,
}

impl Backend {
    pub(crate) fn new(client: Arc<Client>, name: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
            servers: None,
            pending: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn refresh(&mut self) -> Result<(), DynconfError> {
        let command = format!("show servers state {}", self.name);
        let backend = self.name.clone();
        let servers = self
            .client
            .run_command(&command, |r| parse_servers_state(&command, &backend, r))
            .await?;
        self.servers = Some(servers);
        Ok(())
    }

    /// Servers as last reported by HAProxy (staged changes not applied).
    pub async fn servers(&mut self) -> Result<Vec<ServerInfo>, DynconfError> {
        if self.servers.is_none() {
            self.refresh().await?;
        }
        Ok(self.servers.clone().unwrap_or_default())
    }

    async fn stage(&mut self, server: &str) -> Result<&mut PendingChange, DynconfError> {
        if !self.servers().await?.iter().any(|s| s.name == server) {
            return Err(DynconfError::ServerNotFound {
                backend: self.name.clone(),
                server: server.to_string(),
            });
        }
        Ok(self.pending.entry(server.to_string()).or_default())
    }

    pub async fn enable_server(&mut self, name: &str) -> Result<(), DynconfError> {
        self.stage(name).await?.state = Some(ServerState::Ready);
        Ok(())
    }

    pub async fn disable_server(&mut self, name: &str) -> Result<(), DynconfError> {
        self.stage(name).await?.state = Some(ServerState::Maintenance);
        Ok(())
    }

    /// Put every server of the backend into maintenance.
    pub async fn disable(&mut self) -> Result<(), DynconfError> {
        for server in self.servers().await? {
            self.disable_server(&server.name).await?;
        }
        Ok(())
    }

    /// Stage a new address and weight. A relative weight is sent as a
    /// percentage of the server's configured weight.
    pub async fn update_server_info(
        &mut self,
        name: &str,
        ip: &str,
        port: u16,
        app_protocol: Option<&str>,
        weight: u32,
        weight_is_relative: bool,
    ) -> Result<(), DynconfError> {
        let change = self.stage(name).await?;
        change.addr = Some((ip.to_string(), port));
        change.app_protocol = app_protocol.map(String::from);
        change.weight = Some((weight, weight_is_relative));
        Ok(())
    }

    /// Set the dynamic cookie key and enable dynamic cookies, so sticky
    /// sessions hash consistently whichever backend serves the route.
    pub async fn set_routing_key(&self, key: &str) -> Result<(), DynconfError> {
        let set = format!("set dynamic-cookie-key backend {} {key}", self.name);
        expect_success(&set, &self.client.execute(&set).await?, &[])?;

        let enable = format!("enable dynamic-cookie backend {}", self.name);
        expect_success(&enable, &self.client.execute(&enable).await?, &[])
    }

    /// Send all staged server changes. Servers are processed in name
    /// order; the first rejected command aborts the commit.
    pub async fn commit(&mut self) -> Result<(), DynconfError> {
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return Ok(());
        }

        let _guard = self.client.lock_transaction().await;
        self.servers = None;

        for (server, change) in &pending {
            let target = format!("{}/{server}", self.name);

            if let Some((ip, port)) = &change.addr {
                if let Some(proto) = &change.app_protocol {
                    tracing::debug!(server = %target, app_protocol = %proto, "application protocol is fixed at render time");
                }
                let command = format!("set server {target} addr {ip} port {port}");
                let response = self.client.execute(&command).await?;
                expect_success(&command, &response, ADDR_ACKNOWLEDGEMENTS)?;
            }

            if let Some((weight, relative)) = change.weight {
                let suffix = if relative { "%" } else { "" };
                let command = format!("set server {target} weight {weight}{suffix}");
                let response = self.client.execute(&command).await?;
                expect_success(&command, &response, &[])?;
            }

            if let Some(state) = change.state {
                let command = format!("set server {target} state {}", state.as_str());
                let response = self.client.execute(&command).await?;
                expect_success(&command, &response, &[])?;
            }
        }

        tracing::debug!(backend = %self.name, servers = pending.len(), "backend changes committed");
        Ok(())
    }
}

/// Parse `show servers state <backend>`.
///
/// The output is a format version line, a `#`-prefixed header naming the
/// columns, then one space-separated row per server.
pub fn parse_servers_state(
    command: &str,
    backend: &str,
    response: &str,
) -> Result<Vec<ServerInfo>, DynconfError> {
    let malformed = |detail: String| DynconfError::UnexpectedResponse {
        command: command.to_string(),
        detail,
    };

    let mut columns: Vec<&str> = Vec::new();
    let mut servers = Vec::new();

    for line in response.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('#') {
            columns = header.split_whitespace().collect();
            continue;
        }
        if columns.is_empty() {
            // Format version line precedes the header.
            continue;
        }

        let values: Vec<&str> = line.split_whitespace().collect();
        let field = |name: &str| -> Result<&str, DynconfError> {
            columns
                .iter()
                .position(|c| *c == name)
                .and_then(|i| values.get(i).copied())
                .ok_or_else(|| malformed(format!("missing column '{name}' in '{line}'")))
        };
        let number = |name: &str| -> Result<u32, DynconfError> {
            let raw = field(name)?;
            raw.parse()
                .map_err(|_| malformed(format!("column '{name}' is not a number: '{raw}'")))
        };

        if field("be_name")? != backend {
            continue;
        }
        let port = match field("srv_port") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| malformed(format!("invalid port '{raw}'")))?,
            Err(_) => 0,
        };

        servers.push(ServerInfo {
            id: field("srv_id")?.to_string(),
            name: field("srv_name")?.to_string(),
            ip: field("srv_addr")?.to_string(),
            port,
            weight: number("srv_uweight")?,
            state: ServerState::from_admin_bits(number("srv_admin_state")?),
        });
    }

    Ok(servers)
}
