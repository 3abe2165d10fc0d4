//! In-memory stand-in for an HAProxy control socket.
//!
//! [`FakeHaproxy`] implements [`Transport`] and answers the runtime API
//! commands the crate sends: backend and map discovery, versioned map
//! transactions, `show servers state` and the `set server` family.
//! Failures can be injected per command prefix, as refused connections
//! or as a missing socket file.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use haproxy_dynconf::haproxy::{Client, Transport};

pub const MAP_DIR: &str = "/var/lib/haproxy/conf";

pub const MAPS: &[&str] = &[
    "os_http_be.map",
    "os_edge_reencrypt_be.map",
    "os_route_http_redirect.map",
    "os_sni_passthrough.map",
    "os_tcp_be.map",
    "os_wildcard_domain.map",
];

const STATE_HEADER: &str = "# be_id be_name srv_id srv_name srv_addr srv_op_state srv_admin_state srv_uweight srv_iweight srv_time_since_last_change srv_check_status srv_check_result srv_check_health srv_check_state srv_agent_state bk_f_forced_id srv_f_forced_id srv_fqdn srv_port";

const ADMIN_FMAINT: u32 = 0x01;
const ADMIN_FDRAIN: u32 = 0x08;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeServer {
    pub id: u32,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub weight: u32,
    pub initial_weight: u32,
    pub admin: u32,
}

impl FakeServer {
    pub fn is_ready(&self) -> bool {
        self.admin == 0
    }

    pub fn is_maintenance(&self) -> bool {
        self.admin & ADMIN_FMAINT != 0
    }
}

#[derive(Debug, Default)]
struct FakeMap {
    entries: Vec<(u64, String, String)>,
    pending: BTreeMap<u64, Vec<(String, String)>>,
    next_version: u64,
}

#[derive(Default)]
struct FakeState {
    backends: BTreeMap<String, Vec<FakeServer>>,
    maps: BTreeMap<String, FakeMap>,
    next_entry_id: u64,
    cookie_keys: BTreeMap<String, String>,
    dynamic_cookies: BTreeSet<String>,
    commands: Vec<String>,
    refuse: usize,
    missing: bool,
    failures: Vec<(String, String)>,
}

#[derive(Default)]
pub struct FakeHaproxy {
    state: Mutex<FakeState>,
}

impl FakeHaproxy {
    /// A process with every route map loaded and no backends.
    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        {
            let mut state = fake.lock();
            for name in MAPS {
                state.maps.insert(format!("{MAP_DIR}/{name}"), FakeMap::default());
            }
        }
        Arc::new(fake)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn client(self: &Arc<Self>) -> Arc<Client> {
        Arc::new(Client::new(Arc::clone(self) as Arc<dyn Transport>))
    }

    /// Declare a backend with `dynamic` placeholder servers, all in
    /// maintenance without an address.
    pub fn add_backend(&self, name: &str, dynamic: usize) {
        let servers = (1..=dynamic)
            .map(|n| FakeServer {
                id: n as u32,
                name: format!("_dynamic-pod-{n}"),
                ip: "0.0.0.0".into(),
                port: 0,
                weight: 1,
                initial_weight: 1,
                admin: ADMIN_FMAINT,
            })
            .collect();
        self.lock().backends.insert(name.to_string(), servers);
    }

    /// Add a rendered (non-placeholder) server to an existing backend.
    pub fn add_static_server(&self, backend: &str, name: &str, ip: &str, port: u16) {
        let mut state = self.lock();
        let servers = state.backends.entry(backend.to_string()).or_default();
        let id = servers.len() as u32 + 1;
        servers.push(FakeServer {
            id,
            name: name.to_string(),
            ip: ip.to_string(),
            port,
            weight: 256,
            initial_weight: 256,
            admin: 0,
        });
    }

    /// The pool backends of a default blueprint, e.g. `("be_edge_http", "edge")`.
    pub fn add_pool(&self, prefix: &str, blueprint: &str, slots: usize, dynamic: usize) {
        for n in 1..=slots {
            self.add_backend(
                &format!("{prefix}:openshift:_dynamic-blueprint-{blueprint}-{n}"),
                dynamic,
            );
        }
    }

    /// Fail the next `n` exchanges with "connection refused".
    pub fn refuse_next(&self, n: usize) {
        self.lock().refuse = n;
    }

    /// Behave as if the socket file did not exist.
    pub fn remove_socket(&self) {
        self.lock().missing = true;
    }

    /// Answer commands starting with `prefix` with `response`.
    pub fn fail_on(&self, prefix: &str, response: &str) {
        self.lock()
            .failures
            .push((prefix.to_string(), response.to_string()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// First line of every command received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn count_commands(&self, prefix: &str) -> usize {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    /// `(key, value)` pairs of a map in file order.
    pub fn map(&self, name: &str) -> Vec<(String, String)> {
        self.lock()
            .maps
            .get(&format!("{MAP_DIR}/{name}"))
            .map(|m| {
                m.entries
                    .iter()
                    .map(|(_, k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_map(&self, name: &str, entries: &[(&str, &str)]) {
        let mut state = self.lock();
        let mut ids = Vec::new();
        for _ in entries {
            state.next_entry_id += 1;
            ids.push(state.next_entry_id);
        }
        let map = state.maps.entry(format!("{MAP_DIR}/{name}")).or_default();
        map.entries = entries
            .iter()
            .zip(ids)
            .map(|((k, v), id)| (id, (*k).to_string(), (*v).to_string()))
            .collect();
    }

    pub fn servers(&self, backend: &str) -> Vec<FakeServer> {
        self.lock().backends.get(backend).cloned().unwrap_or_default()
    }

    pub fn server(&self, backend: &str, name: &str) -> Option<FakeServer> {
        self.servers(backend).into_iter().find(|s| s.name == name)
    }

    pub fn cookie_key(&self, backend: &str) -> Option<String> {
        let state = self.lock();
        state
            .dynamic_cookies
            .contains(backend)
            .then(|| state.cookie_keys.get(backend).cloned())
            .flatten()
    }

    fn handle(state: &mut FakeState, command: &str) -> String {
        let first = command.lines().next().unwrap_or_default();
        let words: Vec<&str> = first.split_whitespace().collect();
        match words.as_slice() {
            ["show", "backend"] => {
                let mut out = String::from("# name\n");
                for name in state.backends.keys() {
                    out.push_str(name);
                    out.push('\n');
                }
                out
            }
            ["show", "map"] => {
                let mut out = String::from("# id (file) description\n");
                for (i, path) in state.maps.keys().enumerate() {
                    out.push_str(&format!(
                        "{i} ({path}) pattern loaded from file '{path}' used by map at file '/var/lib/haproxy/conf/haproxy.config' line {}. curr_ver=0 next_ver=0 entry_cnt=0\n",
                        40 + i
                    ));
                }
                out
            }
            ["show", "map", path] => match state.maps.get(*path) {
                Some(map) => {
                    let mut out = String::new();
                    for (id, key, value) in &map.entries {
                        out.push_str(&format!("0x{id:x} {key} {value}\n"));
                    }
                    out
                }
                None => "Unknown map identifier. Please use #<id> or <file>.\n".into(),
            },
            ["prepare", "map", path] => match state.maps.get_mut(*path) {
                Some(map) => {
                    map.next_version += 1;
                    let version = map.next_version;
                    map.pending.insert(version, Vec::new());
                    format!("New version created: {version}\n")
                }
                None => "Unknown map identifier.\n".into(),
            },
            ["add", "map", version, path, "<<"] => {
                let Some(version) = version.strip_prefix('@').and_then(|v| v.parse::<u64>().ok())
                else {
                    return "Invalid version.\n".into();
                };
                let Some(pending) = state
                    .maps
                    .get_mut(*path)
                    .and_then(|m| m.pending.get_mut(&version))
                else {
                    return "Unknown map version.\n".into();
                };
                for line in command.lines().skip(1).filter(|l| !l.trim().is_empty()) {
                    if let Some((key, value)) = line.split_once(' ') {
                        pending.push((key.to_string(), value.to_string()));
                    }
                }
                String::new()
            }
            ["add", "map", path, key, value] => {
                state.next_entry_id += 1;
                let id = state.next_entry_id;
                match state.maps.get_mut(*path) {
                    Some(map) => {
                        map.entries.push((id, (*key).to_string(), (*value).to_string()));
                        String::new()
                    }
                    None => "Unknown map identifier.\n".into(),
                }
            }
            ["del", "map", path, id] => {
                let Some(map) = state.maps.get_mut(*path) else {
                    return "Unknown map identifier.\n".into();
                };
                let id = id.trim_start_matches("#0x").trim_start_matches('#');
                let before = map.entries.len();
                map.entries
                    .retain(|(entry, _, _)| format!("{entry:x}") != id && entry.to_string() != id);
                if map.entries.len() == before {
                    "Key not found.\n".into()
                } else {
                    String::new()
                }
            }
            ["commit", "map", version, path] => {
                let Some(version) = version.strip_prefix('@').and_then(|v| v.parse::<u64>().ok())
                else {
                    return "Invalid version.\n".into();
                };
                let Some(content) = state
                    .maps
                    .get_mut(*path)
                    .and_then(|m| m.pending.remove(&version))
                else {
                    return "Unknown map version.\n".into();
                };
                let mut entries = Vec::new();
                for (key, value) in content {
                    state.next_entry_id += 1;
                    entries.push((state.next_entry_id, key, value));
                }
                if let Some(map) = state.maps.get_mut(*path) {
                    map.entries = entries;
                    map.pending.clear();
                }
                String::new()
            }
            ["show", "servers", "state", backend] => {
                let mut out = format!("1\n{STATE_HEADER}\n");
                if let Some(servers) = state.backends.get(*backend) {
                    for s in servers {
                        let op_state = if s.admin == 0 { 2 } else { 0 };
                        out.push_str(&format!(
                            "7 {backend} {} {} {} {op_state} {} {} {} 120 6 3 4 6 0 0 0 - {}\n",
                            s.id, s.name, s.ip, s.admin, s.weight, s.initial_weight, s.port
                        ));
                    }
                }
                out
            }
            ["set", "server", target, rest @ ..] => Self::set_server(state, target, rest),
            ["set", "dynamic-cookie-key", "backend", backend, key] => {
                if !state.backends.contains_key(*backend) {
                    return "No such backend.\n".into();
                }
                state
                    .cookie_keys
                    .insert((*backend).to_string(), (*key).to_string());
                String::new()
            }
            ["enable", "dynamic-cookie", "backend", backend] => {
                if !state.backends.contains_key(*backend) {
                    return "No such backend.\n".into();
                }
                state.dynamic_cookies.insert((*backend).to_string());
                String::new()
            }
            _ => "Unknown command. Please enter one of the following commands only :\n".into(),
        }
    }

    fn set_server(state: &mut FakeState, target: &str, rest: &[&str]) -> String {
        let Some((backend, name)) = target.split_once('/') else {
            return "Require 'backend/server'.\n".into();
        };
        let Some(servers) = state.backends.get_mut(backend) else {
            return "No such backend.\n".into();
        };
        let Some(server) = servers.iter_mut().find(|s| s.name == name) else {
            return "No such server.\n".into();
        };
        match rest {
            ["addr", ip, "port", port] => {
                let Ok(port) = port.parse::<u16>() else {
                    return "Invalid port.\n".into();
                };
                let previous = std::mem::replace(&mut server.ip, (*ip).to_string());
                let previous_port = std::mem::replace(&mut server.port, port);
                if previous == *ip && previous_port == port {
                    return "no need to change the addr\n".into();
                }
                format!(
                    "IP changed from '{previous}' to '{ip}', port changed from '{previous_port}' to '{port}' by 'stats socket command'\n"
                )
            }
            ["weight", weight] => {
                let parsed = match weight.strip_suffix('%') {
                    Some(pct) => pct
                        .parse::<u32>()
                        .ok()
                        .map(|p| server.initial_weight * p / 100),
                    None => weight.parse::<u32>().ok(),
                };
                match parsed {
                    Some(w) if w <= 256 => {
                        server.weight = w;
                        String::new()
                    }
                    _ => "Invalid weight.\n".into(),
                }
            }
            ["state", "ready"] => {
                server.admin = 0;
                String::new()
            }
            ["state", "maint"] => {
                server.admin = ADMIN_FMAINT;
                String::new()
            }
            ["state", "drain"] => {
                server.admin = ADMIN_FDRAIN;
                String::new()
            }
            _ => "Unknown 'set server' argument.\n".into(),
        }
    }
}

#[async_trait]
impl Transport for FakeHaproxy {
    async fn round_trip(&self, command: &str) -> std::io::Result<String> {
        let mut state = self.lock();
        let first = command.lines().next().unwrap_or_default().to_string();
        state.commands.push(first.clone());

        if state.missing {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such file or directory",
            ));
        }
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        if let Some((_, response)) = state.failures.iter().find(|(p, _)| first.starts_with(p.as_str())) {
            return Ok(response.clone());
        }
        Ok(Self::handle(&mut state, command))
    }
}
