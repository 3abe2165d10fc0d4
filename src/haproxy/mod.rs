//! HAProxy runtime API plumbing.
//!
//! - [`transport`] -- one request/response exchange over the control
//!   socket, behind the [`Transport`](transport::Transport) trait.
//! - [`client`] -- retrying command client with instance-scoped
//!   discovery caches.
//! - [`map`] -- one named pattern map and its versioned bulk replace.
//! - [`backend`] -- one backend and its servers.

pub mod backend;
pub mod client;
pub mod map;
pub mod transport;

pub use backend::{is_dynamic_server, Backend, ServerInfo, ServerState, DYNAMIC_SERVER_PREFIX};
pub use client::Client;
pub use map::{MapEntry, MapStore};
pub use transport::{SocketAddress, SocketTransport, Transport};
