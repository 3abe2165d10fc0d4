//! haproxy-dynconf keeps a running HAProxy in line with a desired routing
//! state, applying most changes through the runtime API instead of a
//! process reload.
//!
//! Routes are bound to pre-provisioned backends cloned from blueprint
//! routes; endpoints are written into placeholder servers; host and path
//! selection lives in pattern maps replaced with versioned transactions.
//! Whatever cannot be applied at runtime falls back to a reload, and
//! reloads are coalesced so bursts of changes produce a bounded number
//! of them.
//!
//! # Architecture
//!
//! - [`cli`] -- Command-line argument parsing with clap derive macros.
//! - [`cmd`] -- Subcommand dispatch and execution (run, validate, inspect).
//! - [`config`] -- Desired-state loading, validation and change detection via
//!   the [`ConfigSource`](config::ConfigSource) trait.
//! - [`error`] -- Unified error types using `thiserror`.
//! - [`haproxy`] -- Control socket transport, retrying client, map store and
//!   backend/server abstraction.
//! - [`health`] -- `GET /health` endpoint handler returning runtime diagnostics.
//! - [`logging`] -- Structured tracing setup with JSON and pretty-print output.
//! - [`manager`] -- Dynamic configuration manager: blueprint pools, map
//!   associations and endpoint binding.
//! - [`route`] -- Route and endpoint types.
//! - [`router`] -- Desired routing state, fallback and the reload pipeline.
//! - [`scheduler`] -- Coalescing serializing scheduler driving reloads.
//! - [`server`] -- Axum server setup, shared application state and graceful
//!   shutdown.
//!
//! # Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `yaml` | YAML desired-state support _(enabled by default)_ |
//! | `json` | JSON desired-state support |
//! | `toml` | TOML desired-state support |
//! | `file-backends` | All file formats |
//! | `full` | All features |

// Binary crate: public functions are internal, not consumed by external users.
#![allow(clippy::missing_errors_doc)]

pub mod cli;
pub mod cmd;
pub mod config;
pub mod error;
pub mod haproxy;
pub mod health;
pub mod logging;
pub mod manager;
pub mod route;
pub mod router;
pub mod scheduler;
pub mod server;
