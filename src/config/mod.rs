//! Desired-state loading, validation and change detection.
//!
//! Defines the [`ConfigSource`] trait for pluggable desired-state
//! backends and the [`ConfigVersion`] enum used to notice changes.
//! Submodules provide the data model, validation logic, and the file
//! sources.

pub mod model;
pub mod sources;
pub mod validation;

use async_trait::async_trait;

use crate::error::DynconfError;
use model::DesiredState;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigVersion {
    Hash(String),
}

// async_trait is required here because ConfigSource is used as Box<dyn ConfigSource>
// and native async fn in traits (Rust 1.75+) does not support dyn dispatch.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn load(&self) -> Result<(DesiredState, ConfigVersion), DynconfError>;
    async fn has_changed(&self, current: &ConfigVersion) -> Result<bool, DynconfError>;
}
