//! Desired-state file source with SHA256 change detection.
//!
//! [`FileSource`] implements [`ConfigSource`] for any file format by
//! taking a deserialization function at construction time. The file is
//! read with Tokio, validated, and hashed so the poll loop can skip
//! unchanged content.

use std::path::PathBuf;

use async_trait::async_trait;

use super::sha256_hex;
use crate::config::model::DesiredState;
use crate::config::validation::validate;
use crate::config::{ConfigSource, ConfigVersion};
use crate::error::DynconfError;

pub struct FileSource {
    path: PathBuf,
    name: &'static str,
    deserialize: fn(&str) -> Result<DesiredState, Box<dyn std::error::Error + Send + Sync>>,
}

impl FileSource {
    #[must_use]
    pub fn new(
        path: PathBuf,
        name: &'static str,
        deserialize: fn(&str) -> Result<DesiredState, Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            path,
            name,
            deserialize,
        }
    }

    async fn read_content(&self) -> Result<String, DynconfError> {
        tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DynconfError::ConfigFileNotFound {
                    path: self.path.clone(),
                }
            } else {
                DynconfError::Io(e)
            }
        })
    }
}

#[async_trait]
impl ConfigSource for FileSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn load(&self) -> Result<(DesiredState, ConfigVersion), DynconfError> {
        let content = self.read_content().await?;

        let state = (self.deserialize)(&content).map_err(|e| DynconfError::ConfigParse {
            path: self.path.display().to_string(),
            source: e,
        })?;

        if let Err(errors) = validate(&state) {
            return Err(DynconfError::ConfigValidation { errors });
        }

        let hash = sha256_hex(content.as_bytes());
        tracing::debug!(path = %self.path.display(), routes = state.routes.len(), version = %hash, "desired state loaded");
        Ok((state, ConfigVersion::Hash(hash)))
    }

    async fn has_changed(&self, current: &ConfigVersion) -> Result<bool, DynconfError> {
        let content = self.read_content().await?;
        let hash = sha256_hex(content.as_bytes());
        Ok(*current != ConfigVersion::Hash(hash))
    }
}
