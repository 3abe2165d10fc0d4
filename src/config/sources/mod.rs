//! Concrete [`ConfigSource`](super::ConfigSource) implementations.
//!
//! Provides file-based sources (YAML, JSON, TOML) gated by feature flags
//! and the [`parse_config_str`] helper for format-specific
//! deserialization.

pub mod file_source;

#[cfg(feature = "yaml")]
pub mod yaml;

#[cfg(feature = "json")]
pub mod json;

#[cfg(feature = "toml")]
pub mod toml_source;

use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::config::model::DesiredState;
use crate::config::ConfigSource;
use crate::error::DynconfError;

/// Parse a desired-state string based on file extension.
pub fn parse_config_str(
    ext: &str,
    content: &str,
    path_display: &str,
) -> Result<DesiredState, DynconfError> {
    match ext {
        #[cfg(feature = "yaml")]
        "yaml" | "yml" => serde_yml::from_str(content).map_err(|e| DynconfError::ConfigParse {
            path: path_display.to_string(),
            source: Box::new(e),
        }),

        #[cfg(feature = "json")]
        "json" => serde_json::from_str(content).map_err(|e| DynconfError::ConfigParse {
            path: path_display.to_string(),
            source: Box::new(e),
        }),

        #[cfg(feature = "toml")]
        "toml" => toml::from_str(content).map_err(|e| DynconfError::ConfigParse {
            path: path_display.to_string(),
            source: Box::new(e),
        }),

        other => Err(DynconfError::UnsupportedFormat(other.to_string())),
    }
}

/// Compute a lowercase hex-encoded SHA-256 digest.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Pick the file source matching `path`'s extension.
pub fn source_for_path(path: PathBuf) -> Result<Box<dyn ConfigSource>, DynconfError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_string();
    match ext.as_str() {
        #[cfg(feature = "yaml")]
        "yaml" | "yml" => Ok(Box::new(yaml::new(path))),

        #[cfg(feature = "json")]
        "json" => Ok(Box::new(json::new(path))),

        #[cfg(feature = "toml")]
        "toml" => Ok(Box::new(toml_source::new(path))),

        _ => Err(DynconfError::UnsupportedFormat(ext)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_lowercase_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = parse_config_str("ini", "", "state.ini").unwrap_err();
        assert!(matches!(err, DynconfError::UnsupportedFormat(ref e) if e == "ini"));
        assert!(source_for_path(PathBuf::from("state.ini")).is_err());
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn yaml_unknown_fields_are_rejected() {
        let err = parse_config_str("yaml", "routes: []\nextra: 1\n", "state.yaml").unwrap_err();
        assert!(matches!(err, DynconfError::ConfigParse { .. }));
    }
}
