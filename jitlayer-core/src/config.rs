//! Layer and engine configuration
//!
//! Configuration is plain serde data with defaults for every field, so a
//! JSON file only needs to mention what it changes:
//!
//! ```json
//! { "engine": { "opt_level": "none", "lazy_materialization": false } }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::DataLayout;
use crate::error::DataLayoutError;

/// Code generator optimization level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    /// Value of the code generator's `opt_level` setting.
    pub fn as_setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Settings for [`JitEngine`](crate::engine::JitEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub opt_level: OptLevel,
    /// Defer relocation and undefined-symbol resolution of a module set
    /// until a lookup first needs one of its symbols.
    pub lazy_materialization: bool,
    /// Run the IR verifier on every function.
    pub verify_ir: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::default(),
            lazy_materialization: true,
            verify_ir: true,
        }
    }
}

/// Top-level configuration for a compile layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LayerConfig {
    pub engine: EngineConfig,
    /// Data layout string; the host layout when absent.
    pub data_layout: Option<String>,
}

impl LayerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse layer configuration")
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;
        Self::from_json_str(&text).with_context(|| format!("Invalid configuration in {:?}", path))
    }

    pub fn data_layout(&self) -> Result<DataLayout, DataLayoutError> {
        match &self.data_layout {
            Some(repr) => DataLayout::parse(repr),
            None => Ok(DataLayout::host()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ManglingMode;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = LayerConfig::default();
        assert_eq!(config.engine.opt_level, OptLevel::Speed);
        assert!(config.engine.lazy_materialization);
        assert!(config.engine.verify_ir);
        assert_eq!(config.data_layout().unwrap(), DataLayout::host());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            LayerConfig::from_json_str(r#"{ "engine": { "opt_level": "speed_and_size" } }"#).unwrap();
        assert_eq!(config.engine.opt_level, OptLevel::SpeedAndSize);
        assert!(config.engine.lazy_materialization);
        assert!(config.data_layout.is_none());
    }

    #[test]
    fn test_data_layout_override() {
        let config = LayerConfig::from_json_str(r#"{ "data_layout": "e-m:o-i64:64" }"#).unwrap();
        assert_eq!(config.data_layout().unwrap().mangling(), ManglingMode::MachO);

        let bad = LayerConfig::from_json_str(r#"{ "data_layout": "e-m:?" }"#).unwrap();
        assert!(bad.data_layout().is_err());
    }

    #[test]
    fn test_invalid_json() {
        assert!(LayerConfig::from_json_str(r#"{ "engine": { "opt_level": "fastest" } }"#).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "engine": {{ "lazy_materialization": false, "opt_level": "none" }} }}"#)
            .unwrap();

        let config = LayerConfig::load(file.path()).unwrap();
        assert!(!config.engine.lazy_materialization);
        assert_eq!(config.engine.opt_level.as_setting(), "none");
    }

    #[test]
    fn test_load_missing_file() {
        let err = LayerConfig::load("/nonexistent/jitlayer.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read configuration"));
    }
}
