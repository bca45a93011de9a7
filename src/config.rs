//! Runtime configuration types.

use std::path::Path;

use serde::Deserialize;

use crate::error::VmError;

/// Runtime configuration for the VM.
///
/// Can be read from a TOML file; missing keys keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Deepest managed call nesting allowed before failing with a stack overflow
    pub max_call_depth: usize,
    /// Whether a minor collection runs when a method returns (default: true)
    pub gc_enabled: bool,
    pub gc_stats: bool,
    /// Verify every method body before it runs
    pub verify_bodies: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 256,
            gc_enabled: true,
            gc_stats: false,
            verify_bodies: false,
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, VmError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, VmError> {
        toml::from_str(text).map_err(|e| VmError::Image(format!("invalid config: {}", e)))
    }
}
