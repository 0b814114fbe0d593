use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::presets;
use crate::config::types::{Category, ProbeError, Result};
use crate::probe::ProbeSpec;

/// File consulted by [`ProbeConfig::load_default`]
pub const DEFAULT_CONFIG_FILE: &str = "trustprobe.json";

/// Probe tables per category, in run order
///
/// A missing category key means "no probes" for that category, not "use the
/// built-in table".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub sandbox: Vec<ProbeSpec>,
    #[serde(default)]
    pub virtual_machine: Vec<ProbeSpec>,
    #[serde(default)]
    pub auto_analysis: Vec<ProbeSpec>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        presets::builtin_config()
    }
}

impl ProbeConfig {
    /// A configuration with no probes in any category
    pub fn empty() -> Self {
        Self {
            sandbox: Vec::new(),
            virtual_machine: Vec::new(),
            auto_analysis: Vec::new(),
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ProbeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&content)?;
        info!("Loaded probe configuration from {}", path.display());
        Ok(config)
    }

    /// `./trustprobe.json` when present, the built-in tables otherwise
    pub fn load_default() -> Result<Self> {
        let path = Path::new(DEFAULT_CONFIG_FILE);
        if path.exists() {
            Self::load_from_file(path)
        } else {
            debug!("{} not found, using built-in probe tables", DEFAULT_CONFIG_FILE);
            Ok(Self::default())
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| ProbeError::Config(format!("Failed to parse probe config: {e}")))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ProbeError::Config(format!("Failed to serialize probe config: {e}")))
    }

    pub fn specs(&self, category: Category) -> &[ProbeSpec] {
        match category {
            Category::Sandbox => &self.sandbox,
            Category::VirtualMachine => &self.virtual_machine,
            Category::AutoAnalysis => &self.auto_analysis,
        }
    }
}
