//! `relay.toml` configuration for keyrelay.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Discovery endpoint (`host:port`). The dispatcher asks it for the
    /// worker list at startup.
    #[serde(default = "RelayConfig::default_discovery")]
    pub discovery: String,

    /// Static worker list (`host:port` entries). Used by `discoveryd` as its
    /// served list, and by `bench` when it should target real workers
    /// instead of an in-process one.
    #[serde(default)]
    pub workers: Vec<String>,
}

impl RelayConfig {
    fn default_discovery() -> String {
        "127.0.0.1:9470".into()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// Returns a default config matching a single-host test setup.
    pub fn default_example() -> Self {
        Self {
            discovery: Self::default_discovery(),
            workers: vec!["127.0.0.1:10000".into(), "127.0.0.1:10001".into()],
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            discovery: Self::default_discovery(),
            workers: Vec::new(),
        }
    }
}
