//! Rig configuration.
//!
//! A rig file is a TOML document with one `[devices.<id>]` table per
//! instrument plus session-level settings. Files load through figment so
//! `LAB_`-prefixed environment variables can override individual keys
//! (e.g. `LAB_STORAGE_DIR=/tmp/run1`).

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level rig configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RigConfig {
    /// Directory for run manifests and recorded series
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    /// Device tables keyed by device id; each carries a `type` field
    /// selecting the driver factory
    #[serde(default)]
    pub devices: BTreeMap<String, toml::Value>,
}

impl RigConfig {
    /// Load a rig file, applying `LAB_` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("LAB_").split("__"))
            .extract()
            .with_context(|| format!("failed to load rig config from {}", path.display()))
    }

    /// Parse a rig config from a TOML string (tests, embedded defaults).
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse rig config")
    }

    /// The `type` field of a device table, if present.
    pub fn device_type(table: &toml::Value) -> Option<&str> {
        table.get("type").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RIG: &str = r#"
storage_dir = "/data/runs"

[devices.delay]
type = "dg645"
host = "192.168.88.110"
trigger_level = 1.3

[devices.power_meter]
type = "pm400"
path = "/dev/usbtmc0"
"#;

    #[test]
    fn test_parse_rig_string() {
        let config = RigConfig::from_toml_str(RIG).unwrap();
        assert_eq!(config.storage_dir.as_deref(), Some(Path::new("/data/runs")));
        assert_eq!(config.devices.len(), 2);
        assert_eq!(
            RigConfig::device_type(&config.devices["delay"]),
            Some("dg645")
        );
        assert_eq!(
            config.devices["power_meter"]["path"].as_str(),
            Some("/dev/usbtmc0")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "{}", RIG).unwrap();

        let config = RigConfig::load(&path).unwrap();
        assert_eq!(config.devices.len(), 2);
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        // figment's Toml provider treats a missing file as an empty source
        let config = RigConfig::load("/nonexistent/rig.toml").unwrap();
        assert!(config.devices.is_empty());
        assert!(config.storage_dir.is_none());
    }
}
