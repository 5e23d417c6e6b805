//! Session run manifests.
//!
//! A [`RunManifest`] records who ran the session, when it started and
//! finished, and the static description of every instrument involved. It is
//! written as pretty JSON next to the recorded series so a measurement
//! directory stays self-describing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lab_core::driver::DeviceDescription;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// The person responsible for a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operator {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Session-level record of a measurement run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<Operator>,

    /// Session start (UTC)
    pub started: DateTime<Utc>,

    /// Session end (UTC), set by [`RunManifest::finish`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,

    /// Instrument descriptions keyed by device id
    #[serde(default)]
    pub instruments: BTreeMap<String, DeviceDescription>,
}

impl RunManifest {
    /// Start a new manifest, stamped now.
    pub fn new() -> Self {
        Self {
            operator: None,
            started: Utc::now(),
            finished: None,
            instruments: BTreeMap::new(),
        }
    }

    /// Attach the operator record.
    pub fn with_operator(mut self, operator: Operator) -> Self {
        self.operator = Some(operator);
        self
    }

    /// Record an instrument's static description under a device id.
    pub fn add_instrument(&mut self, id: impl Into<String>, description: DeviceDescription) {
        self.instruments.insert(id.into(), description);
    }

    /// Stamp the session end.
    pub fn finish(&mut self) {
        self.finished = Some(Utc::now());
    }

    /// Write the manifest as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("failed to serialize manifest")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write manifest to {}", path.display()))?;
        tracing::info!("Wrote run manifest to {}", path.display());
        Ok(())
    }

    /// Load a manifest written by [`RunManifest::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest from {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("malformed manifest in {}", path.display()))
    }
}

impl Default for RunManifest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn laser_description() -> DeviceDescription {
        DeviceDescription {
            name: "Prima PicoQuant RGB Laser".into(),
            kind: "Picosecond pulsed laser".into(),
            manufacturer: "PicoQuant GmbH".into(),
            datasheet: None,
            extra: serde_json::json!({ "wavelengths_nm": [450, 515, 640] }),
        }
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");

        let mut manifest = RunManifest::new().with_operator(Operator {
            name: "C. Bourceanu".into(),
            role: Some("PhD Student".into()),
            affiliation: None,
            email: None,
        });
        manifest.add_instrument("laser", laser_description());
        manifest.finish();
        manifest.save(&path).unwrap();

        let loaded = RunManifest::load(&path).unwrap();
        assert_eq!(loaded.operator.as_ref().unwrap().name, "C. Bourceanu");
        assert!(loaded.finished.is_some());
        assert_eq!(
            loaded.instruments["laser"].manufacturer,
            "PicoQuant GmbH"
        );
        assert_eq!(loaded.instruments["laser"].extra["wavelengths_nm"][1], 515);
    }

    #[test]
    fn test_load_rejects_malformed_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(RunManifest::load(&path).is_err());
    }
}
