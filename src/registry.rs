//! Device registry: the composition root for a rig.
//!
//! Driver factories are registered once at startup; devices are then built
//! from `[devices.<id>]` TOML tables whose `type` field selects the factory:
//!
//! ```toml
//! [devices.laser]
//! type = "prima"
//! address = "eng-7383:50051"
//! calibration_dir = "/data/characterisation/laser/prima_picoquant"
//!
//! [devices.delay]
//! type = "dg645"
//! host = "192.168.88.110"
//! ```

use crate::config::RigConfig;
use anyhow::{anyhow, Context, Result};
use lab_core::driver::{Capability, DeviceComponents, DriverFactory};
use std::collections::HashMap;

/// Registry of driver factories and built devices.
#[derive(Default)]
pub struct DeviceRegistry {
    factories: HashMap<&'static str, Box<dyn DriverFactory>>,
    devices: HashMap<String, DeviceComponents>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver in this workspace registered.
    pub fn with_default_factories() -> Self {
        let mut registry = Self::new();
        registry.register_factory(Box::new(lab_driver_picoquant::PrimaFactory));
        registry.register_factory(Box::new(lab_driver_srs::Dg645Factory));
        registry.register_factory(Box::new(lab_driver_thorlabs_pm::Pm400Factory));
        registry.register_factory(Box::new(lab_driver_quanticam::QuantiCamFactory));
        registry
    }

    /// Register a driver factory. A factory registered later under the same
    /// type replaces the earlier one.
    pub fn register_factory(&mut self, factory: Box<dyn DriverFactory>) {
        let driver_type = factory.driver_type();
        if self
            .factories
            .insert(driver_type, factory)
            .is_some()
        {
            tracing::warn!("Replacing previously registered factory '{}'", driver_type);
        }
    }

    /// Registered driver types, sorted.
    pub fn factory_types(&self) -> Vec<&'static str> {
        let mut types: Vec<&'static str> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    fn factory_for(&self, table: &toml::Value) -> Result<&dyn DriverFactory> {
        let driver_type = table
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("device table is missing the 'type' field"))?;
        self.factories
            .get(driver_type)
            .map(|factory| factory.as_ref())
            .ok_or_else(|| {
                anyhow!(
                    "unknown driver type '{}' (known types: {})",
                    driver_type,
                    self.factory_types().join(", ")
                )
            })
    }

    /// Validate a device table without building it.
    pub fn validate(&self, id: &str, table: &toml::Value) -> Result<()> {
        let factory = self.factory_for(table)?;
        factory
            .validate(table)
            .with_context(|| format!("invalid configuration for device '{}'", id))
    }

    /// Build one device from its config table and store it under `id`.
    pub async fn build_device(&mut self, id: &str, table: toml::Value) -> Result<()> {
        if self.devices.contains_key(id) {
            return Err(anyhow!("device id '{}' is already in use", id));
        }
        let factory = self.factory_for(&table)?;
        factory
            .validate(&table)
            .with_context(|| format!("invalid configuration for device '{}'", id))?;

        tracing::info!("Building device '{}' ({})", id, factory.name());
        let components = factory
            .build(table)
            .await
            .with_context(|| format!("failed to build device '{}'", id))?;
        self.devices.insert(id.to_string(), components);
        Ok(())
    }

    /// Build every device in a rig config.
    ///
    /// All tables are validated before any connection is opened, so a typo
    /// in the last device doesn't leave the rig half-built.
    pub async fn build_from_config(&mut self, config: &RigConfig) -> Result<()> {
        for (id, table) in &config.devices {
            self.validate(id, table)?;
        }
        for (id, table) in &config.devices {
            self.build_device(id, table.clone()).await?;
        }
        Ok(())
    }

    /// Look up a built device.
    pub fn device(&self, id: &str) -> Option<&DeviceComponents> {
        self.devices.get(id)
    }

    /// Ids of all built devices, sorted.
    pub fn device_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.devices.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Capabilities of a built device.
    pub fn capabilities(&self, id: &str) -> Option<Vec<Capability>> {
        self.devices.get(id).map(DeviceComponents::capabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_factories_registered() {
        let registry = DeviceRegistry::with_default_factories();
        assert_eq!(
            registry.factory_types(),
            vec!["dg645", "pm400", "prima", "quanticam"]
        );
    }

    #[test]
    fn test_validate_rejects_unknown_type() {
        let registry = DeviceRegistry::with_default_factories();
        let table = toml::Value::Table(toml::toml! {
            type = "esp300"
        });
        let err = registry.validate("stage", &table).unwrap_err();
        assert!(err.to_string().contains("unknown driver type"));
    }

    #[test]
    fn test_validate_requires_type_field() {
        let registry = DeviceRegistry::with_default_factories();
        let table = toml::Value::Table(toml::toml! {
            host = "192.168.88.110"
        });
        assert!(registry.validate("delay", &table).is_err());
    }

    #[tokio::test]
    async fn test_build_and_duplicate_id() {
        let mut registry = DeviceRegistry::with_default_factories();
        let table = toml::Value::Table(toml::toml! {
            type = "dg645"
            host = "unused"
            mock = true
        });

        registry.build_device("delay", table.clone()).await.unwrap();
        assert_eq!(registry.device_ids(), vec!["delay"]);
        assert!(registry
            .capabilities("delay")
            .unwrap()
            .contains(&Capability::DelayControl));

        let err = registry.build_device("delay", table).await.unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }
}
