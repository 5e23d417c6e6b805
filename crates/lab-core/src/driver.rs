//! Driver factory and component types.
//!
//! Drivers implement [`DriverFactory`] and are registered with a device
//! registry at startup. The factory validates a TOML config table, opens the
//! device connection, and returns a [`DeviceComponents`] bag holding the
//! capability trait objects the driver implements:
//!
//! ```text
//! Composition root
//!   registry.register_factory(Box::new(PrimaFactory));
//!   registry.register_factory(Box::new(Dg645Factory));
//!           │
//!           ▼
//! DriverFactory::build(config)
//!   parses the [devices.<id>] table, connects, returns capabilities
//! ```
//!
//! Storing each capability separately avoids runtime downcasting and lets a
//! driver implement only what its hardware supports.

use crate::capabilities::{
    DelayControl, DeviceCategory, EmissionControl, ExposureControl, FrameCapture, Parameterized,
    Readable, Triggerable, WavelengthTunable,
};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags for device introspection.
///
/// Mirrors the capability traits as an enum for listing and matching without
/// checking each trait object individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Can read scalar values ([`Readable`])
    Readable,
    /// Has wavelength tuning ([`WavelengthTunable`])
    WavelengthTunable,
    /// Has emission on/off control ([`EmissionControl`])
    EmissionControl,
    /// Can be armed and triggered ([`Triggerable`])
    Triggerable,
    /// Has exposure/integration time control ([`ExposureControl`])
    ExposureControl,
    /// Has programmable output delay ([`DelayControl`])
    DelayControl,
    /// Captures image frames ([`FrameCapture`])
    FrameCapture,
    /// Has observable parameters ([`Parameterized`])
    Parameterized,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Readable => "Readable",
            Self::WavelengthTunable => "Wavelength Tunable",
            Self::EmissionControl => "Emission Control",
            Self::Triggerable => "Triggerable",
            Self::ExposureControl => "Exposure Control",
            Self::DelayControl => "Delay Control",
            Self::FrameCapture => "Frame Capture",
            Self::Parameterized => "Parameterized",
        }
    }
}

// =============================================================================
// Device Description
// =============================================================================

/// Static identity of a device, recorded into run manifests.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceDescription {
    /// Model name (e.g., "Prima PicoQuant RGB Laser")
    pub name: String,
    /// Device kind (e.g., "Picosecond pulsed laser")
    pub kind: String,
    /// Manufacturer
    pub manufacturer: String,
    /// Datasheet URL, if known
    pub datasheet: Option<String>,
    /// Driver-specific extras (firmware version, serial number, ...)
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

// =============================================================================
// Device Components (Capability Bag)
// =============================================================================

/// Container for the capability trait objects a driver returns.
#[derive(Default)]
pub struct DeviceComponents {
    /// Device category for manifest grouping
    pub category: Option<DeviceCategory>,

    /// Static identity for run manifests
    pub description: Option<DeviceDescription>,

    /// Readable implementation (scalar measurements)
    pub readable: Option<Arc<dyn Readable>>,

    /// WavelengthTunable implementation
    pub wavelength_tunable: Option<Arc<dyn WavelengthTunable>>,

    /// EmissionControl implementation (light sources)
    pub emission_control: Option<Arc<dyn EmissionControl>>,

    /// Triggerable implementation (arm/trigger)
    pub triggerable: Option<Arc<dyn Triggerable>>,

    /// ExposureControl implementation
    pub exposure_control: Option<Arc<dyn ExposureControl>>,

    /// DelayControl implementation (delay generators)
    pub delay_control: Option<Arc<dyn DelayControl>>,

    /// FrameCapture implementation (cameras)
    pub frame_capture: Option<Arc<dyn FrameCapture>>,

    /// Parameterized implementation (parameter registry)
    pub parameterized: Option<Arc<dyn Parameterized>>,
}

impl DeviceComponents {
    /// Create a new empty component bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// List the capabilities this device supports.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();

        if self.readable.is_some() {
            caps.push(Capability::Readable);
        }
        if self.wavelength_tunable.is_some() {
            caps.push(Capability::WavelengthTunable);
        }
        if self.emission_control.is_some() {
            caps.push(Capability::EmissionControl);
        }
        if self.triggerable.is_some() {
            caps.push(Capability::Triggerable);
        }
        if self.exposure_control.is_some() {
            caps.push(Capability::ExposureControl);
        }
        if self.delay_control.is_some() {
            caps.push(Capability::DelayControl);
        }
        if self.frame_capture.is_some() {
            caps.push(Capability::FrameCapture);
        }
        if self.parameterized.is_some() {
            caps.push(Capability::Parameterized);
        }

        caps
    }

    // Builder methods

    /// Set device category
    pub fn with_category(mut self, category: DeviceCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Set device description
    pub fn with_description(mut self, description: DeviceDescription) -> Self {
        self.description = Some(description);
        self
    }

    /// Set Readable implementation
    pub fn with_readable(mut self, r: Arc<dyn Readable>) -> Self {
        self.readable = Some(r);
        self
    }

    /// Set WavelengthTunable implementation
    pub fn with_wavelength_tunable(mut self, w: Arc<dyn WavelengthTunable>) -> Self {
        self.wavelength_tunable = Some(w);
        self
    }

    /// Set EmissionControl implementation
    pub fn with_emission_control(mut self, e: Arc<dyn EmissionControl>) -> Self {
        self.emission_control = Some(e);
        self
    }

    /// Set Triggerable implementation
    pub fn with_triggerable(mut self, t: Arc<dyn Triggerable>) -> Self {
        self.triggerable = Some(t);
        self
    }

    /// Set ExposureControl implementation
    pub fn with_exposure_control(mut self, e: Arc<dyn ExposureControl>) -> Self {
        self.exposure_control = Some(e);
        self
    }

    /// Set DelayControl implementation
    pub fn with_delay_control(mut self, d: Arc<dyn DelayControl>) -> Self {
        self.delay_control = Some(d);
        self
    }

    /// Set FrameCapture implementation
    pub fn with_frame_capture(mut self, f: Arc<dyn FrameCapture>) -> Self {
        self.frame_capture = Some(f);
        self
    }

    /// Set Parameterized implementation
    pub fn with_parameterized(mut self, p: Arc<dyn Parameterized>) -> Self {
        self.parameterized = Some(p);
        self
    }
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Trait for driver factories that create device instances.
///
/// Factories are registered once at startup and live for the program's
/// lifetime (`Send + Sync + 'static`). `validate()` gives early feedback on a
/// config table before `build()` opens hardware connections.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name used in the TOML config `type` field.
    ///
    /// ```toml
    /// [devices.laser]
    /// type = "prima"   # matches driver_type() returning "prima"
    /// ```
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// Capabilities this driver type provides.
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Validate configuration without instantiating.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Async instantiation of the driver.
    ///
    /// Parses the configuration, opens the device connection, optionally
    /// verifies the device identity, and returns the capability bag.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_name() {
        assert_eq!(Capability::DelayControl.name(), "Delay Control");
        assert_eq!(Capability::FrameCapture.name(), "Frame Capture");
    }

    #[test]
    fn test_capability_serde() {
        let cap = Capability::WavelengthTunable;
        let json = serde_json::to_string(&cap).unwrap();
        assert_eq!(json, "\"wavelength_tunable\"");

        let cap: Capability = serde_json::from_str("\"delay_control\"").unwrap();
        assert_eq!(cap, Capability::DelayControl);
    }

    #[test]
    fn test_device_components_empty() {
        let empty = DeviceComponents::new();
        assert!(empty.capabilities().is_empty());
    }

    #[test]
    fn test_device_components_builder() {
        let components = DeviceComponents::new()
            .with_category(DeviceCategory::Laser)
            .with_description(DeviceDescription {
                name: "Prima PicoQuant RGB Laser".into(),
                kind: "Picosecond pulsed laser".into(),
                manufacturer: "PicoQuant GmbH".into(),
                ..Default::default()
            });

        assert_eq!(components.category, Some(DeviceCategory::Laser));
        assert_eq!(
            components.description.as_ref().map(|d| d.name.as_str()),
            Some("Prima PicoQuant RGB Laser")
        );
    }
}
