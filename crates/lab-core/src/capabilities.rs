//! Atomic hardware capabilities.
//!
//! Instead of one monolithic `Instrument` trait, devices implement the small
//! capabilities they actually support:
//!
//! - the power meter implements `Readable + WavelengthTunable`
//! - the pulsed laser implements `WavelengthTunable + EmissionControl`
//! - the delay generator implements `DelayControl + Triggerable`
//! - the camera implements `Triggerable + ExposureControl + FrameCapture`
//!
//! Each capability trait is async (`#[async_trait]`), thread-safe
//! (`Send + Sync`), takes `&self` with interior mutability for state, and
//! returns `anyhow::Result` so callers get the full error chain.

use crate::data::Frame;
use crate::observable::ParameterSet;
use anyhow::Result;
use async_trait::async_trait;

// =============================================================================
// Device Category
// =============================================================================

/// Device category for classification and manifest grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceCategory {
    /// Cameras and imaging detectors
    Camera,
    /// Lasers and light sources
    Laser,
    /// Power meters and energy sensors
    PowerMeter,
    /// Delay and pulse generators
    DelayGenerator,
    /// Devices that don't fit other categories
    #[default]
    Other,
}

impl DeviceCategory {
    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Camera => "Cameras",
            Self::Laser => "Lasers",
            Self::PowerMeter => "Power Meters",
            Self::DelayGenerator => "Delay Generators",
            Self::Other => "Other",
        }
    }
}

// =============================================================================
// Capability Traits
// =============================================================================

/// Capability: Scalar Readout
///
/// Devices that produce single scalar values (power meters, photodiodes).
///
/// # Contract
/// - `read()` performs one measurement round-trip and returns the value
/// - Units are device-specific (document in implementation)
#[async_trait]
pub trait Readable: Send + Sync {
    /// Read the current value.
    ///
    /// Units depend on the device type (watts, volts, photons/s).
    async fn read(&self) -> Result<f64>;
}

/// Capability: Wavelength Tuning
///
/// Devices with a tunable or calibration wavelength (lasers, power meter
/// correction wavelength).
///
/// # Contract
/// - Wavelength is in nanometers
/// - Implementations validate the wavelength against the device range
/// - Devices with discrete emission lines reject wavelengths that do not
///   match a supported line
#[async_trait]
pub trait WavelengthTunable: Send + Sync {
    /// Set the active wavelength in nanometers.
    async fn set_wavelength(&self, wavelength_nm: f64) -> Result<()>;

    /// Get the active wavelength in nanometers.
    async fn get_wavelength(&self) -> Result<f64>;

    /// Valid wavelength span as `(min_nm, max_nm)`.
    fn wavelength_range(&self) -> (f64, f64);
}

/// Capability: Emission Control
///
/// Light sources that can be switched on and off.
///
/// CAUTION: software emission control is not a safety interlock.
#[async_trait]
pub trait EmissionControl: Send + Sync {
    /// Enable emission (turn the source on).
    async fn enable_emission(&self) -> Result<()>;

    /// Disable emission (turn the source off).
    async fn disable_emission(&self) -> Result<()>;

    /// Query emission state.
    async fn is_emission_enabled(&self) -> Result<bool>;
}

/// Capability: External Triggering
///
/// Devices that can be armed and fired (delay generators, cameras).
///
/// # Contract
/// - `arm()` prepares the device for a trigger
/// - `trigger()` fires a software trigger; some devices accept it without a
///   prior `arm()`
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Arm the device for a trigger.
    async fn arm(&self) -> Result<()>;

    /// Fire a software trigger.
    async fn trigger(&self) -> Result<()>;
}

/// Capability: Exposure Time Control
///
/// Devices with a configurable integration time.
///
/// # Contract
/// - Exposure is in milliseconds
/// - Setting exposure does not start an acquisition
#[async_trait]
pub trait ExposureControl: Send + Sync {
    /// Set exposure/integration time in milliseconds.
    async fn set_exposure_ms(&self, ms: f64) -> Result<()>;

    /// Get the current exposure setting in milliseconds.
    async fn get_exposure_ms(&self) -> Result<f64>;
}

/// Capability: Delay Output Control
///
/// Pulse/delay generators with a programmable output delay relative to the
/// trigger.
///
/// # Contract
/// - Delays are in seconds (devices accept picosecond resolution)
/// - `set_delay` reprograms the active output channel pair
#[async_trait]
pub trait DelayControl: Send + Sync {
    /// Program the output delay in seconds.
    async fn set_delay(&self, seconds: f64) -> Result<()>;

    /// Read back the programmed delay in seconds.
    async fn get_delay(&self) -> Result<f64>;
}

/// Capability: Single-Frame Capture
///
/// Imaging devices that return one frame per request.
///
/// # Contract
/// - `snap()` blocks for the configured exposure and returns the frame
/// - `resolution()` is the fixed sensor size in pixels
#[async_trait]
pub trait FrameCapture: Send + Sync {
    /// Capture a single frame.
    async fn snap(&self) -> Result<Frame>;

    /// Sensor resolution as `(width, height)` in pixels.
    fn resolution(&self) -> (u32, u32);
}

/// Capability: Parameter Registry Access
///
/// Devices that expose their parameters for introspection, so generic code
/// (manifests, presets) can list and snapshot device state.
pub trait Parameterized: Send + Sync {
    /// Get the device's parameter registry.
    fn parameters(&self) -> &ParameterSet;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedMeter(f64);

    #[async_trait]
    impl Readable for FixedMeter {
        async fn read(&self) -> Result<f64> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_readable_trait_object() {
        let meter: Box<dyn Readable> = Box::new(FixedMeter(0.123));
        let reading = meter.read().await.unwrap();
        assert!((reading - 0.123).abs() < f64::EPSILON);
    }

    #[test]
    fn test_category_labels() {
        assert_eq!(DeviceCategory::DelayGenerator.label(), "Delay Generators");
        assert_eq!(DeviceCategory::default().label(), "Other");
    }
}
