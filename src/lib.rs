//! `lab_instruments`
//!
//! Capability-based drivers for the single-photon lidar bench: the PicoQuant
//! Prima pulsed RGB laser (reached over the lab's Sepia2 gRPC server), the
//! Stanford DG645 delay generator (SCPI over TCP), the Thorlabs PM400 power
//! meter (SCPI over a byte stream) and the QuantiCam SPAD camera (operated
//! through its numerical-computing project).
//!
//! Consumer scripts import this one crate:
//!
//! ```rust,no_run
//! use lab_instruments::{DelayControl, DeviceRegistry, RigConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! lab_instruments::telemetry::init();
//!
//! let config = RigConfig::load("rig.toml")?;
//! let mut registry = DeviceRegistry::with_default_factories();
//! registry.build_from_config(&config).await?;
//!
//! if let Some(delay) = registry.device("delay").and_then(|d| d.delay_control.clone()) {
//!     delay.set_delay(2.4e-4).await?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Every driver offers a `mock` mode so a full rig can be exercised without
//! hardware; see each driver crate for the device-specific API.

pub mod config;
pub mod registry;
pub mod telemetry;

pub use config::RigConfig;
pub use registry::DeviceRegistry;

// Core types consumers need at the call site
pub use lab_core::capabilities::{
    DelayControl, DeviceCategory, EmissionControl, ExposureControl, FrameCapture, Parameterized,
    Readable, Triggerable, WavelengthTunable,
};
pub use lab_core::data::Frame;
pub use lab_core::driver::{Capability, DeviceComponents, DeviceDescription, DriverFactory};
pub use lab_core::error::{LabError, LabResult};

// Driver crates, re-exported for direct use
pub use lab_driver_picoquant as picoquant;
pub use lab_driver_quanticam as quanticam;
pub use lab_driver_srs as srs;
pub use lab_driver_thorlabs_pm as thorlabs_pm;

// Storage for run manifests and recorded series
pub use lab_storage as storage;
