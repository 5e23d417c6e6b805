//! PicoQuant Prima pulsed RGB laser driver.
//!
//! The Prima emits picosecond pulses on three lines (450/515/640 nm) and is
//! controlled through the lab's Sepia2 gRPC server. Its only power control
//! is a per-mille intensity setting, so requested powers and photon fluxes
//! are resolved through characterisation tables measured per operating mode
//! and line (see [`calibration`]).
//!
//! # Capabilities
//!
//! - `WavelengthTunable` - line selection (discrete: 450, 515, 640 nm)
//! - `EmissionControl` - operating mode Off vs. last pulsed mode
//! - `Parameterized` - active line as an observable parameter
//!
//! # Mock Mode
//!
//! With `mock = true` in the configuration the driver runs against an
//! in-memory service, for tests and offline bring-up.

pub mod api;
pub mod calibration;
mod prima;

pub use api::{MockSepia2, Sepia2Client, Sepia2Ops};
pub use calibration::{flux_to_power, power_to_flux, CalibrationEntry, CalibrationTable, Setpoint};
pub use prima::{PrimaColor, PrimaConfig, PrimaDriver, PrimaFactory, PrimaMode};
