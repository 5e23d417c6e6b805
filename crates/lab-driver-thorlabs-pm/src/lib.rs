//! Thorlabs PM400 optical power meter driver.
//!
//! The PM400 measures the optical power delivered to the bench; readings are
//! corrected for the sensor's responsivity at a configurable wavelength.
//! Communication is SCPI ASCII over the instrument's USBTMC byte stream (or a
//! serial bridge).
//!
//! # Capabilities
//!
//! - `Readable` - power in watts (`MEAS:POW?`)
//! - `WavelengthTunable` - responsivity correction wavelength
//! - `Parameterized` - wavelength as an observable parameter
//!
//! A deterministic in-process simulation is available with `mock = true` in
//! the configuration.

mod pm400;

pub use pm400::{Pm400Config, Pm400Driver, Pm400Factory, SpectrumPoint};
