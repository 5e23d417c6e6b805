//! Stanford Research Systems DG645 Digital Delay Generator Driver
//!
//! The DG645 gates the camera and laser timing on the bench: the laser sync
//! output triggers the generator, and the A/B outputs open the acquisition
//! window with a programmable delay.
//!
//! # Communication
//!
//! SCPI-style ASCII over a bare TCP socket (default port 5025). The
//! instrument queues errors instead of failing commands in-band, so the
//! driver drains `LERR?` after every configuration write.
//!
//! # Capabilities
//!
//! - `DelayControl` - program/read the A-output delay relative to T0
//! - `Triggerable` - single-shot software triggering
//! - `Parameterized` - trigger level and delay as observable parameters
//!
//! # Mock Mode
//!
//! For testing without hardware, set `mock = true` in the configuration.

mod dg645;
mod scpi;

pub use dg645::{DelayChannel, Dg645Config, Dg645Driver, Dg645Factory, ErrorCode, TriggerSource};
pub use scpi::{MockScpiClient, ScpiClient, DEFAULT_PORT};
