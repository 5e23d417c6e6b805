//! QuantiCam 192x128 SPAD array camera driver.
//!
//! The sensor is operated by the lab's QuantiCam numerical-computing
//! project; this crate binds that project's exported interface behind the
//! workspace capability traits.
//!
//! # Backends
//!
//! - **mock** (default feature): deterministic in-process simulator, no
//!   external requirements. Used for tests and offline bring-up.
//! - **julia** (off by default): drives the real sensor through the
//!   QuantiCam project. Requires a local Julia installation with the
//!   package available; see `julia.rs` for the adapter protocol.

#[cfg(feature = "julia")]
mod julia;
mod quanticam;

pub use quanticam::{
    QuantiCamConfig, QuantiCamDriver, QuantiCamFactory, FRAME_HEIGHT, FRAME_WIDTH, STOP_CLK_HZ,
};
