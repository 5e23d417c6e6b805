//! `lab-core`
//!
//! Core trait definitions and types for the lab-instruments drivers.
//!
//! This crate provides the building blocks shared by every instrument driver
//! in the workspace: the [`error::LabError`] error type, the atomic
//! capability traits in [`capabilities`], the [`driver::DriverFactory`]
//! plugin API, and the observable parameter primitives in [`observable`] and
//! [`parameter`].
//!
//! A driver owns exactly one connection to its device: the transport is
//! opened during factory `build()`, guarded by a `tokio::sync::Mutex`, and
//! released on explicit disconnect or drop. All calls are single awaited
//! round-trips; there is no internal scheduling, retrying, or recovery.

pub mod capabilities;
pub mod data;
pub mod driver;
pub mod error;
pub mod observable;
pub mod parameter;

// Re-export commonly used types
pub use anyhow::{anyhow, Result};
pub use capabilities::{
    DelayControl, DeviceCategory, EmissionControl, ExposureControl, FrameCapture, Parameterized,
    Readable, Triggerable, WavelengthTunable,
};
pub use data::Frame;
pub use driver::{Capability, DeviceComponents, DeviceDescription, DriverFactory};
pub use error::{LabError, LabResult};
pub use observable::{Observable, ObservableMetadata, ParameterSet};
pub use parameter::Parameter;
