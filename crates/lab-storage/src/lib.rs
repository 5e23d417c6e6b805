//! `lab-storage`
//!
//! Run manifests and recorded measurement series for instrument sessions.
//!
//! A measurement directory holds one JSON [`RunManifest`] (operator,
//! timestamps, instrument descriptions) plus one CSV file per recorded
//! series (setpoints applied, readings taken), so the data remains
//! self-describing without any external database.

pub mod manifest;
pub mod series;

pub use manifest::{Operator, RunManifest};
pub use series::{read_series, SeriesRecord, SeriesWriter};
