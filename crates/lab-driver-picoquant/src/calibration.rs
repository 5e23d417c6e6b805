//! Calibration tables mapping laser intensity (per-mille) to measured power.
//!
//! The characterisation rig sweeps the Prima's intensity setting per
//! operating mode and wavelength while logging the delivered power on a
//! reference meter, and exports one measurement file per mode. This module
//! loads those files and resolves a desired power (or photon flux) back to
//! the per-mille setpoint by bracketing and linear interpolation.
//!
//! Within one wavelength group the per-mille values are assumed monotonic
//! with measured power; the loader sorts by power but does not enforce
//! monotonicity. Requests outside the calibrated span fail with
//! [`LabError::OutOfCalibrationRange`] rather than extrapolating.

use anyhow::{Context, Result};
use lab_core::error::LabError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Planck's constant (J*s)
const PLANCK: f64 = 6.626_070_15e-34;
/// Speed of light (m/s)
const LIGHT_SPEED: f64 = 3e8;

/// Measurement file exported per active operating mode.
pub const MEASUREMENT_FILES: &[(&str, &str)] = &[
    ("cw", "cw_measurements.csv"),
    ("broad_pulse", "broad_pulse_measurements.csv"),
    ("narrow_pulse", "narrow_pulse_measurements.csv"),
];

/// One calibration measurement, immutable after load.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CalibrationEntry {
    /// Laser line the measurement was taken at
    pub wavelength_nm: u32,
    /// Intensity setting sent to the laser
    pub per_mille: u16,
    /// Power measured on the reference meter
    pub power_w: f64,
}

/// Resolved device setpoint for a requested physical quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Setpoint {
    /// Per-mille intensity to send to the laser
    pub per_mille: u16,
    /// Power the calibration predicts at that setting
    pub power_w: f64,
}

/// Calibration measurements grouped by mode, then wavelength.
///
/// Entries within a group are sorted by measured power.
#[derive(Debug, Clone, Default)]
pub struct CalibrationTable {
    modes: HashMap<String, HashMap<u32, Vec<CalibrationEntry>>>,
}

impl CalibrationTable {
    /// Load the per-mode measurement files from a characterisation directory.
    ///
    /// Every file in [`MEASUREMENT_FILES`] must exist; a missing or
    /// malformed file is an error, matching the characterisation project's
    /// export contract.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Err(LabError::Config(format!(
                "calibration directory {} does not exist",
                dir.display()
            ))
            .into());
        }

        let mut table = Self::default();
        for (mode, filename) in MEASUREMENT_FILES {
            let path = dir.join(filename);
            tracing::debug!("Loading calibration measurements from {}", path.display());
            let mut reader = csv::Reader::from_path(&path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            let mut count = 0usize;
            for row in reader.deserialize() {
                let entry: CalibrationEntry =
                    row.with_context(|| format!("malformed row in {}", path.display()))?;
                table.insert(mode, entry);
                count += 1;
            }
            if count == 0 {
                return Err(LabError::Config(format!(
                    "calibration file {} contains no measurements",
                    path.display()
                ))
                .into());
            }
        }

        table.sort();
        tracing::info!(
            "Loaded calibration for modes: {:?}",
            table.modes.keys().collect::<Vec<_>>()
        );
        Ok(table)
    }

    /// Build a table from in-memory entries (tests, synthetic data).
    pub fn from_entries(mode: &str, entries: impl IntoIterator<Item = CalibrationEntry>) -> Self {
        let mut table = Self::default();
        for entry in entries {
            table.insert(mode, entry);
        }
        table.sort();
        table
    }

    fn insert(&mut self, mode: &str, entry: CalibrationEntry) {
        self.modes
            .entry(mode.to_string())
            .or_default()
            .entry(entry.wavelength_nm)
            .or_default()
            .push(entry);
    }

    fn sort(&mut self) {
        for groups in self.modes.values_mut() {
            for entries in groups.values_mut() {
                entries.sort_by(|a, b| {
                    a.power_w
                        .partial_cmp(&b.power_w)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }
    }

    /// Wavelengths with calibration data for the given mode.
    pub fn wavelengths(&self, mode: &str) -> Vec<u32> {
        let mut wavelengths: Vec<u32> = self
            .modes
            .get(mode)
            .map(|groups| groups.keys().copied().collect())
            .unwrap_or_default();
        wavelengths.sort_unstable();
        wavelengths
    }

    /// Calibrated power span for a mode and wavelength, if any data exists.
    pub fn power_span(&self, mode: &str, wavelength_nm: u32) -> Option<(f64, f64)> {
        let entries = self.modes.get(mode)?.get(&wavelength_nm)?;
        match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => Some((first.power_w, last.power_w)),
            _ => None,
        }
    }

    /// Resolve a desired power to the per-mille setpoint.
    ///
    /// An exact stored power returns that entry's per-mille exactly. A power
    /// strictly between two stored entries interpolates linearly between
    /// their per-mille values (rounded to the nearer step) and reports the
    /// power achievable at the rounded step.
    pub fn resolve_power(
        &self,
        mode: &str,
        wavelength_nm: u32,
        desired_power: f64,
    ) -> Result<Setpoint, LabError> {
        let entries = self
            .modes
            .get(mode)
            .and_then(|groups| groups.get(&wavelength_nm))
            .filter(|entries| !entries.is_empty())
            .ok_or(LabError::NoCalibrationData { wavelength_nm })?;

        // entries is non-empty and sorted by power
        let min = entries[0].power_w;
        let max = entries[entries.len() - 1].power_w;
        if !desired_power.is_finite() || desired_power < min || desired_power > max {
            return Err(LabError::OutOfCalibrationRange {
                requested: desired_power,
                min,
                max,
            });
        }

        let idx = entries.partition_point(|e| e.power_w < desired_power);
        // partition_point returns the first entry with power >= desired;
        // idx < len because desired <= max
        let upper = entries[idx];
        if upper.power_w == desired_power {
            return Ok(Setpoint {
                per_mille: upper.per_mille,
                power_w: upper.power_w,
            });
        }

        // idx > 0 because desired >= min and upper.power > desired
        let lower = entries[idx - 1];
        let t = (desired_power - lower.power_w) / (upper.power_w - lower.power_w);
        let per_mille_exact =
            f64::from(lower.per_mille) + t * (f64::from(upper.per_mille) - f64::from(lower.per_mille));
        let per_mille = per_mille_exact.round().clamp(0.0, 1000.0) as u16;

        // Report the power achievable at the rounded integer step, not the
        // request itself.
        let power_w = if upper.per_mille == lower.per_mille {
            desired_power
        } else {
            let step = (f64::from(per_mille) - f64::from(lower.per_mille))
                / (f64::from(upper.per_mille) - f64::from(lower.per_mille));
            lower.power_w + step * (upper.power_w - lower.power_w)
        };

        tracing::debug!(
            "Resolved {:.3e} W @ {} nm ({}) to per_mille={} ({:.3e} W achievable)",
            desired_power,
            wavelength_nm,
            mode,
            per_mille,
            power_w
        );

        Ok(Setpoint { per_mille, power_w })
    }

    /// Resolve a desired photon flux (photons/s) to the per-mille setpoint.
    pub fn resolve_flux(
        &self,
        mode: &str,
        wavelength_nm: u32,
        desired_flux: f64,
    ) -> Result<Setpoint, LabError> {
        let desired_power = flux_to_power(wavelength_nm, desired_flux);
        tracing::debug!(
            "Desired flux: {:.3e} photons/s, desired power: {:.3e} W",
            desired_flux,
            desired_power
        );
        self.resolve_power(mode, wavelength_nm, desired_power)
    }
}

/// Optical frequency for a laser line.
fn frequency(wavelength_nm: u32) -> f64 {
    LIGHT_SPEED / (f64::from(wavelength_nm) * 1e-9)
}

/// Convert power (W) to photon flux (photons/s).
///
/// Uses the characterisation convention E = h * 2π * ν.
pub fn power_to_flux(wavelength_nm: u32, power_w: f64) -> f64 {
    power_w / (PLANCK * 2.0 * std::f64::consts::PI * frequency(wavelength_nm))
}

/// Convert photon flux (photons/s) to power (W). Exact inverse of
/// [`power_to_flux`].
pub fn flux_to_power(wavelength_nm: u32, flux: f64) -> f64 {
    flux * PLANCK * 2.0 * std::f64::consts::PI * frequency(wavelength_nm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn entry(wavelength_nm: u32, per_mille: u16, power_w: f64) -> CalibrationEntry {
        CalibrationEntry {
            wavelength_nm,
            per_mille,
            power_w,
        }
    }

    fn red_table() -> CalibrationTable {
        CalibrationTable::from_entries(
            "narrow_pulse",
            [
                entry(640, 0, 0.0),
                entry(640, 100, 1.0e-6),
                entry(640, 200, 2.0e-6),
                entry(640, 500, 8.0e-6),
                entry(640, 1000, 2.0e-5),
            ],
        )
    }

    #[test]
    fn test_exact_match_returns_stored_setpoint() {
        let table = red_table();
        let setpoint = table.resolve_power("narrow_pulse", 640, 2.0e-6).unwrap();
        assert_eq!(setpoint.per_mille, 200);
        assert!((setpoint.power_w - 2.0e-6).abs() < 1e-18);
    }

    #[test]
    fn test_interpolation_lands_between_brackets() {
        let table = red_table();
        // Halfway between the 100 and 200 per-mille entries
        let setpoint = table.resolve_power("narrow_pulse", 640, 1.5e-6).unwrap();
        assert!(setpoint.per_mille > 100 && setpoint.per_mille < 200);
        assert_eq!(setpoint.per_mille, 150);
        // Achievable power is consistent with the rounded step
        assert!((setpoint.power_w - 1.5e-6).abs() < 1e-9);
    }

    #[test]
    fn test_interpolation_respects_uneven_spacing() {
        let table = red_table();
        // Between 2e-6 (pm 200) and 8e-6 (pm 500): 5e-6 is halfway in power
        let setpoint = table.resolve_power("narrow_pulse", 640, 5.0e-6).unwrap();
        assert_eq!(setpoint.per_mille, 350);
    }

    #[test]
    fn test_out_of_span_is_rejected_not_extrapolated() {
        let table = red_table();

        let too_high = table.resolve_power("narrow_pulse", 640, 1.0e-3);
        assert!(matches!(
            too_high,
            Err(LabError::OutOfCalibrationRange { .. })
        ));

        let too_low = table.resolve_power("narrow_pulse", 640, -1.0e-9);
        assert!(matches!(
            too_low,
            Err(LabError::OutOfCalibrationRange { .. })
        ));

        let nan = table.resolve_power("narrow_pulse", 640, f64::NAN);
        assert!(matches!(nan, Err(LabError::OutOfCalibrationRange { .. })));
    }

    #[test]
    fn test_unknown_wavelength_and_mode_are_misses() {
        let table = red_table();

        let missing_wavelength = table.resolve_power("narrow_pulse", 532, 1.0e-6);
        assert!(matches!(
            missing_wavelength,
            Err(LabError::NoCalibrationData { wavelength_nm: 532 })
        ));

        let missing_mode = table.resolve_power("cw", 640, 1.0e-6);
        assert!(matches!(
            missing_mode,
            Err(LabError::NoCalibrationData { .. })
        ));
    }

    #[test]
    fn test_flux_conversions_are_inverse() {
        for &wavelength in &[450u32, 515, 640] {
            let power = 3.2e-6;
            let flux = power_to_flux(wavelength, power);
            let back = flux_to_power(wavelength, flux);
            assert!((back - power).abs() / power < 1e-12);
        }
        // Shorter wavelength means more energetic photons, so fewer per watt
        assert!(power_to_flux(450, 1e-6) < power_to_flux(640, 1e-6));
    }

    #[test]
    fn test_resolve_flux_matches_power_path() {
        let table = red_table();
        let flux = power_to_flux(640, 1.5e-6);
        let via_flux = table.resolve_flux("narrow_pulse", 640, flux).unwrap();
        let via_power = table.resolve_power("narrow_pulse", 640, 1.5e-6).unwrap();
        assert_eq!(via_flux.per_mille, via_power.per_mille);
    }

    #[test]
    fn test_power_span_and_wavelengths() {
        let table = red_table();
        assert_eq!(table.wavelengths("narrow_pulse"), vec![640]);
        let (min, max) = table.power_span("narrow_pulse", 640).unwrap();
        assert!((min - 0.0).abs() < 1e-18);
        assert!((max - 2.0e-5).abs() < 1e-18);
        assert!(table.power_span("cw", 640).is_none());
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        for (_, filename) in MEASUREMENT_FILES {
            let mut file = std::fs::File::create(dir.path().join(filename)).unwrap();
            writeln!(file, "wavelength_nm,per_mille,power_w").unwrap();
            writeln!(file, "450,0,0.0").unwrap();
            writeln!(file, "450,500,5.0e-6").unwrap();
            writeln!(file, "640,0,0.0").unwrap();
            writeln!(file, "640,500,6.0e-6").unwrap();
        }

        let table = CalibrationTable::load(dir.path()).unwrap();
        assert_eq!(table.wavelengths("cw"), vec![450, 640]);

        let setpoint = table.resolve_power("cw", 640, 3.0e-6).unwrap();
        assert_eq!(setpoint.per_mille, 250);
    }

    #[test]
    fn test_load_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        // Only one of the three mode files present
        let mut file =
            std::fs::File::create(dir.path().join("cw_measurements.csv")).unwrap();
        writeln!(file, "wavelength_nm,per_mille,power_w").unwrap();
        writeln!(file, "450,0,0.0").unwrap();

        assert!(CalibrationTable::load(dir.path()).is_err());
    }

    #[test]
    fn test_load_rejects_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        for (_, filename) in MEASUREMENT_FILES {
            let mut file = std::fs::File::create(dir.path().join(filename)).unwrap();
            writeln!(file, "wavelength_nm,per_mille,power_w").unwrap();
            writeln!(file, "450,not_a_number,0.0").unwrap();
        }

        assert!(CalibrationTable::load(dir.path()).is_err());
    }

    #[test]
    fn test_load_rejects_missing_directory() {
        assert!(CalibrationTable::load("/nonexistent/calibration/dir").is_err());
    }
}
