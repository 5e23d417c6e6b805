//! PicoQuant Prima pulsed RGB laser driver.
//!
//! The Prima is reached through the lab's Sepia2 gRPC server rather than a
//! local USB stack. The laser emits on three discrete lines (450/515/640 nm)
//! and its only power control is a per-mille intensity setting, so desired
//! powers and photon fluxes are resolved through the characterisation tables
//! in [`crate::calibration`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use lab_driver_picoquant::PrimaFactory;
//! use lab_core::driver::DriverFactory;
//!
//! registry.register_factory(Box::new(PrimaFactory));
//!
//! let config = toml::toml! {
//!     address = "eng-7383:50051"
//!     calibration_dir = "/data/characterisation/laser/prima_picoquant"
//! };
//! let components = factory.build(config.into()).await?;
//! ```

use crate::api::{pb, GrpcSepia2, MockSepia2, Sepia2Ops};
use crate::calibration::{power_to_flux, CalibrationTable, Setpoint};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::capabilities::{
    DeviceCategory, EmissionControl, Parameterized, WavelengthTunable,
};
use lab_core::driver::{Capability, DeviceComponents, DeviceDescription, DriverFactory};
use lab_core::error::LabError;
use lab_core::observable::ParameterSet;
use lab_core::parameter::Parameter;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Trigger source index for external rising edge.
const EXTERNAL_RISING_TRIGGER_IDX: u32 = 4;
/// External trigger threshold applied at init (mV).
const TRIGGER_LEVEL_MV: i32 = 1000;

// =============================================================================
// Operating mode and laser lines
// =============================================================================

/// Operating modes of the Prima head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimaMode {
    Off,
    Cw,
    BroadPulse,
    NarrowPulse,
}

impl PrimaMode {
    /// Mode name as used by the characterisation files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Cw => "cw",
            Self::BroadPulse => "broad_pulse",
            Self::NarrowPulse => "narrow_pulse",
        }
    }

    /// Wire representation for the Sepia2 service.
    pub fn to_pb(self) -> pb::OperationMode {
        match self {
            Self::Off => pb::OperationMode::Off,
            Self::Cw => pb::OperationMode::Cw,
            Self::BroadPulse => pb::OperationMode::BroadPulse,
            Self::NarrowPulse => pb::OperationMode::NarrowPulse,
        }
    }
}

impl std::str::FromStr for PrimaMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(Self::Off),
            "cw" => Ok(Self::Cw),
            "broad_pulse" => Ok(Self::BroadPulse),
            "narrow_pulse" => Ok(Self::NarrowPulse),
            other => Err(anyhow!("invalid Prima mode: {}", other)),
        }
    }
}

/// The Prima's three emission lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimaColor {
    Blue,
    Green,
    Red,
}

impl PrimaColor {
    /// All lines, in wavelength-index order.
    pub const ALL: [Self; 3] = [Self::Blue, Self::Green, Self::Red];

    /// Wavelength index used by the Sepia2 service.
    pub fn index(&self) -> u32 {
        match self {
            Self::Blue => 0,
            Self::Green => 1,
            Self::Red => 2,
        }
    }

    /// Decode a wavelength index.
    pub fn from_index(idx: u32) -> Result<Self> {
        match idx {
            0 => Ok(Self::Blue),
            1 => Ok(Self::Green),
            2 => Ok(Self::Red),
            other => Err(anyhow!("invalid Prima wavelength index: {}", other)),
        }
    }

    /// Emission wavelength in nanometers.
    pub fn wavelength_nm(&self) -> u32 {
        match self {
            Self::Blue => 450,
            Self::Green => 515,
            Self::Red => 640,
        }
    }

    /// Match a wavelength to one of the lines (within 1 nm).
    pub fn from_nm(wavelength_nm: f64) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|color| (wavelength_nm - f64::from(color.wavelength_nm())).abs() <= 1.0)
    }
}

// =============================================================================
// PrimaFactory - DriverFactory implementation
// =============================================================================

/// Configuration for the Prima driver
#[derive(Debug, Clone, Deserialize)]
pub struct PrimaConfig {
    /// Laser-control server address (host:port, scheme optional)
    pub address: String,

    /// Directory with the characterisation measurement files
    pub calibration_dir: PathBuf,

    /// Optional power cap applied to every line (watts)
    #[serde(default)]
    pub max_power_w: Option<f64>,

    /// USB device index on the server (default: 0)
    #[serde(default)]
    pub device_idx: u32,

    /// Module slot of the laser head (default: 100)
    #[serde(default = "default_slot_id")]
    pub slot_id: u32,

    /// Enable mock mode for testing without the server
    #[serde(default)]
    pub mock: bool,
}

// Slot 100 is where the PRI laser control module reports itself.
fn default_slot_id() -> u32 {
    100
}

/// Factory for creating Prima driver instances.
pub struct PrimaFactory;

/// Static capabilities for the Prima laser
static PRIMA_CAPABILITIES: &[Capability] = &[
    Capability::WavelengthTunable,
    Capability::EmissionControl,
    Capability::Parameterized,
];

impl DriverFactory for PrimaFactory {
    fn driver_type(&self) -> &'static str {
        "prima"
    }

    fn name(&self) -> &'static str {
        "PicoQuant Prima Pulsed RGB Laser"
    }

    fn capabilities(&self) -> &'static [Capability] {
        PRIMA_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: PrimaConfig = config.clone().try_into()?;
        if cfg.address.is_empty() {
            return Err(anyhow!("Prima config: 'address' must not be empty"));
        }
        if cfg.calibration_dir.as_os_str().is_empty() {
            return Err(anyhow!("Prima config: 'calibration_dir' must not be empty"));
        }
        if let Some(cap) = cfg.max_power_w {
            if !cap.is_finite() || cap <= 0.0 {
                return Err(anyhow!("Prima config: max_power_w must be positive"));
            }
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: PrimaConfig = config.try_into().context("Invalid Prima config")?;

            let driver = PrimaDriver::new_async(&cfg).await?;

            Ok(DeviceComponents {
                category: Some(DeviceCategory::Laser),
                description: Some(driver.describe()),
                wavelength_tunable: Some(driver.clone()),
                emission_control: Some(driver.clone()),
                parameterized: Some(driver),
                ..Default::default()
            })
        })
    }
}

// =============================================================================
// PrimaDriver
// =============================================================================

/// Cached laser state between calls.
#[derive(Debug, Clone, Copy)]
struct LaserState {
    mode: PrimaMode,
    /// Last non-Off mode, restored by `enable_emission`
    last_active_mode: PrimaMode,
    color: PrimaColor,
    power_w: f64,
    flux: f64,
    per_mille: u16,
}

/// Driver for the PicoQuant Prima pulsed RGB laser.
///
/// Callers should `disable_emission()` (or `disconnect()`) before dropping
/// the driver; the hardware keeps its last mode otherwise.
pub struct PrimaDriver {
    client: Arc<dyn Sepia2Ops>,
    pri: pb::PriRequest,
    specs: CalibrationTable,

    library_version: String,
    firmware_version: String,
    usb_descriptor: String,

    state: Mutex<LaserState>,
    /// Optional per-line power caps (watts)
    max_power: Mutex<HashMap<PrimaColor, Option<f64>>>,

    /// Active emission line
    wavelength_nm: Parameter<f64>,
    /// Parameter registry
    params: Arc<ParameterSet>,
}

impl PrimaDriver {
    /// Connect to the laser-control server and initialize the head.
    ///
    /// Applies the bench's standing configuration: red line selected,
    /// intensity 0 ‰, NarrowPulse mode, external rising trigger at 1000 mV.
    pub async fn new_async(cfg: &PrimaConfig) -> Result<Arc<Self>> {
        let client: Arc<dyn Sepia2Ops> = if cfg.mock {
            tracing::info!("Creating mock Prima driver");
            Arc::new(MockSepia2::new())
        } else {
            Arc::new(GrpcSepia2::connect(&cfg.address).await?)
        };
        Self::init(client, cfg).await
    }

    /// Initialize against an already-constructed service client.
    pub async fn init(client: Arc<dyn Sepia2Ops>, cfg: &PrimaConfig) -> Result<Arc<Self>> {
        let specs = CalibrationTable::load(&cfg.calibration_dir)
            .context("failed to load Prima calibration tables")?;

        let library_version = client.lib_version().await?;
        tracing::info!("Sepia2 library version: {}", library_version);

        if !client.usb_is_open(cfg.device_idx).await? {
            client.usb_open(cfg.device_idx).await?;
            tracing::info!("USB device opened.");
        }

        let firmware_version = client.fwr_version(cfg.device_idx).await?;
        tracing::info!("USB({}) FWR version: {}", cfg.device_idx, firmware_version);

        let usb_descriptor = client.usb_descriptor(cfg.device_idx).await?;
        tracing::info!("USB({}) descriptor: {}", cfg.device_idx, usb_descriptor);

        let module_count = client.fwr_module_map(cfg.device_idx, true).await?;
        tracing::info!("USB({}) alloc module map: {}", cfg.device_idx, module_count);
        for map_idx in 0..module_count {
            let module_info = client.fwr_module_info(cfg.device_idx, map_idx).await?;
            tracing::debug!(
                "USB({}) module map[{}]: slot={} primary={}",
                cfg.device_idx,
                map_idx,
                module_info.slot_id,
                module_info.is_primary
            );
        }

        let pri = pb::PriRequest {
            dev_idx: cfg.device_idx,
            slot_id: cfg.slot_id,
        };

        let device_info = client.pri_device_info(&pri).await?;
        tracing::info!(
            "PRI device: {} ({}), fw {}",
            device_info.device_id,
            device_info.device_type,
            device_info.fw_version
        );

        let (min_freq, max_freq) = client.pri_frequency_limits(&pri).await?;
        tracing::info!("PRI frequency limits: {} - {} Hz", min_freq, max_freq);

        // Standing bench configuration: red line, dark, NarrowPulse,
        // external rising trigger.
        client
            .pri_set_wavelength_idx(&pri, PrimaColor::Red.index())
            .await?;
        client
            .pri_set_intensity(&pri, PrimaColor::Red.index(), 0)
            .await?;
        client
            .pri_set_operation_mode(&pri, PrimaMode::NarrowPulse.to_pb())
            .await?;
        client
            .pri_set_trigger_source(&pri, EXTERNAL_RISING_TRIGGER_IDX)
            .await?;
        client.pri_set_trigger_level(&pri, TRIGGER_LEVEL_MV).await?;

        let mut params = ParameterSet::new();
        let mut wavelength_nm = Parameter::new(
            "wavelength_nm",
            f64::from(PrimaColor::Red.wavelength_nm()),
        )
        .with_description("Active emission line")
        .with_unit("nm")
        .with_validator(|nm: &f64| {
            PrimaColor::from_nm(*nm)
                .map(|_| ())
                .ok_or_else(|| anyhow!("{} nm is not a Prima emission line", nm))
        });
        {
            let client = client.clone();
            let pri = pri.clone();
            wavelength_nm.connect_to_hardware_write(move |nm: f64| {
                let client = client.clone();
                let pri = pri.clone();
                Box::pin(async move {
                    let color =
                        PrimaColor::from_nm(nm).ok_or_else(|| LabError::UnsupportedParameter {
                            device: "Prima".into(),
                            name: format!("wavelength {} nm", nm),
                        })?;
                    client
                        .pri_set_wavelength_idx(&pri, color.index())
                        .await
                        .map_err(|e| LabError::Rpc(e.to_string()))?;
                    Ok(())
                })
            });
        }
        params.register(wavelength_nm.clone());

        let mut max_power = HashMap::new();
        for color in PrimaColor::ALL {
            max_power.insert(color, cfg.max_power_w);
        }

        Ok(Arc::new(Self {
            client,
            pri,
            specs,
            library_version,
            firmware_version,
            usb_descriptor,
            state: Mutex::new(LaserState {
                mode: PrimaMode::NarrowPulse,
                last_active_mode: PrimaMode::NarrowPulse,
                color: PrimaColor::Red,
                power_w: 0.0,
                flux: 0.0,
                per_mille: 0,
            }),
            max_power: Mutex::new(max_power),
            wavelength_nm,
            params: Arc::new(params),
        }))
    }

    /// Static description for the run manifest.
    pub fn describe(&self) -> DeviceDescription {
        DeviceDescription {
            name: "Prima PicoQuant RGB Laser".into(),
            kind: "Picosecond pulsed laser".into(),
            manufacturer: "PicoQuant GmbH".into(),
            datasheet: Some(
                "https://www.picoquant.com/images/uploads/downloads/datasheet_prima_.pdf".into(),
            ),
            extra: serde_json::json!({
                "library_version": self.library_version,
                "firmware_version": self.firmware_version,
                "usb_descriptor": self.usb_descriptor,
                "wavelengths_nm": [450, 515, 640],
                "pulse_width_ps": [100, 200],
                "max_energy_mw": 10,
            }),
        }
    }

    /// Calibration tables in use.
    pub fn specs(&self) -> &CalibrationTable {
        &self.specs
    }

    /// Switch operating mode.
    pub async fn set_mode(&self, mode: PrimaMode) -> Result<()> {
        self.client
            .pri_set_operation_mode(&self.pri, mode.to_pb())
            .await?;
        let mut state = self.state.lock().await;
        state.mode = mode;
        if mode != PrimaMode::Off {
            state.last_active_mode = mode;
        }
        Ok(())
    }

    /// Current operating mode.
    pub async fn mode(&self) -> PrimaMode {
        self.state.lock().await.mode
    }

    /// Select an emission line.
    pub async fn set_color(&self, color: PrimaColor) -> Result<()> {
        self.wavelength_nm
            .set(f64::from(color.wavelength_nm()))
            .await?;
        self.state.lock().await.color = color;
        Ok(())
    }

    /// Active emission line.
    pub async fn color(&self) -> PrimaColor {
        self.state.lock().await.color
    }

    /// Cap the deliverable power on every line (watts).
    pub async fn set_max_power(&self, power_w: f64) {
        let mut caps = self.max_power.lock().await;
        for color in PrimaColor::ALL {
            caps.insert(color, Some(power_w));
        }
    }

    /// Cap (or uncap) the deliverable power on one line.
    pub async fn set_max_power_for(&self, color: PrimaColor, power_w: Option<f64>) {
        self.max_power.lock().await.insert(color, power_w);
    }

    /// Drive the laser to the requested optical power.
    ///
    /// Resolves the power against the calibration table for the current
    /// mode and line, then programs the per-mille intensity. Returns the
    /// setpoint actually applied.
    ///
    /// # Errors
    /// Fails if the laser is off, the request exceeds a configured cap, the
    /// calibration has no data for the line, or the power is outside the
    /// calibrated span.
    pub async fn set_power_w(&self, power_w: f64) -> Result<Setpoint> {
        let (mode, color) = {
            let state = self.state.lock().await;
            if state.mode == PrimaMode::Off {
                return Err(anyhow!("Laser is off, cannot set power."));
            }
            (state.mode, state.color)
        };

        if let Some(cap) = self.max_power.lock().await.get(&color).copied().flatten() {
            if power_w > cap {
                return Err(anyhow!(
                    "Requested {} W exceeds the {} W cap configured for the {} nm line",
                    power_w,
                    cap,
                    color.wavelength_nm()
                ));
            }
        }

        let setpoint = self
            .specs
            .resolve_power(mode.as_str(), color.wavelength_nm(), power_w)?;
        self.apply_setpoint(color, setpoint).await?;

        tracing::info!(
            "Setting laser to {:.3e}≈{:.3e} W with per mille={}",
            setpoint.power_w,
            power_w,
            setpoint.per_mille
        );
        Ok(setpoint)
    }

    /// Drive the laser to the requested photon flux (photons/s).
    pub async fn set_flux(&self, flux: f64) -> Result<Setpoint> {
        let (mode, color) = {
            let state = self.state.lock().await;
            if state.mode == PrimaMode::Off {
                return Err(anyhow!("Laser is off, cannot set flux."));
            }
            (state.mode, state.color)
        };

        let setpoint = self
            .specs
            .resolve_flux(mode.as_str(), color.wavelength_nm(), flux)?;

        if let Some(cap) = self.max_power.lock().await.get(&color).copied().flatten() {
            if setpoint.power_w > cap {
                return Err(anyhow!(
                    "Requested flux needs {} W, over the {} W cap for the {} nm line",
                    setpoint.power_w,
                    cap,
                    color.wavelength_nm()
                ));
            }
        }

        self.apply_setpoint(color, setpoint).await?;

        tracing::info!(
            "Setting laser to {:.3e} photons/s ({:.3e} W) with per mille={}",
            flux,
            setpoint.power_w,
            setpoint.per_mille
        );
        Ok(setpoint)
    }

    async fn apply_setpoint(&self, color: PrimaColor, setpoint: Setpoint) -> Result<()> {
        self.client
            .pri_set_intensity(&self.pri, color.index(), setpoint.per_mille)
            .await?;

        let mut state = self.state.lock().await;
        state.per_mille = setpoint.per_mille;
        state.power_w = setpoint.power_w;
        state.flux = power_to_flux(color.wavelength_nm(), setpoint.power_w);
        Ok(())
    }

    /// Power of the last applied setpoint (watts).
    pub async fn power_w(&self) -> f64 {
        self.state.lock().await.power_w
    }

    /// Photon flux of the last applied setpoint (photons/s).
    pub async fn flux(&self) -> f64 {
        self.state.lock().await.flux
    }

    /// Intensity of the last applied setpoint (per mille).
    pub async fn per_mille(&self) -> u16 {
        self.state.lock().await.per_mille
    }

    /// Drive the laser dark and release the session.
    pub async fn disconnect(&self) -> Result<()> {
        self.set_mode(PrimaMode::Off).await
    }
}

#[async_trait]
impl WavelengthTunable for PrimaDriver {
    async fn set_wavelength(&self, wavelength_nm: f64) -> Result<()> {
        let color = PrimaColor::from_nm(wavelength_nm).ok_or_else(|| {
            anyhow!(
                "{} nm is not a Prima emission line (450, 515 or 640 nm)",
                wavelength_nm
            )
        })?;
        self.set_color(color).await
    }

    async fn get_wavelength(&self) -> Result<f64> {
        Ok(self.wavelength_nm.get())
    }

    fn wavelength_range(&self) -> (f64, f64) {
        (450.0, 640.0)
    }
}

#[async_trait]
impl EmissionControl for PrimaDriver {
    async fn enable_emission(&self) -> Result<()> {
        let mode = self.state.lock().await.last_active_mode;
        self.set_mode(mode).await
    }

    async fn disable_emission(&self) -> Result<()> {
        self.set_mode(PrimaMode::Off).await
    }

    async fn is_emission_enabled(&self) -> Result<bool> {
        Ok(self.mode().await != PrimaMode::Off)
    }
}

impl Parameterized for PrimaDriver {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::MEASUREMENT_FILES;
    use std::io::Write;

    fn write_calibration(dir: &std::path::Path) {
        for (_, filename) in MEASUREMENT_FILES {
            let mut file = std::fs::File::create(dir.join(filename)).unwrap();
            writeln!(file, "wavelength_nm,per_mille,power_w").unwrap();
            for &(wavelength, scale) in &[(450u32, 1.0f64), (515, 1.2), (640, 1.5)] {
                for pm in [0u16, 250, 500, 750, 1000] {
                    writeln!(
                        file,
                        "{},{},{:e}",
                        wavelength,
                        pm,
                        scale * 1.0e-8 * f64::from(pm)
                    )
                    .unwrap();
                }
            }
        }
    }

    fn mock_config(dir: &std::path::Path) -> PrimaConfig {
        PrimaConfig {
            address: "mock".into(),
            calibration_dir: dir.to_path_buf(),
            max_power_w: None,
            device_idx: 0,
            slot_id: 100,
            mock: true,
        }
    }

    async fn mock_driver_with_state(
    ) -> (Arc<PrimaDriver>, Arc<MockSepia2>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        write_calibration(dir.path());
        let mock = Arc::new(MockSepia2::new());
        let driver = PrimaDriver::init(mock.clone(), &mock_config(dir.path()))
            .await
            .unwrap();
        (driver, mock, dir)
    }

    #[test]
    fn test_color_index_roundtrip() {
        for color in PrimaColor::ALL {
            assert_eq!(PrimaColor::from_index(color.index()).unwrap(), color);
        }
        assert!(PrimaColor::from_index(3).is_err());
    }

    #[test]
    fn test_color_from_nm() {
        assert_eq!(PrimaColor::from_nm(640.0), Some(PrimaColor::Red));
        assert_eq!(PrimaColor::from_nm(515.4), Some(PrimaColor::Green));
        assert_eq!(PrimaColor::from_nm(800.0), None);
    }

    #[test]
    fn test_mode_names_match_measurement_files() {
        for mode in [PrimaMode::Cw, PrimaMode::BroadPulse, PrimaMode::NarrowPulse] {
            assert!(MEASUREMENT_FILES.iter().any(|(name, _)| *name == mode.as_str()));
        }
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = PrimaFactory;

        let valid = toml::Value::Table(toml::toml! {
            address = "eng-7383:50051"
            calibration_dir = "/data/characterisation"
        });
        assert!(factory.validate(&valid).is_ok());

        let bad_cap = toml::Value::Table(toml::toml! {
            address = "eng-7383:50051"
            calibration_dir = "/data/characterisation"
            max_power_w = -1.0
        });
        assert!(factory.validate(&bad_cap).is_err());

        let missing_address = toml::Value::Table(toml::toml! {
            calibration_dir = "/data/characterisation"
        });
        assert!(factory.validate(&missing_address).is_err());
    }

    #[tokio::test]
    async fn test_init_applies_standing_configuration() {
        let (_driver, mock, _dir) = mock_driver_with_state().await;

        let state = mock.state();
        assert!(state.usb_open);
        assert_eq!(state.wl_idx, PrimaColor::Red.index());
        assert_eq!(state.intensity_per_mille, 0);
        assert_eq!(state.mode, pb::OperationMode::NarrowPulse);
        assert_eq!(state.trigger_source_idx, EXTERNAL_RISING_TRIGGER_IDX);
        assert_eq!(state.trigger_level_mv, TRIGGER_LEVEL_MV);
    }

    #[tokio::test]
    async fn test_set_wavelength_updates_hardware_index() {
        let (driver, mock, _dir) = mock_driver_with_state().await;

        driver.set_wavelength(515.0).await.unwrap();
        assert_eq!(mock.state().wl_idx, PrimaColor::Green.index());
        assert!((driver.get_wavelength().await.unwrap() - 515.0).abs() < f64::EPSILON);

        assert!(driver.set_wavelength(800.0).await.is_err());
    }

    #[tokio::test]
    async fn test_set_power_resolves_per_mille() {
        let (driver, mock, _dir) = mock_driver_with_state().await;

        // Red line, narrow pulse: power = 1.5e-8 * per_mille
        let setpoint = driver.set_power_w(1.5e-8 * 500.0).await.unwrap();
        assert_eq!(setpoint.per_mille, 500);
        assert_eq!(mock.state().intensity_per_mille, 500);

        assert_eq!(driver.per_mille().await, 500);
        assert!((driver.power_w().await - 7.5e-6).abs() < 1e-12);
        assert!(driver.flux().await > 0.0);
    }

    #[tokio::test]
    async fn test_set_power_rejected_when_off() {
        let (driver, _mock, _dir) = mock_driver_with_state().await;

        driver.disable_emission().await.unwrap();
        assert!(driver.set_power_w(1.0e-6).await.is_err());
        assert!(driver.set_flux(1.0e10).await.is_err());
    }

    #[tokio::test]
    async fn test_set_power_out_of_calibrated_span() {
        let (driver, _mock, _dir) = mock_driver_with_state().await;

        let result = driver.set_power_w(1.0).await;
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LabError>(),
            Some(LabError::OutOfCalibrationRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_max_power_cap_enforced() {
        let (driver, _mock, _dir) = mock_driver_with_state().await;

        driver.set_max_power(1.0e-6).await;
        assert!(driver.set_power_w(5.0e-6).await.is_err());

        driver
            .set_max_power_for(PrimaColor::Red, Some(1.0e-2))
            .await;
        assert!(driver.set_power_w(5.0e-6).await.is_ok());
    }

    #[tokio::test]
    async fn test_set_flux_matches_power_path() {
        let (driver, _mock, _dir) = mock_driver_with_state().await;

        let target_power = 1.5e-8 * 250.0;
        let flux = power_to_flux(640, target_power);

        let setpoint = driver.set_flux(flux).await.unwrap();
        assert_eq!(setpoint.per_mille, 250);
        assert!((driver.flux().await - flux).abs() / flux < 1e-9);
    }

    #[tokio::test]
    async fn test_emission_control_roundtrip() {
        let (driver, mock, _dir) = mock_driver_with_state().await;

        assert!(driver.is_emission_enabled().await.unwrap());

        driver.disable_emission().await.unwrap();
        assert_eq!(mock.state().mode, pb::OperationMode::Off);
        assert!(!driver.is_emission_enabled().await.unwrap());

        // Re-enabling restores the last pulsed mode
        driver.enable_emission().await.unwrap();
        assert_eq!(mock.state().mode, pb::OperationMode::NarrowPulse);
    }

    #[tokio::test]
    async fn test_disconnect_drives_laser_dark() {
        let (driver, mock, _dir) = mock_driver_with_state().await;
        driver.disconnect().await.unwrap();
        assert_eq!(mock.state().mode, pb::OperationMode::Off);
    }

    #[tokio::test]
    async fn test_describe_names_the_head() {
        let (driver, _mock, _dir) = mock_driver_with_state().await;
        let description = driver.describe();
        assert_eq!(description.name, "Prima PicoQuant RGB Laser");
        assert_eq!(description.manufacturer, "PicoQuant GmbH");
        assert_eq!(description.extra["wavelengths_nm"][2], 640);
    }
}
