//! Thorlabs PM400 Optical Power Meter Driver
//!
//! Reference: PM400 Operation Manual, SCPI command set
//!
//! Protocol Overview:
//! - Format: SCPI ASCII over the instrument's USBTMC byte stream (or a
//!   serial bridge)
//! - Terminator: LF (\n) both directions
//! - Commands: *RST, *CLS, SENS:CORR:WAV {nm}
//! - Queries: *IDN?, SENS:CORR:WAV?, MEAS:POW? (watts, scientific notation)
//!
//! The sensor's responsivity correction depends on the configured wavelength,
//! so `set_wavelength` must precede power readings when the source changes.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lab_driver_thorlabs_pm::Pm400Factory;
//! use lab_core::driver::DriverFactory;
//!
//! registry.register_factory(Box::new(Pm400Factory));
//!
//! let config = toml::toml! {
//!     path = "/dev/usbtmc0"
//!     wavelength_nm = 640.0
//! };
//! let components = factory.build(config.into()).await?;
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::capabilities::{DeviceCategory, Parameterized, Readable, WavelengthTunable};
use lab_core::driver::{Capability, DeviceComponents, DeviceDescription, DriverFactory};
use lab_core::error::LabError;
use lab_core::observable::ParameterSet;
use lab_core::parameter::Parameter;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tokio_serial::SerialPortBuilderExt;
use tracing::instrument;

/// Planck's constant (J*s)
const PLANCK: f64 = 6.626e-34;
/// Speed of light (m/s)
const LIGHT_SPEED: f64 = 3e8;

/// Wavelength range of the installed sensor head (nm)
const WAVELENGTH_RANGE_NM: (f64, f64) = (400.0, 1100.0);

// =============================================================================
// Pm400Factory - DriverFactory implementation
// =============================================================================

/// Configuration for the PM400 driver
#[derive(Debug, Clone, Deserialize)]
pub struct Pm400Config {
    /// Device path (e.g., "/dev/usbtmc0" or a serial bridge)
    #[serde(default)]
    pub path: Option<String>,
    /// Optional initial correction wavelength in nm
    #[serde(default)]
    pub wavelength_nm: Option<f64>,
    /// Enable mock mode for testing without hardware
    #[serde(default)]
    pub mock: bool,
}

/// Factory for creating PM400 driver instances.
pub struct Pm400Factory;

/// Static capabilities for the PM400
static PM400_CAPABILITIES: &[Capability] = &[
    Capability::Readable,
    Capability::WavelengthTunable,
    Capability::Parameterized,
];

impl DriverFactory for Pm400Factory {
    fn driver_type(&self) -> &'static str {
        "pm400"
    }

    fn name(&self) -> &'static str {
        "Thorlabs PM400 Optical Power Meter"
    }

    fn capabilities(&self) -> &'static [Capability] {
        PM400_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: Pm400Config = config.clone().try_into()?;
        if !cfg.mock && cfg.path.is_none() {
            return Err(anyhow!("PM400 config: 'path' is required unless mock = true"));
        }
        if let Some(wl) = cfg.wavelength_nm {
            if !(WAVELENGTH_RANGE_NM.0..=WAVELENGTH_RANGE_NM.1).contains(&wl) {
                return Err(anyhow!(
                    "Wavelength {} nm out of range ({}-{} nm)",
                    wl,
                    WAVELENGTH_RANGE_NM.0,
                    WAVELENGTH_RANGE_NM.1
                ));
            }
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Pm400Config = config.try_into().context("Invalid PM400 config")?;

            let driver = if cfg.mock {
                tracing::info!("Creating mock PM400 driver");
                Arc::new(Pm400Driver::new_mock().await?)
            } else {
                let path = cfg
                    .path
                    .as_deref()
                    .ok_or_else(|| anyhow!("PM400 config: 'path' is required"))?;
                Arc::new(Pm400Driver::new_async(path).await?)
            };

            if let Some(wl) = cfg.wavelength_nm {
                driver.set_wavelength(wl).await?;
            }

            Ok(DeviceComponents {
                category: Some(DeviceCategory::PowerMeter),
                description: Some(driver.describe()),
                readable: Some(driver.clone()),
                wavelength_tunable: Some(driver.clone()),
                parameterized: Some(driver),
                ..Default::default()
            })
        })
    }
}

// =============================================================================
// Pm400Driver
// =============================================================================

pub trait MeterIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> MeterIO for T {}
type DynStream = Box<dyn MeterIO>;
type SharedPort = Arc<Mutex<BufReader<DynStream>>>;

/// One point of a spectral sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumPoint {
    /// Correction wavelength used for the reading
    pub wavelength_nm: f64,
    /// Measured optical power in watts
    pub power_w: f64,
    /// Measured photon flux in photons/s
    pub flux: f64,
}

/// Driver for the Thorlabs PM400 optical power meter.
pub struct Pm400Driver {
    /// Byte stream protected by Mutex for exclusive access
    port: SharedPort,
    /// Command timeout duration
    timeout: Duration,
    /// Identity string reported by `*IDN?`
    identity: String,
    /// Correction wavelength parameter (nm)
    wavelength_nm: Parameter<f64>,
    /// Parameter registry
    params: Arc<ParameterSet>,
}

impl Pm400Driver {
    /// Open the device node and validate the meter.
    ///
    /// # Errors
    /// Returns error if the device cannot be opened, does not answer
    /// `*IDN?`, or the identity does not name a PM400.
    pub async fn new_async(path: &str) -> Result<Self> {
        let path_owned = path.to_string();

        // Use spawn_blocking to avoid blocking the async runtime
        let port = spawn_blocking(move || {
            tokio_serial::new(&path_owned, 115_200)
                .open_native_async()
                .context(format!("Failed to open PM400 device: {}", path_owned))
        })
        .await
        .context("spawn_blocking for PM400 device opening failed")??;

        Self::connect(Arc::new(Mutex::new(BufReader::new(Box::new(port))))).await
    }

    /// Create a driver backed by an in-process simulated meter.
    pub async fn new_mock() -> Result<Self> {
        Self::connect(Arc::new(Mutex::new(BufReader::new(spawn_mock_meter())))).await
    }

    /// Shared init path: reset, clear status, validate identity.
    async fn connect(port: SharedPort) -> Result<Self> {
        let mut driver = Self::build(port);

        driver.send_config_command("*RST").await?;
        driver.send_config_command("*CLS").await?;

        let identity = driver.query("*IDN?").await.context(
            "PM400 validation failed: no response to identity query (*IDN?)",
        )?;
        if !identity.contains("PM400") {
            return Err(anyhow!(
                "Connected device is not a PM400: {}",
                identity
            ));
        }
        tracing::info!("PM400 validated: {}", identity);
        driver.identity = identity;

        Ok(driver)
    }

    fn build(port: SharedPort) -> Self {
        let mut params = ParameterSet::new();
        let mut wavelength_nm = Parameter::new("wavelength_nm", 640.0)
            .with_description("Sensor responsivity correction wavelength")
            .with_unit("nm")
            .with_range(WAVELENGTH_RANGE_NM.0, WAVELENGTH_RANGE_NM.1);

        Self::attach_wavelength_callbacks(&mut wavelength_nm, port.clone());
        params.register(wavelength_nm.clone());

        Self {
            port,
            timeout: Duration::from_millis(500),
            identity: String::new(),
            wavelength_nm,
            params: Arc::new(params),
        }
    }

    /// Attach hardware callbacks to the wavelength parameter.
    fn attach_wavelength_callbacks(wavelength: &mut Parameter<f64>, port: SharedPort) {
        wavelength.connect_to_hardware_write(move |target: f64| {
            let port = port.clone();
            Box::pin(async move {
                let cmd = format!("SENS:CORR:WAV {:.0}\n", target);
                let mut guard = port.lock().await;
                guard
                    .get_mut()
                    .write_all(cmd.as_bytes())
                    .await
                    .context("Failed to write wavelength command")
                    .map_err(|e| LabError::Instrument {
                        device: "PM400".into(),
                        message: e.to_string(),
                    })?;
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(())
            })
        });
    }

    /// Identity string reported by the instrument.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Static description for the run manifest.
    pub fn describe(&self) -> DeviceDescription {
        DeviceDescription {
            name: "Thorlabs PM400 400-1100nm".into(),
            kind: "Power meter".into(),
            manufacturer: "Thorlabs".into(),
            datasheet: Some(
                "https://www.thorlabs.com/drawings/13fefd4ddeb72e3c-6D730A86-A702-B53C-E9E377EA603B3CBE/PM400-Manual.pdf"
                    .into(),
            ),
            extra: serde_json::json!({ "idn": self.identity }),
        }
    }

    /// Query the configured correction wavelength.
    pub async fn query_wavelength(&self) -> Result<f64> {
        let response = self.query("SENS:CORR:WAV?").await?;
        response.trim().parse::<f64>().map_err(|_| {
            LabError::MalformedResponse {
                device: "PM400".into(),
                response: response.clone(),
            }
            .into()
        })
    }

    /// Query a power measurement in watts.
    async fn query_power(&self) -> Result<f64> {
        let response = self.query("MEAS:POW?").await?;
        let power = response.trim().parse::<f64>().map_err(|_| {
            anyhow::Error::from(LabError::MalformedResponse {
                device: "PM400".into(),
                response: response.clone(),
            })
        })?;
        tracing::debug!("PM400: power = {:.6e} W, raw = {:?}", power, response);
        Ok(power)
    }

    /// Measured photon flux in photons/s at the configured wavelength.
    ///
    /// Photon energy E = h*c/λ.
    pub async fn read_flux(&self) -> Result<f64> {
        let wavelength = self.query_wavelength().await?;
        let power = self.query_power().await?;
        Ok(power / (PLANCK * LIGHT_SPEED / (wavelength * 1e-9)))
    }

    /// Sweep the correction wavelength and record power and flux per point.
    ///
    /// The meter needs a settle delay after a wavelength change before the
    /// reading stabilizes.
    pub async fn scan_spectrum(
        &self,
        wavelengths: &[f64],
        settle: Duration,
    ) -> Result<Vec<SpectrumPoint>> {
        if wavelengths.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(
            "Power meter scanning wavelengths: [{}, {}]",
            wavelengths[0],
            wavelengths[wavelengths.len() - 1]
        );

        let mut points = Vec::with_capacity(wavelengths.len());
        for &wavelength in wavelengths {
            self.wavelength_nm.set(wavelength).await?;
            tokio::time::sleep(settle).await;
            let power = self.query_power().await?;
            let flux = power / (PLANCK * LIGHT_SPEED / (wavelength * 1e-9));
            tracing::debug!("Measured power at {} nm: {} W", wavelength, power);
            points.push(SpectrumPoint {
                wavelength_nm: wavelength,
                power_w: power,
                flux,
            });
        }
        Ok(points)
    }

    /// Default sweep grid over the sensor range (50 points, 400-1100 nm).
    pub fn default_scan_wavelengths() -> Vec<f64> {
        let (min, max) = WAVELENGTH_RANGE_NM;
        let n = 50;
        (0..n)
            .map(|i| min + (max - min) * (i as f64) / ((n - 1) as f64))
            .collect()
    }

    /// Send query and read response.
    async fn query(&self, command: &str) -> Result<String> {
        let mut port = self.port.lock().await;

        // Flush any stale data: first BufReader's internal buffer,
        // then anything pending on the stream.
        {
            let buf = port.buffer();
            if !buf.is_empty() {
                tracing::debug!("PM400: clearing {} bytes from buffer", buf.len());
                let len = buf.len();
                port.consume(len);
            }
        }
        let mut discard = [0u8; 256];
        let mut quiet_rounds = 0u32;
        while quiet_rounds < 2 {
            match tokio::time::timeout(Duration::from_millis(5), port.get_mut().read(&mut discard))
                .await
            {
                Ok(Ok(0)) | Err(_) => quiet_rounds += 1,
                Ok(Ok(n)) => {
                    quiet_rounds = 0;
                    tracing::debug!("PM400: flushed {} stale bytes from stream", n);
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => quiet_rounds += 1,
                Ok(Err(e)) => return Err(e).context("PM400 read error during drain"),
            }
        }

        let cmd = format!("{}\n", command);
        tracing::debug!("PM400: sending command {:?}", cmd);
        port.get_mut()
            .write_all(cmd.as_bytes())
            .await
            .context("PM400 write failed")?;

        let mut response = String::new();
        match tokio::time::timeout(self.timeout, port.read_line(&mut response)).await {
            Ok(Ok(0)) => Err(anyhow!("PM400 connection closed")),
            Ok(Ok(_)) => Ok(response.trim().to_string()),
            Ok(Err(e)) => Err(anyhow!("PM400 read error: {}", e)),
            Err(_) => Err(anyhow!("PM400 read timeout for {:?}", command)),
        }
    }

    /// Send a configuration command; the PM400 does not reply to these.
    async fn send_config_command(&self, command: &str) -> Result<()> {
        let mut port = self.port.lock().await;
        let cmd = format!("{}\n", command);
        port.get_mut()
            .write_all(cmd.as_bytes())
            .await
            .context("PM400 write failed")?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn with_test_port(port: SharedPort) -> Self {
        Self::build(port)
    }
}

impl Parameterized for Pm400Driver {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

#[async_trait]
impl Readable for Pm400Driver {
    #[instrument(skip(self), err)]
    async fn read(&self) -> Result<f64> {
        self.query_power().await
    }
}

#[async_trait]
impl WavelengthTunable for Pm400Driver {
    #[instrument(skip(self), fields(wavelength_nm), err)]
    async fn set_wavelength(&self, wavelength_nm: f64) -> Result<()> {
        self.wavelength_nm.set(wavelength_nm).await
    }

    #[instrument(skip(self), err)]
    async fn get_wavelength(&self) -> Result<f64> {
        self.query_wavelength().await
    }

    fn wavelength_range(&self) -> (f64, f64) {
        WAVELENGTH_RANGE_NM
    }
}

// =============================================================================
// Simulated meter (mock mode)
// =============================================================================

/// Spawn an in-process meter simulation and return the driver-side stream.
fn spawn_mock_meter() -> DynStream {
    let (driver_side, meter_side) = tokio::io::duplex(256);
    tokio::spawn(run_mock_meter(meter_side));
    Box::new(driver_side)
}

/// Deterministic fake responsivity curve used by the simulated meter.
fn simulated_power(wavelength_nm: f64) -> f64 {
    1.0e-6 * (wavelength_nm / 1000.0)
}

async fn run_mock_meter(stream: tokio::io::DuplexStream) {
    let mut reader = BufReader::new(stream);
    let mut wavelength_nm = 640.0_f64;

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let cmd = line.trim();

        let reply = if cmd == "*IDN?" {
            Some("Thorlabs,PM400,P5003184,1.4.0".to_string())
        } else if cmd == "SENS:CORR:WAV?" {
            Some(format!("{:.6E}", wavelength_nm))
        } else if cmd == "MEAS:POW?" {
            Some(format!("{:.6E}", simulated_power(wavelength_nm)))
        } else if let Some(arg) = cmd.strip_prefix("SENS:CORR:WAV ") {
            if let Ok(wl) = arg.trim().parse::<f64>() {
                wavelength_nm = wl;
            }
            None
        } else {
            // *RST, *CLS and anything else: no reply
            None
        };

        if let Some(reply) = reply {
            let line = format!("{}\n", reply);
            if reader.get_mut().write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_driver_type() {
        let factory = Pm400Factory;
        assert_eq!(factory.driver_type(), "pm400");
        assert_eq!(factory.name(), "Thorlabs PM400 Optical Power Meter");
    }

    #[tokio::test]
    async fn test_factory_validate_config() {
        let factory = Pm400Factory;

        let valid = toml::Value::Table(toml::toml! {
            path = "/dev/usbtmc0"
        });
        assert!(factory.validate(&valid).is_ok());

        let mock_only = toml::Value::Table(toml::toml! {
            mock = true
        });
        assert!(factory.validate(&mock_only).is_ok());

        let missing_path = toml::Value::Table(toml::toml! {
            wavelength_nm = 640.0
        });
        assert!(factory.validate(&missing_path).is_err());

        let bad_wavelength = toml::Value::Table(toml::toml! {
            path = "/dev/usbtmc0"
            wavelength_nm = 2000.0
        });
        assert!(factory.validate(&bad_wavelength).is_err());
    }

    #[tokio::test]
    async fn test_mock_meter_identity_and_power() {
        let driver = Pm400Driver::new_mock().await.unwrap();
        assert!(driver.identity().contains("PM400"));

        let power = driver.read().await.unwrap();
        assert!(power > 0.0);
    }

    #[tokio::test]
    async fn test_mock_meter_wavelength_roundtrip() {
        let driver = Pm400Driver::new_mock().await.unwrap();

        driver.set_wavelength(532.0).await.unwrap();
        let wl = driver.get_wavelength().await.unwrap();
        assert!((wl - 532.0).abs() < 0.5);
    }

    #[tokio::test]
    async fn test_wavelength_range_enforced() {
        let driver = Pm400Driver::new_mock().await.unwrap();
        assert!(driver.set_wavelength(200.0).await.is_err());
        assert!(driver.set_wavelength(1500.0).await.is_err());
    }

    #[tokio::test]
    async fn test_flux_conversion_matches_photon_energy() {
        let driver = Pm400Driver::new_mock().await.unwrap();
        driver.set_wavelength(640.0).await.unwrap();

        let power = driver.read().await.unwrap();
        let flux = driver.read_flux().await.unwrap();

        let photon_energy = PLANCK * LIGHT_SPEED / (640.0 * 1e-9);
        assert!((flux - power / photon_energy).abs() / flux < 1e-9);
    }

    #[tokio::test]
    async fn test_scan_spectrum_covers_grid() {
        let driver = Pm400Driver::new_mock().await.unwrap();
        let grid = [450.0, 515.0, 640.0];
        let points = driver
            .scan_spectrum(&grid, Duration::from_millis(1))
            .await
            .unwrap();

        assert_eq!(points.len(), 3);
        for (point, &wl) in points.iter().zip(grid.iter()) {
            assert!((point.wavelength_nm - wl).abs() < f64::EPSILON);
            assert!(point.power_w > 0.0);
            assert!(point.flux > 0.0);
        }
        // The simulated responsivity rises with wavelength
        assert!(points[2].power_w > points[0].power_w);
    }

    #[test]
    fn test_default_scan_grid_spans_sensor_range() {
        let grid = Pm400Driver::default_scan_wavelengths();
        assert_eq!(grid.len(), 50);
        assert!((grid[0] - 400.0).abs() < f64::EPSILON);
        assert!((grid[49] - 1100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_wavelength_parameter_writes_command() {
        let (mut host, device) = tokio::io::duplex(64);
        let port: SharedPort = Arc::new(Mutex::new(BufReader::new(Box::new(device))));

        let driver = Pm400Driver::with_test_port(port);
        driver.set_wavelength(800.0).await.unwrap();

        let mut buf = vec![0u8; 32];
        let n = host.read(&mut buf).await.unwrap();
        let sent = String::from_utf8_lossy(&buf[..n]);
        assert!(sent.contains("SENS:CORR:WAV 800"));
    }
}
