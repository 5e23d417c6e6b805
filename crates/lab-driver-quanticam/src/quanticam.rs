//! QuantiCam SPAD array camera driver.
//!
//! The QuantiCam is a 192x128 time-gated SPAD array read out through an FPGA
//! (10 MHz stop clock). The sensor itself is operated by the QuantiCam
//! numerical-computing project; this driver talks to that project's exported
//! interface when the `julia` feature is enabled, and to a deterministic
//! in-process simulator otherwise.
//!
//! # Capabilities
//!
//! - `Triggerable` - arm the gate, fire a software start
//! - `ExposureControl` - integration window per snap
//! - `FrameCapture` - one 192x128 frame of TDC codes per `snap()`
//! - `Parameterized` - exposure as an observable parameter

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::capabilities::{
    DeviceCategory, ExposureControl, FrameCapture, Parameterized, Triggerable,
};
use lab_core::data::Frame;
use lab_core::driver::{Capability, DeviceComponents, DeviceDescription, DriverFactory};
use lab_core::error::LabError;
use lab_core::observable::ParameterSet;
use lab_core::parameter::Parameter;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Sensor width in pixels
pub const FRAME_WIDTH: u32 = 192;
/// Sensor height in pixels
pub const FRAME_HEIGHT: u32 = 128;
/// Stop clock frequency (Hz)
pub const STOP_CLK_HZ: f64 = 10e6;

// =============================================================================
// QuantiCamFactory - DriverFactory implementation
// =============================================================================

/// Configuration for the QuantiCam driver
#[derive(Debug, Clone, Deserialize)]
pub struct QuantiCamConfig {
    /// FPGA bitfile loaded at startup
    pub bitfile: PathBuf,

    /// Initial integration window in milliseconds (default: 10)
    #[serde(default = "default_exposure_ms")]
    pub exposure_ms: f64,

    /// Force the in-process simulator even when the `julia` backend is
    /// compiled in
    #[serde(default)]
    pub mock: bool,
}

fn default_exposure_ms() -> f64 {
    10.0
}

/// Factory for creating QuantiCam driver instances.
pub struct QuantiCamFactory;

/// Static capabilities for the QuantiCam
static QUANTICAM_CAPABILITIES: &[Capability] = &[
    Capability::Triggerable,
    Capability::ExposureControl,
    Capability::FrameCapture,
    Capability::Parameterized,
];

impl DriverFactory for QuantiCamFactory {
    fn driver_type(&self) -> &'static str {
        "quanticam"
    }

    fn name(&self) -> &'static str {
        "QuantiCam 192x128 SPAD Array"
    }

    fn capabilities(&self) -> &'static [Capability] {
        QUANTICAM_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: QuantiCamConfig = config.clone().try_into()?;
        if cfg.bitfile.as_os_str().is_empty() {
            return Err(anyhow!("QuantiCam config: 'bitfile' must not be empty"));
        }
        if !cfg.exposure_ms.is_finite() || cfg.exposure_ms <= 0.0 {
            return Err(anyhow!(
                "QuantiCam config: exposure_ms must be positive, got {}",
                cfg.exposure_ms
            ));
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: QuantiCamConfig = config.try_into().context("Invalid QuantiCam config")?;

            let driver = QuantiCamDriver::new_async(&cfg).await?;

            Ok(DeviceComponents {
                category: Some(DeviceCategory::Camera),
                description: Some(driver.describe()),
                triggerable: Some(driver.clone()),
                exposure_control: Some(driver.clone()),
                frame_capture: Some(driver.clone()),
                parameterized: Some(driver),
                ..Default::default()
            })
        })
    }
}

// =============================================================================
// Sensor backend abstraction
// =============================================================================

/// Operations the sensor backend must provide.
///
/// The real backend forwards these to the QuantiCam project's exported
/// interface; the simulator keeps everything in-process.
#[async_trait]
pub(crate) trait SensorBackend: Send + Sync {
    async fn load_bitfile(&self, path: &Path) -> Result<()>;
    async fn arm(&self) -> Result<()>;
    async fn trigger(&self) -> Result<()>;
    /// Integrate for `exposure_ms` and return one frame of TDC codes.
    async fn capture(&self, exposure_ms: f64) -> Result<Frame>;
}

// =============================================================================
// QuantiCamDriver
// =============================================================================

/// Driver for the QuantiCam SPAD array.
pub struct QuantiCamDriver {
    backend: Arc<dyn SensorBackend>,
    bitfile: PathBuf,
    armed: AtomicBool,

    /// Integration window per snap
    exposure_ms: Parameter<f64>,
    /// Parameter registry
    params: Arc<ParameterSet>,
}

impl QuantiCamDriver {
    /// Load the bitfile and bring the sensor up.
    pub async fn new_async(cfg: &QuantiCamConfig) -> Result<Arc<Self>> {
        let backend: Arc<dyn SensorBackend> = if cfg.mock {
            tracing::info!("Creating mock QuantiCam driver");
            Arc::new(MockSensor::new())
        } else {
            hardware_backend().await?
        };

        Self::init(backend, cfg).await
    }

    pub(crate) async fn init(
        backend: Arc<dyn SensorBackend>,
        cfg: &QuantiCamConfig,
    ) -> Result<Arc<Self>> {
        backend
            .load_bitfile(&cfg.bitfile)
            .await
            .with_context(|| format!("failed to load bitfile {}", cfg.bitfile.display()))?;
        tracing::info!("QuantiCam up with bitfile {}", cfg.bitfile.display());

        let mut params = ParameterSet::new();
        let exposure_ms = Parameter::new("exposure_ms", cfg.exposure_ms)
            .with_description("Integration window per snap")
            .with_unit("ms")
            .with_range(0.001, 60_000.0);
        params.register(exposure_ms.clone());

        Ok(Arc::new(Self {
            backend,
            bitfile: cfg.bitfile.clone(),
            armed: AtomicBool::new(false),
            exposure_ms,
            params: Arc::new(params),
        }))
    }

    /// Static description for the run manifest.
    pub fn describe(&self) -> DeviceDescription {
        DeviceDescription {
            name: "QuantiCam SPAD array 192x128 sensor".into(),
            kind: "SPAD array sensor".into(),
            manufacturer: "UoE".into(),
            datasheet: None,
            extra: serde_json::json!({
                "frame_size": [FRAME_WIDTH, FRAME_HEIGHT],
                "stop_clk_hz": STOP_CLK_HZ,
                "bitfile": self.bitfile.display().to_string(),
            }),
        }
    }
}

#[async_trait]
impl Triggerable for QuantiCamDriver {
    async fn arm(&self) -> Result<()> {
        self.backend.arm().await?;
        self.armed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        if !self.armed.load(Ordering::SeqCst) {
            return Err(anyhow!("QuantiCam not armed"));
        }
        self.backend.trigger().await
    }
}

#[async_trait]
impl ExposureControl for QuantiCamDriver {
    async fn set_exposure_ms(&self, ms: f64) -> Result<()> {
        self.exposure_ms.set(ms).await
    }

    async fn get_exposure_ms(&self) -> Result<f64> {
        Ok(self.exposure_ms.get())
    }
}

#[async_trait]
impl FrameCapture for QuantiCamDriver {
    async fn snap(&self) -> Result<Frame> {
        self.backend.capture(self.exposure_ms.get()).await
    }

    fn resolution(&self) -> (u32, u32) {
        (FRAME_WIDTH, FRAME_HEIGHT)
    }
}

impl Parameterized for QuantiCamDriver {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

#[cfg(feature = "julia")]
async fn hardware_backend() -> Result<Arc<dyn SensorBackend>> {
    Ok(Arc::new(crate::julia::JuliaSensor::spawn().await?))
}

#[cfg(not(feature = "julia"))]
async fn hardware_backend() -> Result<Arc<dyn SensorBackend>> {
    tracing::warn!("julia feature NOT enabled - using mock sensor");
    Ok(Arc::new(MockSensor::new()))
}

// =============================================================================
// Mock sensor
// =============================================================================

/// In-process sensor simulation producing reproducible TDC histograms.
pub(crate) struct MockSensor {
    frames_captured: Mutex<u64>,
}

impl MockSensor {
    pub(crate) fn new() -> Self {
        Self {
            frames_captured: Mutex::new(0),
        }
    }
}

#[async_trait]
impl SensorBackend for MockSensor {
    async fn load_bitfile(&self, path: &Path) -> Result<()> {
        tracing::debug!("Mock sensor: pretending to load {}", path.display());
        Ok(())
    }

    async fn arm(&self) -> Result<()> {
        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        Ok(())
    }

    async fn capture(&self, exposure_ms: f64) -> Result<Frame> {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut captured = self.frames_captured.lock().await;
        *captured += 1;

        // Seed from the frame counter so runs are reproducible
        let mut rng = StdRng::seed_from_u64(*captured);
        let scale = (exposure_ms.max(0.001).log10() + 4.0).max(1.0);
        let pixels: Vec<u16> = (0..(FRAME_WIDTH * FRAME_HEIGHT) as usize)
            .map(|_| {
                let code: u16 = rng.gen_range(0..1024);
                (f64::from(code) * scale) as u16
            })
            .collect();

        Frame::new(FRAME_WIDTH, FRAME_HEIGHT, pixels)
            .ok_or_else(|| {
                LabError::MalformedResponse {
                    device: "QuantiCam".into(),
                    response: "frame size mismatch".into(),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_config() -> QuantiCamConfig {
        QuantiCamConfig {
            bitfile: PathBuf::from("bitfiles/quanticam_192x128.bit"),
            exposure_ms: 10.0,
            mock: true,
        }
    }

    #[test]
    fn test_factory_driver_type() {
        let factory = QuantiCamFactory;
        assert_eq!(factory.driver_type(), "quanticam");
        assert_eq!(factory.name(), "QuantiCam 192x128 SPAD Array");
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = QuantiCamFactory;

        let valid = toml::Value::Table(toml::toml! {
            bitfile = "bitfiles/quanticam_192x128.bit"
        });
        assert!(factory.validate(&valid).is_ok());

        let bad_exposure = toml::Value::Table(toml::toml! {
            bitfile = "bitfiles/quanticam_192x128.bit"
            exposure_ms = 0.0
        });
        assert!(factory.validate(&bad_exposure).is_err());

        let missing_bitfile = toml::Value::Table(toml::toml! {
            exposure_ms = 10.0
        });
        assert!(factory.validate(&missing_bitfile).is_err());
    }

    #[tokio::test]
    async fn test_snap_returns_full_frame() {
        let driver = QuantiCamDriver::new_async(&mock_config()).await.unwrap();

        let frame = driver.snap().await.unwrap();
        assert_eq!(frame.width, FRAME_WIDTH);
        assert_eq!(frame.height, FRAME_HEIGHT);
        assert_eq!(
            frame.pixels.len(),
            (FRAME_WIDTH * FRAME_HEIGHT) as usize
        );
        assert!(frame.mean() > 0.0);
    }

    #[tokio::test]
    async fn test_trigger_requires_arm() {
        let driver = QuantiCamDriver::new_async(&mock_config()).await.unwrap();

        assert!(driver.trigger().await.is_err());
        driver.arm().await.unwrap();
        driver.trigger().await.unwrap();
    }

    #[tokio::test]
    async fn test_exposure_roundtrip_and_limits() {
        let driver = QuantiCamDriver::new_async(&mock_config()).await.unwrap();

        driver.set_exposure_ms(50.0).await.unwrap();
        assert!((driver.get_exposure_ms().await.unwrap() - 50.0).abs() < f64::EPSILON);

        assert!(driver.set_exposure_ms(0.0).await.is_err());
        assert!(driver.set_exposure_ms(-5.0).await.is_err());
    }

    #[tokio::test]
    async fn test_describe_reports_sensor_geometry() {
        let driver = QuantiCamDriver::new_async(&mock_config()).await.unwrap();
        let description = driver.describe();
        assert_eq!(description.kind, "SPAD array sensor");
        assert_eq!(description.extra["frame_size"][0], FRAME_WIDTH);
        assert_eq!(description.extra["stop_clk_hz"], STOP_CLK_HZ);
    }

    #[tokio::test]
    async fn test_resolution_is_fixed() {
        let driver = QuantiCamDriver::new_async(&mock_config()).await.unwrap();
        assert_eq!(driver.resolution(), (FRAME_WIDTH, FRAME_HEIGHT));
    }
}
