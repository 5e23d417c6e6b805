//! Stanford Research Systems DG645 Digital Delay Generator Driver
//!
//! Reference: DG645 Remote Programming Manual
//!
//! Protocol Overview:
//! - Format: SCPI-style ASCII over a bare TCP socket (port 5025)
//! - Command terminator: LF (\n); response terminator: CRLF (\r\n)
//! - Commands: TLVL (trigger level), TSRC (trigger source),
//!   DLAY c,d,t (link channel c to channel d plus t seconds)
//! - Queries: *IDN?, *OPC?, LERR? (last error), DLAY?c, TLVL?
//!
//! The instrument keeps an error queue rather than failing commands in-band;
//! after every configuration write the driver drains `LERR?` until it reads
//! `0` and reports anything found.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lab_driver_srs::Dg645Factory;
//! use lab_core::driver::DriverFactory;
//!
//! registry.register_factory(Box::new(Dg645Factory));
//!
//! let config = toml::toml! {
//!     host = "192.168.88.110"
//!     trigger_level = 1.3
//! };
//! let components = factory.build(config.into()).await?;
//! ```

use crate::scpi::{MockScpiClient, ScpiClient, DEFAULT_PORT};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::capabilities::{DelayControl, DeviceCategory, Parameterized, Triggerable};
use lab_core::driver::{Capability, DeviceComponents, DeviceDescription, DriverFactory};
use lab_core::error::LabError;
use lab_core::observable::ParameterSet;
use lab_core::parameter::Parameter;
use serde::Deserialize;
use std::sync::Arc;

// =============================================================================
// Protocol enums
// =============================================================================

/// Trigger source selections (TSRC argument).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Internal = 0,
    ExternalRising = 1,
    ExternalFalling = 2,
    SingleExternalRising = 3,
    SingleExternalFalling = 4,
    Single = 5,
    Line = 6,
}

/// Delay channels (DLAY arguments).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayChannel {
    T0 = 0,
    T1 = 1,
    A = 2,
    B = 3,
    C = 4,
    D = 5,
    E = 6,
    F = 7,
    G = 8,
    H = 9,
}

/// Error codes reported by `LERR?`, grouped as in the programming manual.
///
/// The instrument defines many more; unknown codes are preserved rather than
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    // Device-specific (10-17)
    DeviceDependentError,
    FileSystemError,
    InvalidFileName,
    FileNotFound,
    DiskFull,
    DirectoryNotFound,
    RecallFailed,
    AutoCalFailed,
    // Trigger-related (30-32)
    InvalidTriggerSource,
    InvalidTriggerMode,
    TriggerError,
    // Channel/delay-related (40-44)
    InvalidChannelConfig,
    InvalidDelay,
    InvalidOutputLevel,
    OutputOverload,
    InvalidPolarity,
    // Interface-related (110-126, subset)
    InvalidInterface,
    InvalidAddress,
    InvalidIpAddress,
    // Memory-related (170-171)
    MemoryError,
    MemoryFull,
    // Reserved (254)
    Reserved,
    /// Any code the driver does not classify
    Unknown(u8),
}

impl ErrorCode {
    /// Decode a `LERR?` reply.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::NoError,
            10 => Self::DeviceDependentError,
            11 => Self::FileSystemError,
            12 => Self::InvalidFileName,
            13 => Self::FileNotFound,
            14 => Self::DiskFull,
            15 => Self::DirectoryNotFound,
            16 => Self::RecallFailed,
            17 => Self::AutoCalFailed,
            30 => Self::InvalidTriggerSource,
            31 => Self::InvalidTriggerMode,
            32 => Self::TriggerError,
            40 => Self::InvalidChannelConfig,
            41 => Self::InvalidDelay,
            42 => Self::InvalidOutputLevel,
            43 => Self::OutputOverload,
            44 => Self::InvalidPolarity,
            110 => Self::InvalidInterface,
            111 => Self::InvalidAddress,
            120 => Self::InvalidIpAddress,
            170 => Self::MemoryError,
            171 => Self::MemoryFull,
            254 => Self::Reserved,
            other => Self::Unknown(other),
        }
    }

    /// The numeric code as reported by the instrument.
    pub fn code(&self) -> u8 {
        match self {
            Self::NoError => 0,
            Self::DeviceDependentError => 10,
            Self::FileSystemError => 11,
            Self::InvalidFileName => 12,
            Self::FileNotFound => 13,
            Self::DiskFull => 14,
            Self::DirectoryNotFound => 15,
            Self::RecallFailed => 16,
            Self::AutoCalFailed => 17,
            Self::InvalidTriggerSource => 30,
            Self::InvalidTriggerMode => 31,
            Self::TriggerError => 32,
            Self::InvalidChannelConfig => 40,
            Self::InvalidDelay => 41,
            Self::InvalidOutputLevel => 42,
            Self::OutputOverload => 43,
            Self::InvalidPolarity => 44,
            Self::InvalidInterface => 110,
            Self::InvalidAddress => 111,
            Self::InvalidIpAddress => 120,
            Self::MemoryError => 170,
            Self::MemoryFull => 171,
            Self::Reserved => 254,
            Self::Unknown(code) => *code,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown error code {}", code),
            other => write!(f, "{:?} ({})", other, other.code()),
        }
    }
}

// =============================================================================
// Dg645Factory - DriverFactory implementation
// =============================================================================

/// Configuration for the DG645 driver
#[derive(Debug, Clone, Deserialize)]
pub struct Dg645Config {
    /// Hostname or IP address of the instrument
    pub host: String,

    /// Bare-socket SCPI port (default: 5025)
    #[serde(default = "default_port")]
    pub port: u16,

    /// External trigger level in volts (default: 1.3)
    #[serde(default = "default_trigger_level")]
    pub trigger_level: f64,

    /// Enable mock mode for testing without hardware
    #[serde(default)]
    pub mock: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_trigger_level() -> f64 {
    1.3
}

/// Factory for creating DG645 driver instances.
pub struct Dg645Factory;

/// Static capabilities for the DG645
static DG645_CAPABILITIES: &[Capability] = &[
    Capability::DelayControl,
    Capability::Triggerable,
    Capability::Parameterized,
];

impl DriverFactory for Dg645Factory {
    fn driver_type(&self) -> &'static str {
        "dg645"
    }

    fn name(&self) -> &'static str {
        "Stanford Research Systems DG645 Digital Delay Generator"
    }

    fn capabilities(&self) -> &'static [Capability] {
        DG645_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: Dg645Config = config.clone().try_into()?;
        if cfg.host.is_empty() {
            return Err(anyhow!("DG645 config: 'host' must not be empty"));
        }
        if !cfg.trigger_level.is_finite() || !(-3.5..=3.5).contains(&cfg.trigger_level) {
            return Err(anyhow!(
                "Trigger level {} V out of range (-3.5 to 3.5 V)",
                cfg.trigger_level
            ));
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Dg645Config = config.try_into().context("Invalid DG645 config")?;

            let driver =
                Dg645Driver::new_async(&cfg.host, cfg.port, cfg.trigger_level, cfg.mock).await?;

            Ok(DeviceComponents {
                category: Some(DeviceCategory::DelayGenerator),
                description: Some(driver.describe()),
                delay_control: Some(driver.clone()),
                triggerable: Some(driver.clone()),
                parameterized: Some(driver),
                ..Default::default()
            })
        })
    }
}

// =============================================================================
// SCPI client abstraction (allows mock injection)
// =============================================================================

#[async_trait]
trait ScpiOps: Send + Sync {
    async fn write(&self, command: &str) -> Result<()>;
    async fn query(&self, query: &str) -> Result<String>;
    async fn query_int(&self, query: &str) -> Result<i64>;
}

#[async_trait]
impl ScpiOps for ScpiClient {
    async fn write(&self, command: &str) -> Result<()> {
        self.write(command).await
    }
    async fn query(&self, query: &str) -> Result<String> {
        self.query(query).await
    }
    async fn query_int(&self, query: &str) -> Result<i64> {
        self.query_int(query).await
    }
}

#[async_trait]
impl ScpiOps for MockScpiClient {
    async fn write(&self, command: &str) -> Result<()> {
        self.write(command).await
    }
    async fn query(&self, query: &str) -> Result<String> {
        self.query(query).await
    }
    async fn query_int(&self, query: &str) -> Result<i64> {
        self.query_int(query).await
    }
}

// =============================================================================
// Dg645Driver
// =============================================================================

/// Driver for the DG645 digital delay generator.
///
/// Programs the A output delay relative to T0 and leaves a fixed 20 ns
/// A->B output width so the B edge never collides with the next trigger.
pub struct Dg645Driver {
    client: Arc<dyn ScpiOps>,

    /// Identity string reported by `*IDN?`
    identity: String,

    /// External trigger threshold
    trigger_level: Parameter<f64>,

    /// A-output delay relative to T0
    delay_s: Parameter<f64>,

    /// Parameter registry
    params: Arc<ParameterSet>,
}

impl Dg645Driver {
    /// Connect and initialize the instrument.
    ///
    /// Applies the bench's standing configuration: reset, clear status,
    /// trigger level, external falling trigger, A = T0 + 0, B = A + 20 ns.
    ///
    /// # Errors
    /// Returns error if the socket cannot be opened, the identity string does
    /// not name a DG645, or the instrument queues errors during setup.
    pub async fn new_async(
        host: &str,
        port: u16,
        trigger_level: f64,
        mock: bool,
    ) -> Result<Arc<Self>> {
        let client: Arc<dyn ScpiOps> = if mock {
            tracing::info!("Creating mock DG645 driver");
            Arc::new(MockScpiClient::new())
        } else {
            Arc::new(ScpiClient::connect(host, port).await?)
        };

        let identity = client.query("*IDN?").await.context(
            "DG645 validation failed: no response to identity query (*IDN?)",
        )?;
        if !identity.to_uppercase().contains("DG645") {
            return Err(anyhow!(
                "DG645 validation failed: device identity '{}' doesn't indicate a DG645",
                identity
            ));
        }
        tracing::info!("Delay generator at {}:{} is: {}", host, port, identity);

        let driver = Arc::new(Self::build(client, identity));
        driver.init(trigger_level).await?;
        Ok(driver)
    }

    fn build(client: Arc<dyn ScpiOps>, identity: String) -> Self {
        let mut params = ParameterSet::new();

        let mut trigger_level = Parameter::new("trigger_level_v", default_trigger_level())
            .with_description("External trigger threshold")
            .with_unit("V")
            .with_range(-3.5, 3.5);
        {
            let client = client.clone();
            trigger_level.connect_to_hardware_write(move |level: f64| {
                let client = client.clone();
                Box::pin(async move { write_trigger_level(client.as_ref(), level).await })
            });
        }

        let mut delay_s = Parameter::new("delay_s", 0.0)
            .with_description("A-output delay relative to T0")
            .with_unit("s")
            .with_range(0.0, 2000.0);
        {
            let client = client.clone();
            delay_s.connect_to_hardware_write(move |delay: f64| {
                let client = client.clone();
                Box::pin(async move { write_delay(client.as_ref(), delay).await })
            });
        }

        params.register(trigger_level.clone());
        params.register(delay_s.clone());

        Self {
            client,
            identity,
            trigger_level,
            delay_s,
            params: Arc::new(params),
        }
    }

    /// Standing init sequence, errors drained after each step.
    async fn init(&self, trigger_level: f64) -> Result<()> {
        self.client.write("*RST").await?;
        self.client.write("*CLS").await?;
        self.read_errors().await?;

        self.trigger_level.set(trigger_level).await?;
        self.set_trigger_source(TriggerSource::ExternalFalling)
            .await?;

        // A = T0 + 0
        self.delay_s.set(0.0).await?;
        // B = A + 20ns, enough margin to not hit the next trigger
        self.client
            .write(&format!(
                "DLAY {},{},{:.6e}",
                DelayChannel::B as u8,
                DelayChannel::A as u8,
                20e-9
            ))
            .await?;
        if self.read_errors().await? {
            return Err(anyhow!("DG645 queued errors during initialization"));
        }

        let opc = self.client.query("*OPC?").await;
        if opc.is_err() {
            tracing::warn!("DG645 seems to be not responding to *OPC? query");
        }

        Ok(())
    }

    /// Identity string reported by the instrument.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Static description for the run manifest.
    pub fn describe(&self) -> DeviceDescription {
        DeviceDescription {
            name: "Stanford DG645 Digital Delay Generator".into(),
            kind: "Digital delay generator".into(),
            manufacturer: "Stanford Research Systems".into(),
            datasheet: None,
            extra: serde_json::json!({ "idn": self.identity }),
        }
    }

    /// Select the trigger source.
    pub async fn set_trigger_source(&self, source: TriggerSource) -> Result<()> {
        self.client
            .write(&format!("TSRC {}", source as u8))
            .await?;
        if self.read_errors().await? {
            return Err(anyhow!("DG645 rejected trigger source {:?}", source));
        }
        Ok(())
    }

    /// Trigger level parameter (volts).
    pub fn trigger_level(&self) -> &Parameter<f64> {
        &self.trigger_level
    }

    /// Apply a newline-separated batch of SCPI commands, checking the error
    /// queue after each line.
    pub async fn apply_script(&self, script: &str) -> Result<()> {
        let mut queued = Vec::new();
        for cmd in script.lines() {
            let cmd = cmd.trim();
            if cmd.is_empty() {
                continue;
            }
            self.client.write(cmd).await?;
            queued.extend(self.drain_errors().await?);
        }
        if !queued.is_empty() {
            let codes: Vec<String> = queued.iter().map(|e| e.to_string()).collect();
            return Err(anyhow!(
                "DG645 queued errors while applying script: {}",
                codes.join(", ")
            ));
        }
        tracing::info!(
            "Check operation completed: {}",
            self.client.query("*OPC?").await?
        );
        Ok(())
    }

    /// Drain the error queue, returning every queued code.
    async fn drain_errors(&self) -> Result<Vec<ErrorCode>> {
        let mut errors = Vec::new();
        loop {
            let raw = self.client.query_int("LERR?").await?;
            let code = u8::try_from(raw)
                .map_err(|_| anyhow!("LERR? returned out-of-range code {}", raw))?;
            let err = ErrorCode::from_code(code);
            if err == ErrorCode::NoError {
                break;
            }
            tracing::error!("DG645 error: {}", err);
            errors.push(err);
        }
        Ok(errors)
    }

    /// Drain the error queue; true if anything was queued.
    pub async fn read_errors(&self) -> Result<bool> {
        Ok(!self.drain_errors().await?.is_empty())
    }

    /// Parse a `DLAY?c` reply of the form `"<link>,<delay>"`.
    fn parse_delay_response(response: &str) -> Result<(u8, f64)> {
        let (link, delay) = response.split_once(',').ok_or_else(|| {
            anyhow!("Malformed DLAY? response: {:?}", response)
        })?;
        let link: u8 = link
            .trim()
            .parse()
            .with_context(|| format!("Malformed link channel in DLAY? response: {:?}", response))?;
        let delay: f64 = delay
            .trim()
            .parse()
            .with_context(|| format!("Malformed delay in DLAY? response: {:?}", response))?;
        Ok((link, delay))
    }
}

/// Program the external trigger threshold (one decimal place, per manual).
async fn write_trigger_level(client: &dyn ScpiOps, level: f64) -> Result<(), LabError> {
    client
        .write(&format!("TLVL {:.1}", level))
        .await
        .map_err(|e| LabError::DeviceUnreachable {
            device: "DG645".into(),
            message: e.to_string(),
        })?;
    check_errors(client, "TLVL").await
}

/// Re-link A to T0 with the requested delay.
async fn write_delay(client: &dyn ScpiOps, delay: f64) -> Result<(), LabError> {
    client
        .write(&format!(
            "DLAY {},{},{:.6e}",
            DelayChannel::A as u8,
            DelayChannel::T0 as u8,
            delay
        ))
        .await
        .map_err(|e| LabError::DeviceUnreachable {
            device: "DG645".into(),
            message: e.to_string(),
        })?;
    check_errors(client, "DLAY").await
}

async fn check_errors(client: &dyn ScpiOps, context: &str) -> Result<(), LabError> {
    let mut queued = Vec::new();
    loop {
        let raw = client
            .query_int("LERR?")
            .await
            .map_err(|e| LabError::DeviceUnreachable {
                device: "DG645".into(),
                message: e.to_string(),
            })?;
        let code = u8::try_from(raw).map_err(|_| LabError::MalformedResponse {
            device: "DG645".into(),
            response: raw.to_string(),
        })?;
        let err = ErrorCode::from_code(code);
        if err == ErrorCode::NoError {
            break;
        }
        tracing::error!("DG645 error after {}: {}", context, err);
        queued.push(err);
    }
    if queued.is_empty() {
        Ok(())
    } else {
        Err(LabError::Instrument {
            device: "DG645".into(),
            message: format!(
                "{} rejected: {}",
                context,
                queued
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })
    }
}

#[async_trait]
impl DelayControl for Dg645Driver {
    async fn set_delay(&self, seconds: f64) -> Result<()> {
        self.delay_s.set(seconds).await
    }

    async fn get_delay(&self) -> Result<f64> {
        let response = self
            .client
            .query(&format!("DLAY?{}", DelayChannel::A as u8))
            .await?;
        let (_link, delay) = Self::parse_delay_response(&response)?;
        Ok(delay)
    }
}

#[async_trait]
impl Triggerable for Dg645Driver {
    /// Switch to single-shot trigger mode so `trigger()` fires one delay
    /// cycle.
    async fn arm(&self) -> Result<()> {
        self.set_trigger_source(TriggerSource::Single).await
    }

    async fn trigger(&self) -> Result<()> {
        self.client.write("*TRG").await?;
        if self.read_errors().await? {
            return Err(anyhow!("DG645 rejected software trigger"));
        }
        Ok(())
    }
}

impl Parameterized for Dg645Driver {
    fn parameters(&self) -> &ParameterSet {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_driver_type() {
        let factory = Dg645Factory;
        assert_eq!(factory.driver_type(), "dg645");
        assert_eq!(
            factory.name(),
            "Stanford Research Systems DG645 Digital Delay Generator"
        );
    }

    #[test]
    fn test_factory_capabilities() {
        let factory = Dg645Factory;
        let caps = factory.capabilities();
        assert!(caps.contains(&Capability::DelayControl));
        assert!(caps.contains(&Capability::Triggerable));
        assert!(caps.contains(&Capability::Parameterized));
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = Dg645Factory;

        let valid = toml::Value::Table(toml::toml! {
            host = "192.168.88.110"
        });
        assert!(factory.validate(&valid).is_ok());

        let bad_level = toml::Value::Table(toml::toml! {
            host = "192.168.88.110"
            trigger_level = 9.0
        });
        assert!(factory.validate(&bad_level).is_err());

        let missing_host = toml::Value::Table(toml::toml! {
            trigger_level = 1.3
        });
        assert!(factory.validate(&missing_host).is_err());
    }

    #[test]
    fn test_error_code_roundtrip() {
        for code in [0u8, 10, 17, 30, 32, 41, 44, 110, 170, 254] {
            assert_eq!(ErrorCode::from_code(code).code(), code);
        }
        assert_eq!(ErrorCode::from_code(99), ErrorCode::Unknown(99));
        assert_eq!(ErrorCode::Unknown(99).code(), 99);
    }

    #[test]
    fn test_parse_delay_response() {
        let (link, delay) = Dg645Driver::parse_delay_response("0,+0.000240000000").unwrap();
        assert_eq!(link, 0);
        assert!((delay - 2.4e-4).abs() < 1e-12);

        assert!(Dg645Driver::parse_delay_response("garbage").is_err());
        assert!(Dg645Driver::parse_delay_response("0,notanumber").is_err());
    }

    #[tokio::test]
    async fn test_mock_driver_init_and_delay() {
        let driver = Dg645Driver::new_async("unused", DEFAULT_PORT, 1.3, true)
            .await
            .unwrap();

        assert!(driver.identity().contains("DG645"));

        driver.set_delay(2.4e-4).await.unwrap();
        let delay = driver.get_delay().await.unwrap();
        assert!((delay - 2.4e-4).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_mock_driver_rejects_out_of_range_delay() {
        let driver = Dg645Driver::new_async("unused", DEFAULT_PORT, 1.3, true)
            .await
            .unwrap();
        // Range validation fires before any command is sent
        assert!(driver.set_delay(-1.0).await.is_err());
        assert!((driver.get_delay().await.unwrap() - 0.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_mock_driver_trigger() {
        let driver = Dg645Driver::new_async("unused", DEFAULT_PORT, 1.3, true)
            .await
            .unwrap();
        driver.arm().await.unwrap();
        driver.trigger().await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_script_reports_queued_errors() {
        let driver = Dg645Driver::new_async("unused", DEFAULT_PORT, 1.3, true)
            .await
            .unwrap();

        // Valid batch passes
        driver
            .apply_script("TLVL 0.5\nDLAY 2,0,1e-6")
            .await
            .unwrap();

        // A bad command queues an error that surfaces
        let result = driver.apply_script("BOGUS 1").await;
        assert!(result.is_err());
    }
}
