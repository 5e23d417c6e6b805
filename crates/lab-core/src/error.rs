//! Error types shared by all instrument drivers.
//!
//! [`LabError`] is the single error enum for the workspace. Drivers surface
//! failures to the caller as typed conditions; nothing is retried or
//! recovered internally, the owning script decides what to do.

use thiserror::Error;

/// Convenience alias for results using the workspace error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Primary error type for instrument drivers.
///
/// Errors fall into three groups:
///
/// 1. **Connection** (`DeviceUnreachable`, `Rpc`, `Io`): the transport to the
///    device (TCP socket, gRPC channel, serial/USBTMC node) failed to open or
///    dropped mid-command.
/// 2. **Protocol** (`MalformedResponse`, `UnsupportedParameter`): the device
///    answered, but not in a form the driver can use.
/// 3. **Calibration** (`NoCalibrationData`, `OutOfCalibrationRange`): a
///    requested physical quantity cannot be mapped to a device setpoint from
///    the stored characterisation data. Never extrapolated silently.
#[derive(Error, Debug)]
pub enum LabError {
    /// The device could not be reached or stopped responding.
    #[error("{device} unreachable: {message}")]
    DeviceUnreachable { device: String, message: String },

    /// The device replied with something the driver cannot parse.
    #[error("{device} returned malformed response: {response:?}")]
    MalformedResponse { device: String, response: String },

    /// The named parameter is not supported by this device.
    #[error("{device} does not support parameter '{name}'")]
    UnsupportedParameter { device: String, name: String },

    /// No calibration entries exist for the requested wavelength.
    #[error("no calibration data for {wavelength_nm} nm")]
    NoCalibrationData { wavelength_nm: u32 },

    /// The requested quantity falls outside the calibrated span.
    #[error("requested {requested:.3e} outside calibrated span [{min:.3e}, {max:.3e}]")]
    OutOfCalibrationRange { requested: f64, min: f64, max: f64 },

    /// The device accepted the transport but rejected the command.
    #[error("{device} error: {message}")]
    Instrument { device: String, message: String },

    /// Driver configuration is syntactically valid but semantically wrong.
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying I/O failure (file, socket, serial port).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote procedure call failed (transport or status).
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Attempted to modify a read-only parameter.
    #[error("parameter is read-only")]
    ParameterReadOnly,

    /// Value is not one of the parameter's allowed choices.
    #[error("invalid choice for parameter")]
    ParameterInvalidChoice,

    /// No hardware reader connected for parameter.
    #[error("no hardware reader connected")]
    ParameterNoHardwareReader,

    /// Requested functionality was not compiled in.
    #[error("feature '{0}' is not enabled. Rebuild with --features {0}")]
    FeatureNotEnabled(String),
}
