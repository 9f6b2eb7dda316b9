use thiserror::Error;

/// Wire-level decoding failures. Always recoverable: the offending line is dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Empty line")]
    Empty,

    #[error("No known prefix in line")]
    UnknownPrefix,

    #[error("Expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },

    #[error("Invalid number: {0}")]
    InvalidNumber(String),
}

/// Why a collected magnetometer batch could not produce a model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InsufficientData {
    #[error("{samples} samples, {required} required")]
    TooFewSamples { samples: usize, required: usize },

    #[error("axis {axis} has no spread")]
    FlatAxis { axis: usize },

    #[error("samples do not describe an ellipsoid")]
    NotEllipsoid,
}

/// Tracker error types
///
/// None of these are fatal to the sampling loop; callers downgrade them to
/// events and keep producing best-effort output.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("Invalid calibration: {0}")]
    Configuration(String),

    #[error("Insufficient calibration data: {0}")]
    CalibrationInsufficientData(InsufficientData),

    #[error("Accelerometer magnitude {norm} too small to resolve tilt")]
    DegenerateAccel { norm: f64 },

    #[error("Magnetic field has no horizontal component ({horizontal})")]
    DegenerateMag { horizontal: f64 },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Link closed")]
    NotConnected,

    #[error("Timed out waiting for calibration response")]
    Timeout,
}

impl FusionError {
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, FusionError::CalibrationInsufficientData(_))
    }
}

impl From<std::io::Error> for FusionError {
    fn from(err: std::io::Error) -> Self {
        FusionError::Io(err.to_string())
    }
}

/// Result type for tracker operations
pub type TrackerResult<T> = Result<T, FusionError>;
