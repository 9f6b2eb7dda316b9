//! Magnetometer calibration and accelerometer/magnetometer orientation fusion
//! for a 9-axis sensor streaming over a line-oriented serial link.

pub mod calibration;
pub mod compass;
pub mod config;
pub mod device;
pub mod error;
pub mod filters;
pub mod host;
pub mod protocol;
pub mod sensors;
pub mod types;

pub use calibration::{CalibrationEstimator, CalibrationHandle, CalibrationModel, EstimatorKind};
pub use compass::Direction;
pub use config::TrackerConfig;
pub use device::{Device, DeviceState, FusionEvent, TickOutput};
pub use error::{FusionError, TrackerResult};
pub use filters::{EulerAngles, FqaEstimator, OrientationFix};
pub use host::{HostEvent, HostLink, HostMirror};
pub use protocol::{LineDecoder, TelemetryLine};
