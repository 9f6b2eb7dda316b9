pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// Gyroscope + accelerometer pair from one sensor tick, in sensor-native units.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub gyro: Vec3,
    pub accel: Vec3,
}

impl RawSample {
    pub fn new(gyro: Vec3, accel: Vec3) -> Self {
        Self { gyro, accel }
    }
}

/// Uncalibrated magnetometer reading.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MagSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl MagSample {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn as_vec3(&self) -> Vec3 {
        Vec3::new(self.x, self.y, self.z)
    }

    pub fn magnitude(&self) -> f64 {
        self.as_vec3().norm()
    }
}

impl From<Vec3> for MagSample {
    fn from(v: Vec3) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

/// Everything the driver loop hands over in one tick.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorTick {
    /// Seconds on the producer's monotonic clock
    pub timestamp: f64,
    pub raw: RawSample,
    pub mag: MagSample,
}

/// Payload of one `Measurement:` line.
///
/// `leading` is the raw gyro vector for current firmware and the calibrated
/// magnetometer for legacy firmware; see `ProtocolConfig::leading_triple`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub leading: Vec3,
    pub accel: Vec3,
}

impl Measurement {
    pub fn new(leading: Vec3, accel: Vec3) -> Self {
        Self { leading, accel }
    }
}
