//! Synthetic IMU + magnetometer source for simulation and tests.
//!
//! The body sways in roll and pitch while turning slowly in heading. The
//! magnetometer reading is pushed through a known hard/soft-iron distortion,
//! so a device configured with the same model (or one that calibrates against
//! it) reproduces the true attitude.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, Duration};

use crate::calibration::CalibrationModel;
use crate::filters::{wrap_angle, EulerAngles};
use crate::types::{MagSample, Quat, RawSample, SensorTick, Vec3};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticMotion {
    pub rate_hz: f64,
    /// Accelerometer reading at rest, sensor units
    pub gravity: f64,
    /// Inclination of the earth field below the horizon
    pub dip_rad: f64,
    /// Heading rate, rad/s
    pub turn_rate: f64,
    pub roll_amplitude: f64,
    pub pitch_amplitude: f64,
    /// Maps the unit field onto raw counts; the inverse of a calibration
    pub distortion: CalibrationModel,
}

impl Default for SyntheticMotion {
    fn default() -> Self {
        Self {
            rate_hz: 50.0,
            gravity: 9.81,
            dip_rad: 1.1,
            turn_rate: 2.0 * PI / 20.0,
            roll_amplitude: 0.3,
            pitch_amplitude: 0.4,
            distortion: CalibrationModel::factory(),
        }
    }
}

pub struct SyntheticImu {
    motion: SyntheticMotion,
    index: u64,
}

impl SyntheticImu {
    pub fn new(motion: SyntheticMotion) -> Self {
        Self { motion, index: 0 }
    }

    pub fn motion(&self) -> &SyntheticMotion {
        &self.motion
    }

    /// Attitude in the convention the fusion filter reports.
    pub fn truth_at(&self, t: f64) -> EulerAngles {
        let m = &self.motion;
        EulerAngles::new(
            wrap_angle(m.turn_rate * t),
            m.pitch_amplitude * (0.7 * t).sin(),
            m.roll_amplitude * (0.5 * t).sin(),
        )
    }

    pub fn sample_at(&self, t: f64) -> SensorTick {
        let m = &self.motion;
        let truth = self.truth_at(t);

        let tilt = Quat::from_euler_angles(truth.roll, truth.pitch, 0.0);
        let up = Vec3::new(0.0, 0.0, 1.0);
        let field = Vec3::new(
            truth.yaw.cos() * m.dip_rad.cos(),
            truth.yaw.sin() * m.dip_rad.cos(),
            -m.dip_rad.sin(),
        );
        let accel = tilt.inverse_transform_vector(&up) * m.gravity;
        let unit_field = tilt.inverse_transform_vector(&field);
        let raw_mag = m.distortion.center + m.distortion.scale.component_mul(&unit_field);

        // Euler rates; close enough to body rates for a synthetic gyro.
        let gyro = Vec3::new(
            m.roll_amplitude * 0.5 * (0.5 * t).cos(),
            m.pitch_amplitude * 0.7 * (0.7 * t).cos(),
            m.turn_rate,
        );

        SensorTick {
            timestamp: t,
            raw: RawSample::new(gyro, accel),
            mag: MagSample::from(raw_mag),
        }
    }
}

impl Iterator for SyntheticImu {
    type Item = SensorTick;

    fn next(&mut self) -> Option<SensorTick> {
        let t = self.index as f64 / self.motion.rate_hz.max(1e-3);
        self.index += 1;
        Some(self.sample_at(t))
    }
}

/// Paced producer: one tick per sample period until `limit` ticks or the
/// receiver goes away. A full channel drops the tick, as a busy bus would.
pub async fn sensor_loop(tx: Sender<SensorTick>, mut imu: SyntheticImu, limit: Option<u64>) -> u64 {
    let period = Duration::from_secs_f64(1.0 / imu.motion().rate_hz.max(1e-3));
    let mut interval = interval(period);
    let mut sent = 0u64;
    let mut produced = 0u64;

    while limit.map_or(true, |l| produced < l) {
        interval.tick().await;
        let Some(tick) = imu.next() else { break };
        produced += 1;

        match tx.try_send(tick) {
            Ok(()) => {
                sent += 1;
                if sent % 500 == 0 {
                    log::debug!("[sensors] {} ticks", sent);
                }
            }
            Err(TrySendError::Closed(_)) => {
                log::info!("[sensors] Channel closed after {} ticks", sent);
                break;
            }
            Err(TrySendError::Full(_)) => {
                log::trace!("[sensors] Channel full, dropping tick at t={:.3}", tick.timestamp);
            }
        }
    }
    sent
}
