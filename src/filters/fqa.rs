//! Factored quaternion attitude estimation
//!
//! Attitude is resolved in two independent stages and then composed:
//!   1. Tilt: roll and pitch from the gravity reaction measured by the accelerometer.
//!   2. Azimuth: yaw from the magnetic field once it is rotated into the
//!      leveled frame and projected onto the horizontal plane.
//!
//! Frames: the leveled frame has +Z along the accelerometer reaction (up for a
//! sensor at rest). Yaw is the azimuth of the horizontal field component in
//! that frame, counter-clockwise positive, so a field along the sensor's +X
//! reads yaw 0 and a field along +Y reads yaw +π/2.
//!
//! The estimator is memoryless apart from the last good yaw and quaternion,
//! which are what degenerate ticks fall back to.

use nalgebra::Vector3;

use crate::config::FusionConfig;
use crate::error::{FusionError, TrackerResult};
use crate::filters::euler::{wrap_angle, EulerAngles};
use crate::types::{Mat3, Quat, Vec3, NORM_EPSILON, UNIT_TOLERANCE};

/// Output of one tick. Always present, even when the inputs were degenerate.
#[derive(Clone, Debug, PartialEq)]
pub struct OrientationFix {
    pub quaternion: Quat,
    pub euler: EulerAngles,
    /// False when any part of the attitude was carried over from an earlier tick
    pub reliable: bool,
    pub fault: Option<FusionError>,
}

pub struct FqaEstimator {
    accel_min_norm: f64,
    mag_min_norm: f64,
    horizontal_min_ratio: f64,
    declination_rad: f64,

    last_yaw: f64,
    last_quaternion: Quat,
}

impl FqaEstimator {
    pub fn new(config: &FusionConfig) -> Self {
        Self {
            accel_min_norm: config.accel_min_norm.max(NORM_EPSILON),
            mag_min_norm: config.mag_min_norm.max(NORM_EPSILON),
            horizontal_min_ratio: config.horizontal_min_ratio.max(NORM_EPSILON),
            declination_rad: config.declination_rad,
            last_yaw: 0.0,
            last_quaternion: Quat::identity(),
        }
    }

    pub fn last_yaw(&self) -> f64 {
        self.last_yaw
    }

    pub fn last_quaternion(&self) -> Quat {
        self.last_quaternion
    }

    // ── Stage 1: tilt ────────────────────────────────────────────────────

    /// Rotation taking the sensor frame to the leveled frame.
    ///
    /// Fails with `DegenerateAccel` when the reading is too small to define "down".
    pub fn tilt(&self, accel: &Vec3) -> TrackerResult<Quat> {
        let norm = accel.norm();
        if !norm.is_finite() || norm < self.accel_min_norm {
            return Err(FusionError::DegenerateAccel { norm });
        }
        let a = accel / norm;

        // atan2 keeps both angles defined at ±90° pitch, where ay = az = 0.
        let roll = a.y.atan2(a.z);
        let pitch = (-a.x).atan2(a.y.hypot(a.z));

        let q_roll = Quat::from_axis_angle(&Vector3::x_axis(), roll);
        let q_pitch = Quat::from_axis_angle(&Vector3::y_axis(), pitch);
        Ok(q_pitch * q_roll)
    }

    // ── Stage 2: azimuth ─────────────────────────────────────────────────

    /// Yaw that aligns the reference north axis with the horizontal field.
    ///
    /// Fails with `DegenerateMag` when the field is (anti)parallel to gravity.
    pub fn azimuth(&self, tilt: &Quat, mag: &Vec3) -> TrackerResult<f64> {
        let norm = mag.norm();
        if !norm.is_finite() || norm < self.mag_min_norm {
            return Err(FusionError::DegenerateMag { horizontal: 0.0 });
        }
        let leveled = tilt.transform_vector(&(mag / norm));
        let horizontal = leveled.x.hypot(leveled.y);
        if horizontal < self.horizontal_min_ratio {
            return Err(FusionError::DegenerateMag { horizontal });
        }
        Ok(wrap_angle(leveled.y.atan2(leveled.x) - self.declination_rad))
    }

    /// Full attitude from one accelerometer and one calibrated magnetometer vector.
    ///
    /// On success the fallback state advances. On any error it is left untouched.
    pub fn estimate(&mut self, accel: &Vec3, mag: &Vec3) -> TrackerResult<Quat> {
        let tilt = self.tilt(accel)?;
        let yaw = self.azimuth(&tilt, mag)?;
        let q = compose(yaw, &tilt);

        self.last_yaw = yaw;
        self.last_quaternion = q;
        Ok(q)
    }

    /// Total variant of `estimate` for the sampling loop.
    ///
    /// Degenerate field: fresh tilt with the previous yaw. Degenerate accel:
    /// the previous quaternion unchanged. Both come back flagged unreliable.
    pub fn update(&mut self, accel: &Vec3, mag: &Vec3) -> OrientationFix {
        match self.estimate(accel, mag) {
            Ok(q) => OrientationFix {
                quaternion: q,
                euler: EulerAngles::from_quaternion(&q),
                reliable: true,
                fault: None,
            },
            Err(fault @ FusionError::DegenerateMag { .. }) => {
                log::debug!("{}; holding yaw {:.3}", fault, self.last_yaw);
                // tilt() already succeeded inside estimate()
                let q = match self.tilt(accel) {
                    Ok(tilt) => compose(self.last_yaw, &tilt),
                    Err(_) => self.last_quaternion,
                };
                OrientationFix {
                    quaternion: q,
                    euler: EulerAngles::from_quaternion(&q),
                    reliable: false,
                    fault: Some(fault),
                }
            }
            Err(fault) => {
                log::debug!("{}; repeating previous attitude", fault);
                let q = self.last_quaternion;
                OrientationFix {
                    quaternion: q,
                    euler: EulerAngles::from_quaternion(&q),
                    reliable: false,
                    fault: Some(fault),
                }
            }
        }
    }
}

/// azimuth ∘ tilt, renormalized against accumulated rounding.
fn compose(yaw: f64, tilt: &Quat) -> Quat {
    let q_yaw = Quat::from_axis_angle(&Vector3::z_axis(), yaw);
    let mut q = q_yaw * *tilt;
    if (q.norm() - 1.0).abs() > UNIT_TOLERANCE {
        q.renormalize();
    }
    q
}

/// 3×3 rotation matrix for the visualization layer.
pub fn rotation_matrix(q: &Quat) -> Mat3 {
    q.to_rotation_matrix().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use std::f64::consts::{FRAC_PI_2, PI};

    fn estimator() -> FqaEstimator {
        FqaEstimator::new(&FusionConfig::default())
    }

    /// Body-frame readings for a known attitude, with magnetic dip.
    fn readings(roll: f64, pitch: f64, yaw: f64, dip: f64) -> (Vec3, Vec3) {
        let tilt = Quat::from_euler_angles(roll, pitch, 0.0);
        let up = Vec3::new(0.0, 0.0, 1.0);
        let field = Vec3::new(yaw.cos() * dip.cos(), yaw.sin() * dip.cos(), -dip.sin());
        (tilt.inverse() * up, tilt.inverse() * field)
    }

    #[test]
    fn test_flat_pointing_north() {
        let mut fqa = estimator();
        let q = fqa
            .estimate(&Vec3::new(0.0, 0.0, 1.0), &Vec3::new(1.0, 0.0, 0.0))
            .unwrap();
        let e = EulerAngles::from_quaternion(&q);
        assert_abs_diff_eq!(e.yaw, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(e.pitch, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(e.roll, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_flat_pointing_east() {
        let mut fqa = estimator();
        let q = fqa
            .estimate(&Vec3::new(0.0, 0.0, 1.0), &Vec3::new(0.0, 1.0, 0.0))
            .unwrap();
        let e = EulerAngles::from_quaternion(&q);
        assert_abs_diff_eq!(e.yaw, FRAC_PI_2, epsilon = 1e-12);
        assert_abs_diff_eq!(e.pitch, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(e.roll, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_recovers_known_attitude() {
        let cases = [
            (0.3, -0.4, 1.2),
            (-2.5, 0.7, -3.0),
            (1.0, 1.2, 0.1),
            (0.0, -1.5, 2.0),
        ];
        for (roll, pitch, yaw) in cases {
            let (accel, mag) = readings(roll, pitch, yaw, 1.1);
            let mut fqa = estimator();
            let q = fqa.estimate(&(accel * 980.0), &(mag * 48.0)).unwrap();
            let e = EulerAngles::from_quaternion(&q);
            assert_abs_diff_eq!(e.roll, roll, epsilon = 1e-9);
            assert_abs_diff_eq!(e.pitch, pitch, epsilon = 1e-9);
            assert_abs_diff_eq!(e.yaw, yaw, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_unit_norm_over_sweep() {
        let mut fqa = estimator();
        for i in 0..24 {
            for j in 0..12 {
                let roll = -PI + 2.0 * PI * i as f64 / 24.0;
                let pitch = -1.5 + 3.0 * j as f64 / 12.0;
                let (accel, mag) = readings(roll, pitch, 0.1 * i as f64, 0.9);
                let q = fqa.estimate(&accel, &mag).unwrap();
                assert_relative_eq!(q.norm(), 1.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_zero_accel_is_degenerate_and_state_kept() {
        let mut fqa = estimator();
        let good = fqa
            .estimate(&Vec3::new(0.0, 0.0, 1.0), &Vec3::new(0.0, 1.0, 0.0))
            .unwrap();

        let err = fqa
            .estimate(&Vec3::new(0.0, 0.0, 1e-6), &Vec3::new(1.0, 0.0, 0.0))
            .unwrap_err();
        assert!(matches!(err, FusionError::DegenerateAccel { .. }));
        assert_eq!(fqa.last_quaternion(), good);
        assert_abs_diff_eq!(fqa.last_yaw(), FRAC_PI_2, epsilon = 1e-12);

        let fix = fqa.update(&Vec3::zeros(), &Vec3::new(1.0, 0.0, 0.0));
        assert!(!fix.reliable);
        assert_eq!(fix.quaternion, good);
    }

    #[test]
    fn test_field_along_gravity_holds_yaw() {
        let mut fqa = estimator();
        fqa.estimate(&Vec3::new(0.0, 0.0, 1.0), &Vec3::new(0.0, 1.0, 0.0))
            .unwrap();

        // Tilted 0.2 rad in roll, field straight down the gravity axis.
        let (accel, _) = readings(0.2, 0.0, 0.0, 0.0);
        let mag = -accel;
        assert!(matches!(
            fqa.estimate(&accel, &mag),
            Err(FusionError::DegenerateMag { .. })
        ));

        let fix = fqa.update(&accel, &mag);
        assert!(!fix.reliable);
        assert!(matches!(fix.fault, Some(FusionError::DegenerateMag { .. })));
        assert_abs_diff_eq!(fix.euler.yaw, FRAC_PI_2, epsilon = 1e-12);
        assert_abs_diff_eq!(fix.euler.roll, 0.2, epsilon = 1e-12);
        // The held yaw is not overwritten by a degenerate tick.
        assert_abs_diff_eq!(fqa.last_yaw(), FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_field_is_degenerate() {
        let fqa = estimator();
        let tilt = fqa.tilt(&Vec3::new(0.0, 0.0, 1.0)).unwrap();
        assert!(fqa.azimuth(&tilt, &Vec3::zeros()).is_err());
    }

    #[test]
    fn test_upside_down() {
        let mut fqa = estimator();
        let q = fqa
            .estimate(&Vec3::new(0.0, 0.0, -1.0), &Vec3::new(1.0, 0.0, 0.0))
            .unwrap();
        let e = EulerAngles::from_quaternion(&q);
        assert_abs_diff_eq!(e.roll.abs(), PI, epsilon = 1e-12);
        assert_abs_diff_eq!(e.pitch, 0.0, epsilon = 1e-12);
        assert_relative_eq!(q.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_declination_shifts_yaw() {
        let config = FusionConfig {
            declination_rad: 0.1,
            ..FusionConfig::default()
        };
        let mut fqa = FqaEstimator::new(&config);
        fqa.estimate(&Vec3::new(0.0, 0.0, 1.0), &Vec3::new(1.0, 0.0, 0.0))
            .unwrap();
        assert_abs_diff_eq!(fqa.last_yaw(), -0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_rotation_matrix_maps_body_to_leveled() {
        let (accel, _) = readings(0.4, -0.2, 0.0, 0.0);
        let fqa = estimator();
        let tilt = fqa.tilt(&accel).unwrap();
        let up = rotation_matrix(&tilt) * accel;
        assert_relative_eq!(up, Vec3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
    }
}
