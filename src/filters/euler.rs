use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::types::Quat;

/// Aerospace Z-Y-X angles in radians.
///
/// yaw and roll lie in [-π, π), pitch in [-π/2, π/2].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EulerAngles {
    pub yaw: f64,
    pub pitch: f64,
    pub roll: f64,
}

impl EulerAngles {
    pub fn new(yaw: f64, pitch: f64, roll: f64) -> Self {
        Self { yaw, pitch, roll }
    }

    /// Total for every unit quaternion. The pitch argument is clamped to the
    /// asin domain, since rounding pushes it past ±1 at exactly ±90°.
    pub fn from_quaternion(q: &Quat) -> Self {
        let (w, x, y, z) = (q.w, q.i, q.j, q.k);

        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
        let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));

        Self {
            yaw: wrap_angle(yaw),
            pitch,
            roll: wrap_angle(roll),
        }
    }

    pub fn to_quaternion(&self) -> Quat {
        Quat::from_euler_angles(self.roll, self.pitch, self.yaw)
    }

    pub fn to_degrees(&self) -> Self {
        Self {
            yaw: self.yaw.to_degrees(),
            pitch: self.pitch.to_degrees(),
            roll: self.roll.to_degrees(),
        }
    }
}

/// Wrap any finite angle into [-π, π).
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    // rem_euclid can round up to exactly 2π for tiny negative inputs
    if wrapped >= PI {
        wrapped - 2.0 * PI
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Quaternion;
    use std::f64::consts::{FRAC_1_SQRT_2, FRAC_PI_2};

    fn in_range(e: &EulerAngles) -> bool {
        (-PI..PI).contains(&e.yaw)
            && (-FRAC_PI_2..=FRAC_PI_2).contains(&e.pitch)
            && (-PI..PI).contains(&e.roll)
    }

    #[test]
    fn test_identity() {
        let e = EulerAngles::from_quaternion(&Quat::identity());
        assert_abs_diff_eq!(e.yaw, 0.0);
        assert_abs_diff_eq!(e.pitch, 0.0);
        assert_abs_diff_eq!(e.roll, 0.0);
    }

    #[test]
    fn test_matches_construction_angles() {
        let e = EulerAngles::new(1.2, -0.4, 0.3);
        let back = EulerAngles::from_quaternion(&e.to_quaternion());
        assert_abs_diff_eq!(back.yaw, 1.2, epsilon = 1e-12);
        assert_abs_diff_eq!(back.pitch, -0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(back.roll, 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_pitch_at_pole_is_not_nan() {
        // 2 * (1/√2)² rounds to slightly above 1.
        let q = Quat::new_unchecked(Quaternion::new(FRAC_1_SQRT_2, 0.0, FRAC_1_SQRT_2, 0.0));
        assert!(2.0 * q.w * q.j > 1.0);
        let e = EulerAngles::from_quaternion(&q);
        assert!(!e.pitch.is_nan());
        assert_abs_diff_eq!(e.pitch, FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn test_ranges_over_sweep() {
        let steps = 16;
        for i in 0..=steps {
            for j in 0..=steps {
                for k in 0..=steps {
                    let roll = -PI + 2.0 * PI * i as f64 / steps as f64;
                    let pitch = -FRAC_PI_2 + PI * j as f64 / steps as f64;
                    let yaw = -PI + 2.0 * PI * k as f64 / steps as f64;
                    let q = Quat::from_euler_angles(roll, pitch, yaw);
                    let e = EulerAngles::from_quaternion(&q);
                    assert!(in_range(&e), "{:?} out of range", e);
                }
            }
        }
    }

    #[test]
    fn test_half_turn_yaw_wraps_to_negative_pi() {
        let q = Quat::from_euler_angles(0.0, 0.0, PI);
        let e = EulerAngles::from_quaternion(&q);
        assert_abs_diff_eq!(e.yaw.abs(), PI, epsilon = 1e-12);
        assert!(e.yaw < PI);
    }

    #[test]
    fn test_wrap_angle() {
        assert_abs_diff_eq!(wrap_angle(PI), -PI);
        assert_abs_diff_eq!(wrap_angle(-PI), -PI);
        assert_abs_diff_eq!(wrap_angle(3.0 * PI / 2.0), -FRAC_PI_2, epsilon = 1e-12);
        assert_abs_diff_eq!(wrap_angle(0.25), 0.25, epsilon = 1e-15);
        assert!(wrap_angle(-1e-17) < PI);
    }

    #[test]
    fn test_degrees() {
        let e = EulerAngles::new(FRAC_PI_2, 0.0, -PI).to_degrees();
        assert_abs_diff_eq!(e.yaw, 90.0, epsilon = 1e-12);
        assert_abs_diff_eq!(e.roll, -180.0, epsilon = 1e-12);
    }
}
