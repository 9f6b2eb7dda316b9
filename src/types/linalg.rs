//! Linear algebra aliases for the calibration and fusion code
//!
//! Everything runs in f64; the device side converts sensor-native integers
//! once at the sample boundary.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

pub type Vec3 = Vector3<f64>;
pub type Mat3 = Matrix3<f64>;
pub type Quat = UnitQuaternion<f64>;

// ===== Tolerances =====
pub const NORM_EPSILON: f64 = 1e-12;  // below this a vector has no direction
pub const UNIT_TOLERANCE: f64 = 1e-9; // allowed |q| drift before renormalizing

/// Component-wise division, `None` if any divisor is zero or not finite.
pub fn checked_component_div(num: &Vec3, den: &Vec3) -> Option<Vec3> {
    if den.iter().any(|d| *d == 0.0 || !d.is_finite()) {
        return None;
    }
    Some(num.component_div(den))
}
