pub mod euler;
pub mod fqa;

pub use euler::{wrap_angle, EulerAngles};
pub use fqa::{rotation_matrix, FqaEstimator, OrientationFix};
