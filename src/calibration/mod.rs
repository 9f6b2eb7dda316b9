pub mod estimator;
pub mod model;

pub use estimator::{
    CalibrationEstimator, EllipsoidEstimator, EstimatorKind, MinMaxEstimator, MIN_SAMPLES,
};
pub use model::{CalibrationHandle, CalibrationModel};
