//! Fitting a `CalibrationModel` from a batch of raw magnetometer samples
//! collected while the sensor is rotated through many orientations.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::calibration::model::CalibrationModel;
use crate::error::{FusionError, InsufficientData, TrackerResult};
use crate::types::{MagSample, Vec3};

/// Smallest batch that can touch both extremes of all three axes.
pub const MIN_SAMPLES: usize = 6;

pub trait CalibrationEstimator {
    fn estimate(&self, samples: &[MagSample]) -> TrackerResult<CalibrationModel>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    MinMax,
    Ellipsoid,
}

impl EstimatorKind {
    pub fn build(self, min_samples: usize) -> Box<dyn CalibrationEstimator + Send + Sync> {
        match self {
            EstimatorKind::MinMax => Box::new(MinMaxEstimator::new(min_samples)),
            EstimatorKind::Ellipsoid => Box::new(EllipsoidEstimator::new(min_samples)),
        }
    }
}

impl std::str::FromStr for EstimatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "min_max" | "minmax" => Ok(EstimatorKind::MinMax),
            "ellipsoid" => Ok(EstimatorKind::Ellipsoid),
            other => Err(format!("unknown calibration method '{}'", other)),
        }
    }
}

fn require_samples(samples: &[MagSample], required: usize) -> TrackerResult<()> {
    if samples.len() < required {
        return Err(FusionError::CalibrationInsufficientData(
            InsufficientData::TooFewSamples {
                samples: samples.len(),
                required,
            },
        ));
    }
    Ok(())
}

/// Per-axis (min, max) over the batch.
fn axis_extents(samples: &[MagSample]) -> (Vec3, Vec3) {
    let mut min = Vec3::repeat(f64::INFINITY);
    let mut max = Vec3::repeat(f64::NEG_INFINITY);
    for s in samples {
        let v = s.as_vec3();
        min = min.inf(&v);
        max = max.sup(&v);
    }
    (min, max)
}

// ─── Min/max (hard-iron + per-axis scale) ────────────────────────────────────

/// `center = (max + min) / 2`, `scale = (max - min) / 2`, `radius = mean(scale)`.
#[derive(Clone, Copy, Debug)]
pub struct MinMaxEstimator {
    min_samples: usize,
}

impl MinMaxEstimator {
    pub fn new(min_samples: usize) -> Self {
        Self {
            min_samples: min_samples.max(MIN_SAMPLES),
        }
    }
}

impl Default for MinMaxEstimator {
    fn default() -> Self {
        Self::new(MIN_SAMPLES)
    }
}

impl CalibrationEstimator for MinMaxEstimator {
    fn estimate(&self, samples: &[MagSample]) -> TrackerResult<CalibrationModel> {
        require_samples(samples, self.min_samples)?;

        let (min, max) = axis_extents(samples);
        let span = max - min;
        if let Some(axis) = span.iter().position(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(FusionError::CalibrationInsufficientData(
                InsufficientData::FlatAxis { axis },
            ));
        }

        let center = (max + min) / 2.0;
        let scale = span / 2.0;
        let radius = scale.mean();

        let model = CalibrationModel::new(center, scale, radius);
        model.validate()?;
        Ok(model)
    }
}

// ─── Axis-aligned least-squares ellipsoid ────────────────────────────────────

/// Fits `a x² + b y² + c z² + d x + e y + f z = 1` over the batch.
///
/// Completing the square gives center `(-d/2a, -e/2b, -f/2c)` and semi-axes
/// `sqrt(g/a)`, `sqrt(g/b)`, `sqrt(g/c)` with `g = 1 + d²/4a + e²/4b + f²/4c`.
/// Same contract as `MinMaxEstimator`, less sensitive to a single outlier.
#[derive(Clone, Copy, Debug)]
pub struct EllipsoidEstimator {
    min_samples: usize,
}

impl EllipsoidEstimator {
    pub fn new(min_samples: usize) -> Self {
        Self {
            min_samples: min_samples.max(MIN_SAMPLES),
        }
    }
}

impl Default for EllipsoidEstimator {
    fn default() -> Self {
        Self::new(MIN_SAMPLES)
    }
}

impl CalibrationEstimator for EllipsoidEstimator {
    fn estimate(&self, samples: &[MagSample]) -> TrackerResult<CalibrationModel> {
        require_samples(samples, self.min_samples)?;

        // Condition the system around the batch bounding box before fitting.
        let (min, max) = axis_extents(samples);
        let span = max - min;
        if let Some(axis) = span.iter().position(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(FusionError::CalibrationInsufficientData(
                InsufficientData::FlatAxis { axis },
            ));
        }
        let mid = (max + min) / 2.0;
        let half = span / 2.0;

        let n = samples.len();
        let mut design = DMatrix::<f64>::zeros(n, 6);
        for (row, s) in samples.iter().enumerate() {
            let p = (s.as_vec3() - mid).component_div(&half);
            design[(row, 0)] = p.x * p.x;
            design[(row, 1)] = p.y * p.y;
            design[(row, 2)] = p.z * p.z;
            design[(row, 3)] = p.x;
            design[(row, 4)] = p.y;
            design[(row, 5)] = p.z;
        }
        let ones = DVector::<f64>::from_element(n, 1.0);

        let svd = design.svd(true, true);
        let coeffs = svd
            .solve(&ones, 1e-12)
            .map_err(|_| FusionError::CalibrationInsufficientData(InsufficientData::NotEllipsoid))?;

        let quad = Vec3::new(coeffs[0], coeffs[1], coeffs[2]);
        let lin = Vec3::new(coeffs[3], coeffs[4], coeffs[5]);
        if quad.iter().any(|q| !(q.is_finite() && *q > 0.0)) {
            return Err(FusionError::CalibrationInsufficientData(
                InsufficientData::NotEllipsoid,
            ));
        }

        let offset = -lin.component_div(&(quad * 2.0));
        let g = 1.0 + lin.component_mul(&lin).component_div(&(quad * 4.0)).sum();
        let axes = (Vec3::repeat(g).component_div(&quad)).map(f64::sqrt);
        if axes.iter().any(|a| !(a.is_finite() && *a > 0.0)) {
            return Err(FusionError::CalibrationInsufficientData(
                InsufficientData::NotEllipsoid,
            ));
        }

        // Undo the conditioning.
        let center = mid + offset.component_mul(&half);
        let scale = axes.component_mul(&half);
        let radius = scale.mean();

        let model = CalibrationModel::new(center, scale, radius);
        model.validate()?;
        Ok(model)
    }
}
