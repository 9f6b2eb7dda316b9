//! Affine magnetometer calibration: hard-iron center, soft-iron per-axis
//! scale, and a common sphere radius.
//!
//! `corrected = (raw - center) / scale * radius`

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{FusionError, TrackerResult};
use crate::types::{checked_component_div, Vec3};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationModel {
    pub center: Vec3,
    pub scale: Vec3,
    pub radius: f64,
}

impl CalibrationModel {
    pub fn new(center: Vec3, scale: Vec3, radius: f64) -> Self {
        Self { center, scale, radius }
    }

    /// Constants fitted on the reference board, active until the first
    /// successful calibration run.
    pub fn factory() -> Self {
        Self::new(
            Vec3::new(20962.0, 34322.0, -23924.0),
            Vec3::new(1203.0, 1177.0, 1133.0),
            48098.0,
        )
    }

    /// Pass-through model used when the configured one is unusable.
    pub fn identity() -> Self {
        Self::new(Vec3::zeros(), Vec3::new(1.0, 1.0, 1.0), 1.0)
    }

    /// Wire order: center xyz, scale xyz, radius.
    pub fn from_fields(fields: [f64; 7]) -> Self {
        Self::new(
            Vec3::new(fields[0], fields[1], fields[2]),
            Vec3::new(fields[3], fields[4], fields[5]),
            fields[6],
        )
    }

    pub fn to_fields(&self) -> [f64; 7] {
        [
            self.center.x,
            self.center.y,
            self.center.z,
            self.scale.x,
            self.scale.y,
            self.scale.z,
            self.radius,
        ]
    }

    pub fn validate(&self) -> TrackerResult<()> {
        if let Some(axis) = self.scale.iter().position(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(FusionError::Configuration(format!(
                "scale[{}] = {} must be positive",
                axis, self.scale[axis]
            )));
        }
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(FusionError::Configuration(format!(
                "radius = {} must be positive",
                self.radius
            )));
        }
        if self.center.iter().any(|c| !c.is_finite()) {
            return Err(FusionError::Configuration("center is not finite".to_string()));
        }
        Ok(())
    }

    /// Offset and scale only, so a point on the fitted ellipsoid lands on the unit sphere.
    pub fn normalize(&self, raw: &Vec3) -> TrackerResult<Vec3> {
        self.validate()?;
        checked_component_div(&(raw - self.center), &self.scale)
            .ok_or_else(|| FusionError::Configuration("zero scale axis".to_string()))
    }

    /// Calibrated vector rescaled to the common radius.
    pub fn apply(&self, raw: &Vec3) -> TrackerResult<Vec3> {
        Ok(self.normalize(raw)? * self.radius)
    }

    /// Total variant of `apply`: an unusable model degrades to identity and
    /// the configuration error is handed back for reporting.
    pub fn apply_or_identity(&self, raw: &Vec3) -> (Vec3, Option<FusionError>) {
        match self.apply(raw) {
            Ok(v) => (v, None),
            Err(e) => {
                log::warn!("Calibration unusable ({}), falling back to identity", e);
                (*raw, Some(e))
            }
        }
    }
}

impl Default for CalibrationModel {
    fn default() -> Self {
        Self::factory()
    }
}

impl fmt::Display for CalibrationModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "center=({}, {}, {}) scale=({}, {}, {}) radius={}",
            self.center.x,
            self.center.y,
            self.center.z,
            self.scale.x,
            self.scale.y,
            self.scale.z,
            self.radius
        )
    }
}

// ─── Shared handle ───────────────────────────────────────────────────────────

/// The active calibration, shared between the sampling path (reader) and the
/// calibration path (writer).
///
/// The model sits behind a single `Arc` that is swapped whole; a reader holds
/// either the old or the new snapshot, never a mix.
#[derive(Clone, Debug)]
pub struct CalibrationHandle {
    active: Arc<RwLock<Arc<CalibrationModel>>>,
}

impl CalibrationHandle {
    /// Starts from `initial`, or identity if `initial` is unusable.
    pub fn new(initial: CalibrationModel) -> Self {
        let model = match initial.validate() {
            Ok(()) => initial,
            Err(e) => {
                log::warn!("Default calibration rejected ({}), using identity", e);
                CalibrationModel::identity()
            }
        };
        Self {
            active: Arc::new(RwLock::new(Arc::new(model))),
        }
    }

    pub fn load(&self) -> Arc<CalibrationModel> {
        // A poisoned lock still holds a complete snapshot: the write is one pointer store.
        let guard = self.active.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the active model. Invalid models are refused and the old one stays.
    pub fn update(&self, model: CalibrationModel) -> TrackerResult<()> {
        model.validate()?;
        let next = Arc::new(model);
        let mut guard = self.active.write().unwrap_or_else(|e| e.into_inner());
        *guard = next;
        Ok(())
    }
}

impl Default for CalibrationHandle {
    fn default() -> Self {
        Self::new(CalibrationModel::factory())
    }
}
