use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::calibration::{CalibrationModel, EstimatorKind, MIN_SAMPLES};
use crate::error::{FusionError, TrackerResult};

// ─── Fusion ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Accelerometer norm below which tilt is undefined (free fall), sensor units
    pub accel_min_norm: f64,
    /// Magnetometer norm below which the field has no direction
    pub mag_min_norm: f64,
    /// Horizontal share of the unit field vector below which yaw is held
    pub horizontal_min_ratio: f64,
    /// Subtracted from the magnetic azimuth
    pub declination_rad: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            accel_min_norm: 1e-3,
            mag_min_norm: 1e-9,
            horizontal_min_ratio: 1e-3,
            declination_rad: 0.0,
        }
    }
}

// ─── Calibration ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub method: EstimatorKind,
    pub min_samples: usize,
    /// Samples gathered per manual calibration run
    pub collect_samples: usize,
    /// Failsafe: collection ends after this long regardless of sample count
    pub max_collect_secs: f64,
    /// Compiled-in model active until the first successful run
    pub defaults: CalibrationModel,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            method: EstimatorKind::MinMax,
            min_samples: MIN_SAMPLES,
            collect_samples: 300,
            max_collect_secs: 30.0,
            defaults: CalibrationModel::factory(),
        }
    }
}

// ─── Protocol ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadingTriple {
    /// Raw gyroscope vector
    Gyro,
    /// Calibrated magnetometer vector (legacy firmware)
    Mag,
}

impl std::str::FromStr for LeadingTriple {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gyro" => Ok(LeadingTriple::Gyro),
            "mag" => Ok(LeadingTriple::Mag),
            other => Err(format!("unknown leading triple '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub leading_triple: LeadingTriple,
    /// Device-side command buffer; a full buffer terminates the command
    pub command_buffer: usize,
    /// Decimal places on `Measurement:` fields
    pub measurement_precision: usize,
    pub request_timeout_secs: f64,
    /// Serial line rate for `listen`, 8N1
    pub baud_rate: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            leading_triple: LeadingTriple::Gyro,
            command_buffer: 32,
            measurement_precision: 2,
            request_timeout_secs: 60.0,
            baud_rate: 115_200,
        }
    }
}

// ─── Top level ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub fusion: FusionConfig,
    pub calibration: CalibrationConfig,
    pub protocol: ProtocolConfig,
}

impl TrackerConfig {
    pub fn load(path: impl AsRef<Path>) -> TrackerResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> TrackerResult<Self> {
        let config: TrackerConfig = serde_json::from_str(text)
            .map_err(|e| FusionError::Configuration(format!("config parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TrackerResult<()> {
        if !(self.calibration.max_collect_secs.is_finite() && self.calibration.max_collect_secs > 0.0) {
            return Err(FusionError::Configuration(
                "calibration.max_collect_secs must be positive".to_string(),
            ));
        }
        if self.calibration.collect_samples == 0 {
            return Err(FusionError::Configuration(
                "calibration.collect_samples must be non-zero".to_string(),
            ));
        }
        if self.protocol.command_buffer < 4 {
            return Err(FusionError::Configuration(
                "protocol.command_buffer must hold a 4-byte command".to_string(),
            ));
        }
        let timeout = self.protocol.request_timeout_secs;
        if !(timeout > 0.0 && Duration::try_from_secs_f64(timeout).is_ok()) {
            return Err(FusionError::Configuration(format!(
                "protocol.request_timeout_secs must be a positive representable duration, got {}",
                timeout
            )));
        }
        if self.protocol.baud_rate == 0 {
            return Err(FusionError::Configuration(
                "protocol.baud_rate must be non-zero".to_string(),
            ));
        }
        // A bad default model is not fatal; CalibrationHandle falls back to identity.
        if let Err(e) = self.calibration.defaults.validate() {
            log::warn!("calibration.defaults unusable: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = TrackerConfig::from_json(
            r#"{ "calibration": { "method": "ellipsoid", "collect_samples": 50 } }"#,
        )
        .unwrap();
        assert_eq!(config.calibration.method, EstimatorKind::Ellipsoid);
        assert_eq!(config.calibration.collect_samples, 50);
        assert_eq!(config.calibration.defaults, CalibrationModel::factory());
        assert_eq!(config.protocol, ProtocolConfig::default());
    }

    #[test]
    fn test_rejects_zero_window() {
        let err = TrackerConfig::from_json(r#"{ "calibration": { "max_collect_secs": 0.0 } }"#)
            .unwrap_err();
        assert!(matches!(err, FusionError::Configuration(_)));
    }

    #[test]
    fn test_rejects_unrepresentable_request_timeout() {
        for text in [
            r#"{ "protocol": { "request_timeout_secs": 1e30 } }"#,
            r#"{ "protocol": { "request_timeout_secs": -5.0 } }"#,
            r#"{ "protocol": { "request_timeout_secs": 0.0 } }"#,
        ] {
            let err = TrackerConfig::from_json(text).unwrap_err();
            assert!(matches!(err, FusionError::Configuration(_)), "{}", text);
        }
        let mut config = TrackerConfig::default();
        config.protocol.request_timeout_secs = f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_json() {
        let config = TrackerConfig::default();
        let text = serde_json::to_string(&config).unwrap();
        assert_eq!(TrackerConfig::from_json(&text).unwrap(), config);
    }
}
