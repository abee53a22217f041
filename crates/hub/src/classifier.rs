//! Per-type optimal ranges and the normal/warning/critical classification.
//!
//! ```text
//!   critical | warning |    normal     | warning | critical
//! ---------]-(---------[---------------]---------)-[---------
//!      min*0.7        min             max       max*1.3
//! ```
//!
//! The critical boundary is inclusive: a value of exactly `min * 0.7` or
//! `max * 1.3` is critical. Exactly `min` or `max` is normal. A range whose
//! `min` is zero has no lower band at all.
//!
//! The critical thresholds are written out as literals so that a reading of
//! e.g. 3.85 pH compares against 3.85, not against `5.5 * 0.7`.

use crate::model::{SensorStatus, SensorType};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimalRange {
    pub min: f64,
    pub max: f64,
    /// `min * 0.7`, or `None` when the range has no floor.
    pub critical_low: Option<f64>,
    /// `max * 1.3`.
    pub critical_high: f64,
}

/// Healthy band for a sensor type, `None` for types without one.
pub fn optimal_range(sensor_type: SensorType) -> Option<OptimalRange> {
    let (min, max, critical_low, critical_high) = match sensor_type {
        SensorType::Temperature => (18.0, 30.0, Some(12.6), 39.0),
        SensorType::Humidity => (40.0, 80.0, Some(28.0), 104.0),
        SensorType::SoilMoisture => (20.0, 80.0, Some(14.0), 104.0),
        SensorType::Light => (1000.0, 10000.0, Some(700.0), 13000.0),
        SensorType::WaterLevel => (20.0, 90.0, Some(14.0), 117.0),
        SensorType::Rainfall => (0.0, 50.0, None, 65.0),
        SensorType::SoilPh => (5.5, 7.5, Some(3.85), 9.75),
        SensorType::Unknown => return None,
    };
    Some(OptimalRange {
        min,
        max,
        critical_low,
        critical_high,
    })
}

/// Classify a value. Unknown types are normal; NaN is critical.
pub fn classify(sensor_type: SensorType, value: f64) -> SensorStatus {
    let Some(range) = optimal_range(sensor_type) else {
        return SensorStatus::Normal;
    };
    if value.is_nan() {
        return SensorStatus::Critical;
    }

    let has_floor = range.critical_low.is_some();
    if range.critical_low.map_or(false, |low| value <= low) || value >= range.critical_high {
        SensorStatus::Critical
    } else if (has_floor && value < range.min) || value > range.max {
        SensorStatus::Warning
    } else {
        SensorStatus::Normal
    }
}
