use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-step comparison of the realized tunnel level against the schedule's
/// predicted trajectory. Produced continuously by the executor, consumed by
/// the supervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DeviationReport {
    pub timestamp: DateTime<Utc>,
    pub predicted_level_m: f64,
    pub actual_level_m: f64,
    pub delta_m: f64,
    pub within_tolerance: bool,
}

impl DeviationReport {
    pub fn new(
        timestamp: DateTime<Utc>,
        predicted_level_m: f64,
        actual_level_m: f64,
        tolerance_m: f64,
    ) -> Self {
        let delta_m = actual_level_m - predicted_level_m;
        Self {
            timestamp,
            predicted_level_m,
            actual_level_m,
            delta_m,
            within_tolerance: delta_m.abs() <= tolerance_m,
        }
    }
}
