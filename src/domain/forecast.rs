use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("forecast has no points")]
    Empty,

    #[error("timestamps not strictly increasing at point {index}")]
    NonMonotonic { index: usize },

    #[error("point {index} does not follow the {step_minutes}min step grid")]
    IrregularStep { index: usize, step_minutes: i64 },

    #[error("point {index} violates lower <= mean <= upper")]
    InvalidBounds { index: usize },

    #[error("point {index} has rain probability outside [0, 1]")]
    InvalidProbability { index: usize },
}

/// One predicted step of the horizon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub inflow_mean_m3h: f64,
    pub inflow_lower_m3h: f64,
    pub inflow_upper_m3h: f64,
    pub price_eur_mwh: f64,
    pub rain_probability: f64,
}

impl ForecastPoint {
    /// Rain-event detection is derived from the probability, not a
    /// separate prediction path.
    pub fn rain_event(&self, threshold: f64) -> bool {
        self.rain_probability >= threshold
    }
}

/// Held-out accuracy attached to every operational forecast so that
/// consumers can discount low-confidence predictions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ForecastAccuracy {
    pub inflow_mae_m3h: f64,
    pub sample_count: usize,
}

/// Time-indexed inflow/price/rain prediction over a fixed-step horizon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Forecast {
    pub id: Uuid,
    pub generated_at: DateTime<Utc>,
    /// Acting on the forecast after this instant is refused as stale.
    pub valid_until: DateTime<Utc>,
    pub step_minutes: i64,
    pub points: Vec<ForecastPoint>,
    pub accuracy: Option<ForecastAccuracy>,
}

impl Forecast {
    pub fn step(&self) -> Duration {
        Duration::minutes(self.step_minutes)
    }

    pub fn horizon(&self) -> Duration {
        self.step() * self.points.len() as i32
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now > self.valid_until
    }

    pub fn mean_inflow_m3h(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        self.points.iter().map(|p| p.inflow_mean_m3h).sum::<f64>() / self.points.len() as f64
    }

    /// Check the structural invariants: strictly increasing timestamps on
    /// the step grid, ordered confidence bounds, probabilities in [0, 1].
    pub fn validate(&self) -> Result<(), ForecastError> {
        if self.points.is_empty() {
            return Err(ForecastError::Empty);
        }
        let step = self.step();
        for (index, point) in self.points.iter().enumerate() {
            if index > 0 {
                let prev = &self.points[index - 1];
                if point.timestamp <= prev.timestamp {
                    return Err(ForecastError::NonMonotonic { index });
                }
                if point.timestamp - prev.timestamp != step {
                    return Err(ForecastError::IrregularStep {
                        index,
                        step_minutes: self.step_minutes,
                    });
                }
            }
            if !(point.inflow_lower_m3h <= point.inflow_mean_m3h
                && point.inflow_mean_m3h <= point.inflow_upper_m3h)
            {
                return Err(ForecastError::InvalidBounds { index });
            }
            if !(0.0..=1.0).contains(&point.rain_probability) {
                return Err(ForecastError::InvalidProbability { index });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn flat_forecast(n: usize, inflow: f64, price: f64) -> Forecast {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let points = (0..n)
            .map(|i| ForecastPoint {
                timestamp: start + Duration::hours(i as i64),
                inflow_mean_m3h: inflow,
                inflow_lower_m3h: inflow - 1_500.0,
                inflow_upper_m3h: inflow + 1_500.0,
                price_eur_mwh: price,
                rain_probability: 0.1,
            })
            .collect();
        Forecast {
            id: Uuid::new_v4(),
            generated_at: start,
            valid_until: start + Duration::hours(6),
            step_minutes: 60,
            points,
            accuracy: None,
        }
    }

    #[test]
    fn valid_forecast_passes() {
        assert!(flat_forecast(24, 10_000.0, 80.0).validate().is_ok());
    }

    #[test]
    fn empty_forecast_rejected() {
        let mut f = flat_forecast(24, 10_000.0, 80.0);
        f.points.clear();
        assert!(matches!(f.validate(), Err(ForecastError::Empty)));
    }

    #[test]
    fn non_monotonic_rejected() {
        let mut f = flat_forecast(24, 10_000.0, 80.0);
        f.points[5].timestamp = f.points[3].timestamp;
        assert!(matches!(
            f.validate(),
            Err(ForecastError::NonMonotonic { index: 5 })
        ));
    }

    #[test]
    fn off_grid_step_rejected() {
        let mut f = flat_forecast(24, 10_000.0, 80.0);
        f.points[5].timestamp = f.points[5].timestamp + Duration::minutes(7);
        assert!(matches!(f.validate(), Err(ForecastError::IrregularStep { .. })));
    }

    #[test]
    fn crossed_bounds_rejected() {
        let mut f = flat_forecast(24, 10_000.0, 80.0);
        f.points[2].inflow_lower_m3h = f.points[2].inflow_upper_m3h + 1.0;
        assert!(matches!(
            f.validate(),
            Err(ForecastError::InvalidBounds { index: 2 })
        ));
    }

    #[test]
    fn staleness_uses_valid_until() {
        let f = flat_forecast(24, 10_000.0, 80.0);
        assert!(!f.is_stale(f.generated_at));
        assert!(f.is_stale(f.valid_until + Duration::seconds(1)));
    }

    #[test]
    fn rain_event_is_threshold_derived() {
        let mut f = flat_forecast(24, 10_000.0, 80.0);
        f.points[3].rain_probability = 0.85;
        assert!(f.points[3].rain_event(0.6));
        assert!(!f.points[2].rain_event(0.6));
    }
}
