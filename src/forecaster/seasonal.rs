use async_trait::async_trait;
use chrono::{Duration, Timelike};
use uuid::Uuid;

use super::{ForecastMetrics, Forecaster, ForecasterError, HistoryPoint, HistorySeries};
use crate::domain::{Forecast, ForecastAccuracy, ForecastPoint};

/// Hour-of-day profile forecaster. The series is bucketed by hour; each
/// bucket contributes the mean and spread of its observations. The most
/// recent `holdout` window is excluded from the profile and used to report
/// held-out accuracy with every forecast. The exact predictive model is
/// deliberately replaceable behind the `Forecaster` trait.
pub struct SeasonalProfileForecaster {
    pub min_history: Duration,
    pub holdout: Duration,
    /// z-score applied to the per-bucket spread for the confidence band.
    pub confidence_z: f64,
    /// How long a produced forecast may be acted upon.
    pub validity: Duration,
}

impl Default for SeasonalProfileForecaster {
    fn default() -> Self {
        Self {
            min_history: Duration::hours(48),
            holdout: Duration::hours(24),
            confidence_z: 1.64,
            validity: Duration::hours(6),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HourBucket {
    inflow_sum: f64,
    inflow_sq_sum: f64,
    price_sum: f64,
    rain_sum: f64,
    count: usize,
}

impl HourBucket {
    fn add(&mut self, p: &HistoryPoint) {
        self.inflow_sum += p.inflow_m3h;
        self.inflow_sq_sum += p.inflow_m3h * p.inflow_m3h;
        self.price_sum += p.price_eur_mwh;
        self.rain_sum += p.rain_probability;
        self.count += 1;
    }

    fn inflow_mean(&self) -> f64 {
        self.inflow_sum / self.count.max(1) as f64
    }

    fn inflow_std(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        let mean = self.inflow_sum / n;
        ((self.inflow_sq_sum / n) - mean * mean).max(0.0).sqrt()
    }

    fn price_mean(&self) -> f64 {
        self.price_sum / self.count.max(1) as f64
    }

    fn rain_mean(&self) -> f64 {
        (self.rain_sum / self.count.max(1) as f64).clamp(0.0, 1.0)
    }
}

struct Profile {
    buckets: [HourBucket; 24],
    overall: HourBucket,
}

impl Profile {
    fn build(points: &[HistoryPoint]) -> Self {
        let mut buckets = [HourBucket::default(); 24];
        let mut overall = HourBucket::default();
        for p in points {
            buckets[p.timestamp.hour() as usize].add(p);
            overall.add(p);
        }
        Self { buckets, overall }
    }

    /// Bucket for the hour, falling back to the overall persistence value
    /// when the hour was never observed.
    fn bucket(&self, hour: u32) -> &HourBucket {
        let bucket = &self.buckets[hour as usize];
        if bucket.count > 0 {
            bucket
        } else {
            &self.overall
        }
    }
}

#[async_trait]
impl Forecaster for SeasonalProfileForecaster {
    async fn predict(
        &self,
        history: &HistorySeries,
        horizon: Duration,
        step: Duration,
    ) -> Result<Forecast, ForecasterError> {
        if horizon <= Duration::zero() || step <= Duration::zero() {
            return Err(ForecasterError::InvalidHorizon);
        }

        let span = history.span();
        let Some(last) = history.last() else {
            return Err(ForecasterError::InsufficientHistory {
                available_hours: 0,
                required_hours: self.min_history.num_hours(),
            });
        };
        if span < self.min_history {
            return Err(ForecasterError::InsufficientHistory {
                available_hours: span.num_hours(),
                required_hours: self.min_history.num_hours(),
            });
        }
        let now = last.timestamp;

        let (train, holdout) = history.split_at(now - self.holdout);
        let profile = if train.is_empty() {
            Profile::build(history.points())
        } else {
            Profile::build(train)
        };

        let accuracy = if holdout.is_empty() {
            None
        } else {
            let actual: Vec<f64> = holdout.iter().map(|p| p.inflow_m3h).collect();
            let predicted: Vec<f64> = holdout
                .iter()
                .map(|p| profile.bucket(p.timestamp.hour()).inflow_mean())
                .collect();
            ForecastMetrics::calculate(&actual, &predicted)
                .ok()
                .map(|m| ForecastAccuracy {
                    inflow_mae_m3h: m.mae,
                    sample_count: m.sample_count,
                })
        };

        // The first point covers [now, now+step): planning and execution
        // share the same step grid.
        let steps = (horizon.num_minutes() / step.num_minutes()).max(1);
        let points = (0..steps)
            .map(|i| {
                let timestamp = now + step * i as i32;
                let bucket = profile.bucket(timestamp.hour());
                let mean = bucket.inflow_mean();
                let band = self.confidence_z * bucket.inflow_std();
                ForecastPoint {
                    timestamp,
                    inflow_mean_m3h: mean,
                    inflow_lower_m3h: (mean - band).max(0.0),
                    inflow_upper_m3h: mean + band,
                    price_eur_mwh: bucket.price_mean(),
                    rain_probability: bucket.rain_mean(),
                }
            })
            .collect();

        Ok(Forecast {
            id: Uuid::new_v4(),
            generated_at: now,
            valid_until: now + self.validity,
            step_minutes: step.num_minutes(),
            points,
            accuracy,
        })
    }
}
