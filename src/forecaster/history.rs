use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One observed sample of the input series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub inflow_m3h: f64,
    pub price_eur_mwh: f64,
    pub rain_probability: f64,
}

/// Time-ordered observation series feeding the forecaster. The supervisor
/// owns the authoritative series and appends one point per executed step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistorySeries {
    points: Vec<HistoryPoint>,
}

impl HistorySeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_points(mut points: Vec<HistoryPoint>) -> Self {
        points.sort_by_key(|p| p.timestamp);
        Self { points }
    }

    pub fn push(&mut self, point: HistoryPoint) {
        match self.points.last() {
            Some(last) if point.timestamp < last.timestamp => {
                let idx = self
                    .points
                    .partition_point(|p| p.timestamp <= point.timestamp);
                self.points.insert(idx, point);
            }
            _ => self.points.push(point),
        }
    }

    pub fn points(&self) -> &[HistoryPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&HistoryPoint> {
        self.points.last()
    }

    /// Covered time span, zero when fewer than two points.
    pub fn span(&self) -> Duration {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => Duration::zero(),
        }
    }

    /// Split into (train, holdout) at `cutoff`; holdout is everything at or
    /// after the cutoff.
    pub fn split_at(&self, cutoff: DateTime<Utc>) -> (&[HistoryPoint], &[HistoryPoint]) {
        let idx = self.points.partition_point(|p| p.timestamp < cutoff);
        self.points.split_at(idx)
    }

    /// Drop points older than `max_age` relative to the series tail.
    pub fn retain_recent(&mut self, max_age: Duration) {
        if let Some(last) = self.points.last() {
            let cutoff = last.timestamp - max_age;
            self.points.retain(|p| p.timestamp >= cutoff);
        }
    }
}
