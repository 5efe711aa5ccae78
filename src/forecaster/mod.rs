pub mod history;
pub mod metrics;
pub mod seasonal;

pub use history::*;
pub use metrics::*;
pub use seasonal::*;

use async_trait::async_trait;
use chrono::Duration;
use thiserror::Error;

use crate::domain::Forecast;

#[derive(Debug, Error)]
pub enum ForecasterError {
    /// Recoverable by waiting or backfilling the series.
    #[error("insufficient history: have {available_hours}h, need {required_hours}h")]
    InsufficientHistory {
        available_hours: i64,
        required_hours: i64,
    },

    #[error("horizon and step must be positive")]
    InvalidHorizon,
}

/// Prediction contract: produce a forecast for `horizon` at `step`
/// resolution from a historical series up to "now" (the series tail).
/// Implementations must attach a held-out accuracy report.
#[async_trait]
pub trait Forecaster: Send + Sync {
    async fn predict(
        &self,
        history: &HistorySeries,
        horizon: Duration,
        step: Duration,
    ) -> Result<Forecast, ForecasterError>;
}
