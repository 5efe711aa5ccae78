//! Schedule optimization. The planner formulates the pump-scheduling
//! problem over the forecast horizon and hands it to a strategy: the
//! always-available commitment DP, or the exact MILP encoding behind the
//! `milp` feature. Solves run off the async runtime under a hard time
//! budget; a timed-out solve is discarded wholesale and the pre-computed
//! incumbent is returned tagged suboptimal.

pub mod commitment;
pub mod feasibility;
#[cfg(feature = "milp")]
pub mod milp;

pub use commitment::CommitmentDpStrategy;
#[cfg(feature = "milp")]
pub use milp::MilpStrategy;

use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::domain::{
    ConstraintKind, ConstraintSet, Forecast, ForecastError, Pump, Schedule, TunnelGeometry,
    TunnelState,
};

#[derive(Debug, Error)]
pub enum PlanError {
    /// No schedule satisfies the constraint set; carries the tightest
    /// violated constraint so the supervisor can relax or escalate.
    #[error("infeasible schedule: tightest violated constraint is {constraint}")]
    Infeasible { constraint: ConstraintKind },

    #[error("forecast rejected: {0}")]
    BadForecast(#[from] ForecastError),

    #[error("planning failed: {0}")]
    Internal(String),
}

/// Read-only snapshot of everything one solve needs.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub state: TunnelState,
    pub forecast: Forecast,
    pub constraints: ConstraintSet,
    pub pumps: Vec<Pump>,
    pub geometry: TunnelGeometry,
}

/// A solve is CPU-bound and synchronous; the planner runs it on the
/// blocking pool.
pub trait PlanStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn plan(&self, request: &PlanRequest) -> Result<Schedule, PlanError>;
}

pub struct Planner {
    strategy: Arc<dyn PlanStrategy>,
    incumbent: Arc<CommitmentDpStrategy>,
    time_budget: std::time::Duration,
}

impl Planner {
    pub fn new(strategy: Arc<dyn PlanStrategy>, time_budget: std::time::Duration) -> Self {
        Self {
            strategy,
            incumbent: Arc::new(CommitmentDpStrategy::default()),
            time_budget,
        }
    }

    /// Default planner: commitment DP as the single strategy.
    pub fn with_default_strategy(time_budget: std::time::Duration) -> Self {
        Self::new(Arc::new(CommitmentDpStrategy::default()), time_budget)
    }

    pub async fn plan(&self, request: PlanRequest) -> Result<Schedule, PlanError> {
        request.forecast.validate()?;
        feasibility::screen(&request)?;

        if self.strategy.name() == self.incumbent.name() {
            // Single-strategy setup: nothing cheaper to fall back to, so
            // the budget simply bounds the one solve.
            return match solve_on_blocking_pool(
                Arc::clone(&self.strategy),
                request,
                Some(self.time_budget),
            )
            .await
            {
                Some(result) => result,
                None => Err(PlanError::Internal(
                    "planner exceeded its time budget with no incumbent".into(),
                )),
            };
        }

        // The incumbent is computed first: it is what a timed-out exact
        // solve falls back to, so no partial schedule can ever escape.
        let incumbent = match solve_on_blocking_pool(
            Arc::clone(&self.incumbent) as Arc<dyn PlanStrategy>,
            request.clone(),
            None,
        )
        .await
        {
            Some(result) => result?,
            None => {
                return Err(PlanError::Internal(
                    "incumbent solve failed to complete".into(),
                ))
            }
        };

        match solve_on_blocking_pool(Arc::clone(&self.strategy), request, Some(self.time_budget))
            .await
        {
            Some(result) => result,
            None => {
                warn!(
                    strategy = self.strategy.name(),
                    budget_s = self.time_budget.as_secs(),
                    "solve timed out, returning incumbent"
                );
                let mut schedule = incumbent;
                schedule.suboptimal = true;
                Ok(schedule)
            }
        }
    }
}

/// Run a solve on the blocking pool, optionally bounded by a hard budget.
/// None means the budget elapsed; the in-flight solve is detached and its
/// result discarded, so a cancelled solve can never be installed.
async fn solve_on_blocking_pool(
    strategy: Arc<dyn PlanStrategy>,
    request: PlanRequest,
    budget: Option<std::time::Duration>,
) -> Option<Result<Schedule, PlanError>> {
    let handle = tokio::task::spawn_blocking(move || strategy.plan(&request));
    let joined = match budget {
        Some(budget) => match tokio::time::timeout(budget, handle).await {
            Ok(joined) => joined,
            Err(_) => return None,
        },
        None => handle.await,
    };
    Some(match joined {
        Ok(result) => result,
        Err(join_err) => Err(PlanError::Internal(join_err.to_string())),
    })
}

/// Per-step price ranking used for the deterministic tie-break: among
/// equal-cost plans, pumping concentrates in the lowest-price windows.
/// Rank is dense over (price, timestamp) ascending.
pub(crate) fn price_ranks(forecast: &Forecast) -> Vec<usize> {
    use ordered_float::OrderedFloat;

    let mut order: Vec<usize> = (0..forecast.points.len()).collect();
    order.sort_by_key(|&i| {
        (
            OrderedFloat(forecast.points[i].price_eur_mwh),
            forecast.points[i].timestamp,
        )
    });
    let mut ranks = vec![0usize; order.len()];
    for (rank, &i) in order.iter().enumerate() {
        ranks[i] = rank;
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ForecastPoint, PumpClass, PumpSpec};
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn flat_request() -> PlanRequest {
        let geometry = TunnelGeometry::new(8.0, 225_850.0);
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let small = PumpSpec {
            nominal_flow_m3h: 5_000.0,
            rated_power_kw: 110.0,
            max_efficiency: 0.84,
            min_frequency_hz: 47.5,
            max_frequency_hz: 50.0,
            min_cycle: Duration::hours(2),
        };
        let pumps = vec![
            Pump::from_spec("S1", PumpClass::Small, &small),
            Pump::from_spec("S2", PumpClass::Small, &small),
            Pump::from_spec("S3", PumpClass::Small, &small),
            Pump::from_spec("S4", PumpClass::Small, &small),
        ];
        let points = (0..24)
            .map(|i| ForecastPoint {
                timestamp: start + Duration::hours(i),
                inflow_mean_m3h: 8_000.0,
                inflow_lower_m3h: 7_000.0,
                inflow_upper_m3h: 9_000.0,
                price_eur_mwh: 75.0,
                rain_probability: 0.0,
            })
            .collect();
        let mut state = TunnelState::at_rest(&geometry, 3.0, start);
        state.inflow_m3h = 8_000.0;
        state.outflow_m3h = 8_000.0;
        PlanRequest {
            state,
            forecast: Forecast {
                id: Uuid::new_v4(),
                generated_at: start,
                valid_until: start + Duration::hours(6),
                step_minutes: 60,
                points,
                accuracy: None,
            },
            constraints: ConstraintSet::default(),
            pumps,
            geometry,
        }
    }

    /// Strategy that stalls well past any reasonable budget.
    struct StallStrategy;

    impl PlanStrategy for StallStrategy {
        fn name(&self) -> &'static str {
            "stall"
        }

        fn plan(&self, request: &PlanRequest) -> Result<Schedule, PlanError> {
            std::thread::sleep(std::time::Duration::from_millis(500));
            CommitmentDpStrategy::default().plan(request)
        }
    }

    #[tokio::test]
    async fn timeout_returns_incumbent_tagged_suboptimal() {
        let planner = Planner::new(
            Arc::new(StallStrategy),
            std::time::Duration::from_millis(50),
        );
        let schedule = planner.plan(flat_request()).await.unwrap();
        assert!(schedule.suboptimal);
        assert!(!schedule.commands.is_empty());
    }

    #[tokio::test]
    async fn invalid_forecast_is_rejected_before_solving() {
        let planner =
            Planner::with_default_strategy(std::time::Duration::from_secs(5));
        let mut request = flat_request();
        request.forecast.points[3].timestamp = request.forecast.points[1].timestamp;
        let err = planner.plan(request).await.unwrap_err();
        assert!(matches!(err, PlanError::BadForecast(_)));
    }

    #[test]
    fn price_ranks_are_deterministic_under_ties() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let points = [80.0, 60.0, 60.0, 95.0]
            .iter()
            .enumerate()
            .map(|(i, &price)| ForecastPoint {
                timestamp: start + Duration::hours(i as i64),
                inflow_mean_m3h: 10_000.0,
                inflow_lower_m3h: 9_000.0,
                inflow_upper_m3h: 11_000.0,
                price_eur_mwh: price,
                rain_probability: 0.0,
            })
            .collect();
        let forecast = Forecast {
            id: Uuid::new_v4(),
            generated_at: start,
            valid_until: start + Duration::hours(6),
            step_minutes: 60,
            points,
            accuracy: None,
        };

        let ranks = price_ranks(&forecast);
        // Equal prices break ties by timestamp.
        assert_eq!(ranks, vec![2, 0, 1, 3]);
        assert_eq!(ranks, price_ranks(&forecast));
    }
}
