//! Orchestration of the forecast -> plan -> execute cycle. The supervisor
//! owns the authoritative tunnel state, the constraint set, the history
//! series, compliance counters and the alert log; the other components
//! receive read-only snapshots and hand back proposals and reports.

pub mod alerts;
pub mod compliance;
pub mod validation;

pub use alerts::{Alert, AlertLog, AlertSeverity};
pub use compliance::{ComplianceCounters, ComplianceSnapshot};
pub use validation::ConstraintViolation;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Short, never-held-across-await bookkeeping locks.
use parking_lot::Mutex as SyncMutex;

use crate::config::Config;
use crate::domain::{
    ConstraintKind, ConstraintSet, DeviationReport, Forecast, Pump, PumpCommand, PumpStation,
    Schedule, TunnelGeometry, TunnelState,
};
use crate::executor::{Executor, ExecutorConfig, ExecutorPhase, StepResult};
use crate::forecaster::{Forecaster, ForecasterError, HistoryPoint, HistorySeries};
use crate::model::TunnelModel;
use crate::planner::{PlanError, PlanRequest, Planner};

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The supervisor refuses to act on an expired forecast.
    #[error("stale forecast: valid until {valid_until}, now {now}")]
    StaleForecast {
        valid_until: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error(transparent)]
    Forecast(#[from] ForecasterError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("schedule rejected by validation: {summary}")]
    ScheduleRejected { summary: String },
}

/// Read-only projection of the whole pipeline for the reporting surface.
#[derive(Debug, Clone, Serialize)]
pub struct SystemReport {
    pub state: TunnelState,
    pub executor_phase: ExecutorPhase,
    pub schedule: Option<Schedule>,
    pub forecast: Option<Forecast>,
    pub compliance: ComplianceSnapshot,
    pub last_deviation: Option<DeviationReport>,
    pub alerts: Vec<Alert>,
}

pub struct Supervisor {
    constraints: ConstraintSet,
    geometry: TunnelGeometry,
    pumps: Vec<Pump>,
    forecaster: Arc<dyn Forecaster>,
    planner: Planner,
    executor: Mutex<Executor>,
    station: Arc<dyn PumpStation>,
    horizon: Duration,
    step: Duration,
    /// Out-of-tolerance steps tolerated before an unscheduled replan; the
    /// executor's local correction gets a chance first.
    replan_after_bad_steps: usize,
    state: Arc<RwLock<TunnelState>>,
    history: RwLock<HistorySeries>,
    latest_forecast: RwLock<Option<Forecast>>,
    active_schedule: RwLock<Option<Schedule>>,
    compliance: RwLock<ComplianceCounters>,
    alerts: RwLock<AlertLog>,
    bad_step_streak: SyncMutex<usize>,
    /// Realized (timestamp, level) window for daily-emptying compliance.
    level_window: SyncMutex<VecDeque<(DateTime<Utc>, f64)>>,
}

impl Supervisor {
    pub fn new(
        cfg: &Config,
        forecaster: Arc<dyn Forecaster>,
        station: Arc<dyn PumpStation>,
        state: Arc<RwLock<TunnelState>>,
        history: HistorySeries,
    ) -> Self {
        let constraints = cfg.constraints.constraint_set();
        let geometry = cfg.tunnel.geometry();
        let pumps = cfg.pumps.catalog();

        let model = TunnelModel::new(geometry, pumps.clone(), cfg.tunnel.integration_step_s);
        let executor = Executor::new(
            model,
            Arc::clone(&station),
            ExecutorConfig {
                tolerance_m: cfg.executor.tolerance_m,
                trigger_steps: cfg.executor.deviation_trigger_steps,
                correction_gain: cfg.executor.correction_gain,
            },
        );

        let planner = build_planner(cfg);

        Self {
            constraints,
            geometry,
            pumps,
            forecaster,
            planner,
            executor: Mutex::new(executor),
            station,
            horizon: Duration::hours(cfg.supervisor.horizon_hours as i64),
            step: Duration::minutes(cfg.supervisor.step_minutes as i64),
            replan_after_bad_steps: cfg.executor.deviation_trigger_steps * 2,
            state,
            history: RwLock::new(history),
            latest_forecast: RwLock::new(None),
            active_schedule: RwLock::new(None),
            compliance: RwLock::new(ComplianceCounters::new()),
            alerts: RwLock::new(AlertLog::new()),
            bad_step_streak: SyncMutex::new(0),
            level_window: SyncMutex::new(VecDeque::new()),
        }
    }

    pub fn constraints(&self) -> &ConstraintSet {
        &self.constraints
    }

    /// One planning cycle: forecast, staleness gate, plan, independent
    /// validation, approval, installation. "Now" is the authoritative
    /// state's clock, so simulated and live operation behave identically.
    pub async fn run_cycle(&self) -> Result<Uuid, SupervisorError> {
        let state = self.state.read().await.clone();
        let now = state.timestamp;
        let history = self.history.read().await.clone();

        let forecast = self
            .forecaster
            .predict(&history, self.horizon, self.step)
            .await?;
        if forecast.is_stale(now) {
            return Err(SupervisorError::StaleForecast {
                valid_until: forecast.valid_until,
                now,
            });
        }
        *self.latest_forecast.write().await = Some(forecast.clone());

        let request = PlanRequest {
            state,
            forecast: forecast.clone(),
            constraints: self.constraints.clone(),
            pumps: self.pumps.clone(),
            geometry: self.geometry,
        };

        let (schedule, constraints_used) = match self.planner.plan(request.clone()).await {
            Ok(schedule) => (schedule, self.constraints.clone()),
            Err(PlanError::Infeasible { constraint }) => {
                // Relaxation policy: give up the surge reserve once, then
                // escalate to an operator.
                self.alerts.write().await.raise(
                    AlertSeverity::Warning,
                    format!(
                        "planner infeasible ({}), retrying without surge reserve",
                        constraint
                    ),
                    now,
                );
                let relaxed = self.constraints.without_surge_reserve();
                let retry = PlanRequest {
                    constraints: relaxed.clone(),
                    ..request
                };
                match self.planner.plan(retry).await {
                    Ok(schedule) => (schedule, relaxed),
                    Err(err) => {
                        self.alerts.write().await.raise(
                            AlertSeverity::Critical,
                            format!("planning failed after relaxation: {}", err),
                            now,
                        );
                        return Err(err.into());
                    }
                }
            }
            Err(err) => return Err(err.into()),
        };

        // Defense in depth: re-check every constraint family with logic
        // independent of the planner's encoding.
        let violations = validation::check_schedule(
            &schedule,
            &forecast,
            &constraints_used,
            &self.pumps,
            &self.geometry,
        );
        {
            let mut compliance = self.compliance.write().await;
            for kind in [ConstraintKind::PumpCycle, ConstraintKind::FrequencyFloor] {
                compliance.record(kind, !violations.iter().any(|v| v.constraint == kind));
            }
        }
        if !violations.is_empty() {
            let summary = violations
                .iter()
                .map(|v| v.detail.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            self.alerts.write().await.raise(
                AlertSeverity::Warning,
                format!("schedule {} rejected: {}", schedule.id, summary),
                now,
            );
            return Err(SupervisorError::ScheduleRejected { summary });
        }

        let mut schedule = schedule;
        if schedule.approve().is_err() {
            return Err(SupervisorError::ScheduleRejected {
                summary: format!("schedule {} was not in proposed state", schedule.id),
            });
        }

        if let Some(previous) = self.active_schedule.write().await.as_mut() {
            previous.supersede();
        }
        info!(
            schedule = %schedule.id,
            cost_eur = schedule.energy_cost_eur,
            suboptimal = schedule.suboptimal,
            "schedule approved"
        );
        self.executor.lock().await.install(schedule.clone());
        *self.active_schedule.write().await = Some(schedule.clone());
        Ok(schedule.id)
    }

    /// One execution step: read the station tags, let the executor advance
    /// the model, then fold the outcome into history, compliance counters
    /// and the replan/fault policy.
    pub async fn execute_step(&self) -> Result<StepResult> {
        let snapshot = self.station.read_snapshot().await?;
        let mut state = self.state.read().await.clone();
        let previous_outflow = state.outflow_m3h;
        state.inflow_m3h = snapshot.inflow_m3h;

        let (next, result) = self.executor.lock().await.step(state).await;
        let advanced = next.timestamp != self.state.read().await.timestamp;
        *self.state.write().await = next.clone();

        if advanced {
            self.append_history(&next).await;
            self.record_step_compliance(&next, previous_outflow).await;
        }

        match result.phase {
            ExecutorPhase::Faulted => self.handle_fault(next.timestamp).await,
            ExecutorPhase::Idle => {
                // Horizon exhausted: roll straight into the next cycle
                // instead of idling until the cadence tick.
                if self.active_schedule.read().await.is_some() {
                    if let Err(err) = self.run_cycle().await {
                        warn!(error = %err, "follow-up planning cycle failed");
                    }
                }
            }
            _ => {
                if let Some(report) = result.report {
                    self.handle_report(report).await;
                }
            }
        }

        Ok(result)
    }

    async fn handle_fault(&self, now: DateTime<Utc>) {
        let detail = self
            .executor
            .lock()
            .await
            .fault()
            .map(|f| format!("{:?}", f))
            .unwrap_or_else(|| "unknown fault".into());
        self.alerts.write().await.raise(
            AlertSeverity::Critical,
            format!("executor faulted: {}", detail),
            now,
        );

        match self.run_cycle().await {
            Ok(schedule_id) => {
                info!(schedule = %schedule_id, "replan after fault succeeded");
                self.executor.lock().await.clear_fault();
            }
            Err(err) => {
                warn!(error = %err, "replan after fault failed, executor stays faulted");
            }
        }
    }

    async fn handle_report(&self, report: DeviationReport) {
        {
            let mut streak = self.bad_step_streak.lock();
            if report.within_tolerance {
                *streak = 0;
                return;
            }
            *streak += 1;
            if *streak < self.replan_after_bad_steps {
                return;
            }
            *streak = 0;
        }

        self.alerts.write().await.raise(
            AlertSeverity::Warning,
            format!(
                "sustained deviation ({:+.2}m at {}), triggering replan",
                report.delta_m, report.timestamp
            ),
            report.timestamp,
        );
        if let Err(err) = self.run_cycle().await {
            warn!(error = %err, "deviation-triggered replan failed");
        }
    }

    async fn append_history(&self, state: &TunnelState) {
        let (price, rain) = self
            .forecast_conditions_at(state.timestamp)
            .await
            .unwrap_or((0.0, 0.0));
        let mut history = self.history.write().await;
        history.push(HistoryPoint {
            timestamp: state.timestamp,
            inflow_m3h: state.inflow_m3h,
            price_eur_mwh: price,
            rain_probability: rain,
        });
        history.retain_recent(Duration::days(14));
    }

    async fn forecast_conditions_at(&self, at: DateTime<Utc>) -> Option<(f64, f64)> {
        let guard = self.latest_forecast.read().await;
        let forecast = guard.as_ref()?;
        let step = forecast.step();
        forecast
            .points
            .iter()
            .find(|p| at >= p.timestamp && at < p.timestamp + step)
            .map(|p| (p.price_eur_mwh, p.rain_probability))
    }

    async fn record_step_compliance(&self, state: &TunnelState, previous_outflow: f64) {
        let rain = self
            .forecast_conditions_at(state.timestamp)
            .await
            .map(|(_, rain)| rain >= self.constraints.rain_probability_threshold)
            .unwrap_or(false);
        let reserved_level = self
            .geometry
            .volume_to_level(self.constraints.reserved_volume_cap_m3());

        let emptied_within_day = {
            let mut window = self.level_window.lock();
            window.push_back((state.timestamp, state.level_m));
            while let Some((ts, _)) = window.front() {
                if state.timestamp - *ts > Duration::hours(24) {
                    window.pop_front();
                } else {
                    break;
                }
            }
            window
                .iter()
                .any(|(_, level)| *level <= self.constraints.emptying_watermark_m)
        };

        let mut compliance = self.compliance.write().await;
        compliance.record(
            ConstraintKind::StorageCapacity,
            state.level_m <= self.constraints.max_level_m,
        );
        compliance.record(
            ConstraintKind::SurgeReserve,
            rain || state.level_m <= reserved_level,
        );
        compliance.record(
            ConstraintKind::OutflowVariation,
            (state.outflow_m3h - previous_outflow).abs()
                <= self.constraints.outflow_variation_m3h,
        );
        if self.constraints.require_daily_emptying {
            compliance.record(ConstraintKind::DailyEmptying, emptied_within_day);
        }
    }

    /// Operator override, forwarded to the executor; never silently
    /// reverted.
    pub async fn override_pump(&self, command: PumpCommand) {
        if let Some(schedule) = self.active_schedule.write().await.as_mut() {
            schedule.overridden = true;
        }
        self.executor.lock().await.override_command(command);
    }

    pub async fn acknowledge_alert(&self, id: Uuid) -> bool {
        self.alerts.write().await.acknowledge(id)
    }

    pub async fn system_report(&self) -> SystemReport {
        let executor = self.executor.lock().await;
        SystemReport {
            state: self.state.read().await.clone(),
            executor_phase: executor.phase(),
            schedule: self.active_schedule.read().await.clone(),
            forecast: self.latest_forecast.read().await.clone(),
            compliance: self.compliance.read().await.snapshot(),
            last_deviation: executor.last_report().copied(),
            alerts: self.alerts.read().await.recent(50),
        }
    }
}

fn build_planner(cfg: &Config) -> Planner {
    let budget = std::time::Duration::from_secs(cfg.planner.time_budget_seconds);
    #[cfg(feature = "milp")]
    {
        Planner::new(Arc::new(crate::planner::MilpStrategy), budget)
    }
    #[cfg(not(feature = "milp"))]
    {
        Planner::new(
            Arc::new(crate::planner::CommitmentDpStrategy {
                volume_buckets: cfg.planner.volume_buckets,
                frequency_levels: 3,
            }),
            budget,
        )
    }
}

/// Shared application state handed to the reporting router, in the shape
/// the binary wires up.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub supervisor: Arc<Supervisor>,
}

impl AppState {
    /// Wire the pipeline against the simulated environment: seeded
    /// history, generated inflow/prices, simulated station.
    #[cfg(feature = "sim")]
    pub fn new_simulated(cfg: Config) -> Result<Self> {
        use crate::forecaster::SeasonalProfileForecaster;
        use crate::simulation::{seed_history, Environment, SimulatedPumpStation};

        let geometry = cfg.tunnel.geometry();
        let start = Utc::now();
        let state = Arc::new(RwLock::new(TunnelState::at_rest(
            &geometry,
            cfg.tunnel.initial_level_m,
            start,
        )));

        let environment = Environment::from_config(&cfg);
        let history = seed_history(&environment, start, 7 * 24);

        let station = Arc::new(SimulatedPumpStation::new(
            environment,
            Arc::clone(&state),
            cfg.pumps.catalog(),
        ));

        let forecaster = Arc::new(SeasonalProfileForecaster {
            min_history: Duration::hours(cfg.forecast.min_history_hours as i64),
            holdout: Duration::hours(cfg.forecast.holdout_hours as i64),
            confidence_z: cfg.forecast.confidence_z,
            validity: Duration::hours(cfg.supervisor.forecast_validity_hours as i64),
        });

        let supervisor = Arc::new(Supervisor::new(
            &cfg,
            forecaster,
            station,
            state,
            history,
        ));

        Ok(Self { cfg, supervisor })
    }
}

/// Spawn the two long-running loops: the planning cycle and the execution
/// tick. One planner solve can run while the executor keeps advancing the
/// current schedule; a new schedule installs only at a step boundary.
pub fn spawn_supervisor_tasks(state: AppState) {
    let supervisor = Arc::clone(&state.supervisor);
    let cycle_minutes = state.cfg.supervisor.cycle_minutes.max(1);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(cycle_minutes * 60));
        loop {
            interval.tick().await;
            match supervisor.run_cycle().await {
                Ok(schedule_id) => info!(schedule = %schedule_id, "planning cycle complete"),
                Err(err) => warn!(error = %err, "planning cycle failed"),
            }
        }
    });

    let supervisor = Arc::clone(&state.supervisor);
    let tick_seconds = state.cfg.supervisor.tick_seconds.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_seconds));
        loop {
            interval.tick().await;
            if let Err(err) = supervisor.execute_step().await {
                warn!(error = %err, "execution step failed");
            }
        }
    });
}
