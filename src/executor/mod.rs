//! Schedule execution against the tunnel model, live or simulated.
//!
//! State machine: `Idle -> Executing -> {Idle (completed) | Deviated ->
//! Correcting -> Executing | Faulted}`. Each step applies the active
//! schedule's commands through the station port, advances the tunnel
//! model, and compares the realized level against the schedule's predicted
//! trajectory. Sustained deviation triggers a greedy local correction of
//! the running pumps without waiting for a planner re-run; capacity
//! overruns and rejected commands fault the executor until the supervisor
//! intervenes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use strum::Display;
use tracing::{info, warn};

use crate::domain::{DeviationReport, PumpCommand, PumpStation, Schedule, TunnelState};
use crate::model::{ModelError, TunnelModel};

const REPORT_HISTORY: usize = 288;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ExecutorPhase {
    Idle,
    Executing,
    Deviated,
    Correcting,
    Faulted,
}

/// Why the executor faulted; cleared only by supervisor intervention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FaultReason {
    CapacityExceeded { level_m: f64 },
    CommandRejected { detail: String },
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub tolerance_m: f64,
    /// Consecutive out-of-tolerance steps before entering `Deviated`.
    pub trigger_steps: usize,
    /// Fraction of the level error corrected per step.
    pub correction_gain: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tolerance_m: 0.3,
            trigger_steps: 3,
            correction_gain: 0.5,
        }
    }
}

/// Outcome of one execution step, handed back to the supervisor.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub phase: ExecutorPhase,
    pub report: Option<DeviationReport>,
}

pub struct Executor {
    model: TunnelModel,
    station: Arc<dyn PumpStation>,
    config: ExecutorConfig,
    phase: ExecutorPhase,
    active: Option<Schedule>,
    /// Newly approved schedule waiting for the next step boundary; the
    /// swap is atomic with respect to steps.
    pending: Option<Schedule>,
    correction: Option<Vec<PumpCommand>>,
    manual: HashMap<String, PumpCommand>,
    out_of_tolerance_streak: usize,
    fault: Option<FaultReason>,
    reports: VecDeque<DeviationReport>,
}

impl Executor {
    pub fn new(model: TunnelModel, station: Arc<dyn PumpStation>, config: ExecutorConfig) -> Self {
        Self {
            model,
            station,
            config,
            phase: ExecutorPhase::Idle,
            active: None,
            pending: None,
            correction: None,
            manual: HashMap::new(),
            out_of_tolerance_streak: 0,
            fault: None,
            reports: VecDeque::new(),
        }
    }

    pub fn phase(&self) -> ExecutorPhase {
        self.phase
    }

    pub fn fault(&self) -> Option<&FaultReason> {
        self.fault.as_ref()
    }

    pub fn active_schedule(&self) -> Option<&Schedule> {
        self.active.as_ref()
    }

    pub fn last_report(&self) -> Option<&DeviationReport> {
        self.reports.back()
    }

    pub fn recent_reports(&self, count: usize) -> Vec<DeviationReport> {
        let start = self.reports.len().saturating_sub(count);
        self.reports.iter().skip(start).copied().collect()
    }

    /// Queue an approved schedule. It becomes active at the next step
    /// boundary; when idle it activates immediately.
    pub fn install(&mut self, schedule: Schedule) {
        self.pending = Some(schedule);
        if matches!(self.phase, ExecutorPhase::Idle) {
            self.activate_pending();
        }
    }

    /// Operator-issued command outside the schedule. Transitions any state
    /// to `Executing`; the override is never silently reverted — it holds
    /// until the next schedule is installed.
    pub fn override_command(&mut self, command: PumpCommand) {
        warn!(
            pump = %command.pump_id,
            frequency_hz = command.frequency_hz,
            "manual override applied"
        );
        if let Some(schedule) = &mut self.active {
            schedule.overridden = true;
        }
        self.manual.insert(command.pump_id.clone(), command);
        self.fault = None;
        self.correction = None;
        self.out_of_tolerance_streak = 0;
        self.phase = ExecutorPhase::Executing;
    }

    /// Supervisor intervention after a fault.
    pub fn clear_fault(&mut self) {
        if matches!(self.phase, ExecutorPhase::Faulted) {
            self.fault = None;
            self.out_of_tolerance_streak = 0;
            self.phase = if self.active.is_some() {
                ExecutorPhase::Executing
            } else {
                ExecutorPhase::Idle
            };
        }
    }

    fn activate_pending(&mut self) {
        if let Some(next) = self.pending.take() {
            if let Some(mut old) = self.active.take() {
                old.supersede();
            }
            info!(schedule = %next.id, "schedule activated");
            self.active = Some(next);
            self.manual.clear();
            self.correction = None;
            self.out_of_tolerance_streak = 0;
            self.fault = None;
            self.phase = ExecutorPhase::Executing;
        }
    }

    /// Advance one schedule step from `state` (its timestamp is the step
    /// start and its inflow the measured `F1`). Returns the realized state
    /// and the step outcome.
    pub async fn step(&mut self, state: TunnelState) -> (TunnelState, StepResult) {
        // Atomic swap point: a newly approved schedule only takes over
        // between steps, never mid-step.
        if !matches!(self.phase, ExecutorPhase::Faulted) {
            self.activate_pending();
        }

        let phase = self.phase;
        match phase {
            ExecutorPhase::Idle | ExecutorPhase::Faulted => {
                return (state, self.result(None));
            }
            ExecutorPhase::Deviated => {
                // Correction was computed on the detection step; apply it
                // from this step on.
                self.phase = ExecutorPhase::Correcting;
            }
            _ => {}
        }

        let now = state.timestamp;
        let schedule = match &self.active {
            Some(s) => s,
            None => {
                self.phase = ExecutorPhase::Idle;
                return (state, self.result(None));
            }
        };

        if schedule.horizon_end().map_or(true, |end| now >= end) {
            info!(schedule = %schedule.id, "schedule horizon completed");
            self.phase = ExecutorPhase::Idle;
            return (state, self.result(None));
        }

        let step = schedule.step();
        let predicted_level = schedule.predicted_at(now).map(|p| p.level_m);
        let commands = self.effective_commands(now);

        // One retry on rejection, then fault.
        if let Err(first) = self.station.apply_commands(&commands).await {
            warn!(error = %first, "command batch rejected, retrying once");
            if let Err(second) = self.station.apply_commands(&commands).await {
                self.fault = Some(FaultReason::CommandRejected {
                    detail: second.to_string(),
                });
                self.phase = ExecutorPhase::Faulted;
                return (state, self.result(None));
            }
        }

        let next_state = match self.model.advance(&state, &commands, step) {
            Ok(next) => next,
            Err(ModelError::CapacityExceeded { level_m, .. }) => {
                self.fault = Some(FaultReason::CapacityExceeded { level_m });
                self.phase = ExecutorPhase::Faulted;
                return (state, self.result(None));
            }
            Err(ModelError::UnknownPump { pump_id }) => {
                self.fault = Some(FaultReason::CommandRejected {
                    detail: format!("unknown pump {}", pump_id),
                });
                self.phase = ExecutorPhase::Faulted;
                return (state, self.result(None));
            }
        };

        let report = predicted_level.map(|predicted| {
            DeviationReport::new(
                next_state.timestamp,
                predicted,
                next_state.level_m,
                self.config.tolerance_m,
            )
        });

        if let Some(report) = report {
            self.track_deviation(report, &next_state, now);
            self.push_report(report);
        }

        (next_state, self.result(report))
    }

    fn result(&self, report: Option<DeviationReport>) -> StepResult {
        StepResult {
            phase: self.phase,
            report,
        }
    }

    fn push_report(&mut self, report: DeviationReport) {
        self.reports.push_back(report);
        if self.reports.len() > REPORT_HISTORY {
            self.reports.pop_front();
        }
    }

    fn track_deviation(&mut self, report: DeviationReport, state: &TunnelState, now: DateTime<Utc>) {
        if report.within_tolerance {
            self.out_of_tolerance_streak = 0;
            if matches!(self.phase, ExecutorPhase::Correcting) {
                info!("deviation corrected, resuming schedule tracking");
                self.correction = None;
                self.phase = ExecutorPhase::Executing;
            }
            return;
        }

        self.out_of_tolerance_streak += 1;
        match self.phase {
            ExecutorPhase::Executing if self.out_of_tolerance_streak > self.config.trigger_steps => {
                warn!(
                    delta_m = report.delta_m,
                    streak = self.out_of_tolerance_streak,
                    "sustained deviation, computing local correction"
                );
                self.correction = Some(self.corrective_commands(report.delta_m, state, now));
                self.phase = ExecutorPhase::Deviated;
            }
            ExecutorPhase::Correcting => {
                // Still off target: refresh the correction from the latest
                // error.
                self.correction = Some(self.corrective_commands(report.delta_m, state, now));
            }
            _ => {}
        }
    }

    /// Greedy local re-balancing: trim the frequencies of the currently
    /// running pumps (catalog order) toward absorbing `delta_m` of level
    /// error per step. Commitment is untouched, so pump cycle constraints
    /// cannot be violated.
    fn corrective_commands(
        &self,
        delta_m: f64,
        state: &TunnelState,
        now: DateTime<Utc>,
    ) -> Vec<PumpCommand> {
        let schedule = match &self.active {
            Some(s) => s,
            None => return Vec::new(),
        };
        let geometry = self.model.geometry();
        let step_h = schedule.step().num_minutes() as f64 / 60.0;
        let volume_per_level = geometry.max_volume_m3 / geometry.max_level_m;
        let mut residual_m3h = self.config.correction_gain * delta_m * volume_per_level / step_h;

        let mut corrected = Vec::new();
        for base in self.effective_commands(now) {
            if base.frequency_hz <= 0.0 {
                continue;
            }
            let pump = match self.model.pump(&base.pump_id) {
                Some(p) => p,
                None => continue,
            };
            let current_flow = pump.flow_at(base.frequency_hz);
            let target_flow = current_flow + residual_m3h;
            let (bound_flow, bound_freq) = if residual_m3h > 0.0 {
                (pump.flow_at(pump.max_frequency_hz), pump.max_frequency_hz)
            } else {
                (pump.flow_at(pump.min_frequency_hz), pump.min_frequency_hz)
            };

            let (new_freq, achieved) = if (residual_m3h > 0.0 && target_flow >= bound_flow)
                || (residual_m3h < 0.0 && target_flow <= bound_flow)
            {
                (bound_freq, bound_flow - current_flow)
            } else {
                // Invert the locally linear flow curve.
                let span_flow = pump.flow_at(pump.max_frequency_hz)
                    - pump.flow_at(pump.min_frequency_hz);
                let span_freq = pump.max_frequency_hz - pump.min_frequency_hz;
                let slope = if span_flow.abs() < 1e-9 {
                    0.0
                } else {
                    span_freq / span_flow
                };
                let f = (base.frequency_hz + slope * residual_m3h)
                    .clamp(pump.min_frequency_hz, pump.max_frequency_hz);
                (f, pump.flow_at(f) - current_flow)
            };

            residual_m3h -= achieved;
            corrected.push(PumpCommand {
                pump_id: base.pump_id.clone(),
                frequency_hz: new_freq,
                effective_from: state.timestamp,
            });
            if residual_m3h.abs() < 1.0 {
                break;
            }
        }
        corrected
    }

    /// Commands for the step starting at `now`: schedule commands,
    /// overlaid with any active correction, overlaid with manual
    /// overrides (which always win).
    fn effective_commands(&self, now: DateTime<Utc>) -> Vec<PumpCommand> {
        let mut commands = self
            .active
            .as_ref()
            .map(|s| s.commands_at(now))
            .unwrap_or_default();

        if let Some(correction) = &self.correction {
            for corrected in correction {
                if let Some(slot) = commands.iter_mut().find(|c| c.pump_id == corrected.pump_id) {
                    slot.frequency_hz = corrected.frequency_hz;
                }
            }
        }

        for (pump_id, manual) in &self.manual {
            match commands.iter_mut().find(|c| &c.pump_id == pump_id) {
                Some(slot) => slot.frequency_hz = manual.frequency_hz,
                None => commands.push(manual.clone()),
            }
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        MockStation, Pump, PumpClass, PumpSpec, Schedule, ScheduleStatus, StationSnapshot,
        TrajectoryPoint, TunnelGeometry,
    };
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    // A small test basin makes level respond quickly to flow imbalance:
    // 1,250 m³ per metre of level.
    fn geometry() -> TunnelGeometry {
        TunnelGeometry::new(8.0, 10_000.0)
    }

    fn catalog() -> Vec<Pump> {
        let small = PumpSpec {
            nominal_flow_m3h: 5_000.0,
            rated_power_kw: 110.0,
            max_efficiency: 0.84,
            min_frequency_hz: 47.5,
            max_frequency_hz: 50.0,
            min_cycle: Duration::hours(2),
        };
        vec![
            Pump::from_spec("S1", PumpClass::Small, &small),
            Pump::from_spec("S2", PumpClass::Small, &small),
        ]
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    fn snapshot() -> StationSnapshot {
        StationSnapshot {
            timestamp: start(),
            level_m: 4.0,
            volume_m3: 5_000.0,
            inflow_m3h: 9_500.0,
            outflow_m3h: 9_500.0,
            pumps: vec![],
        }
    }

    /// Balanced 24h schedule: both pumps at band floor, 9,500 m³/h out,
    /// flat predicted level.
    fn balanced_schedule() -> Schedule {
        let commands = (0..24)
            .flat_map(|h| {
                let at = start() + Duration::hours(h);
                ["S1", "S2"].map(|id| PumpCommand {
                    pump_id: id.into(),
                    frequency_hz: 47.5,
                    effective_from: at,
                })
            })
            .collect();
        let predicted = (0..24)
            .map(|h| TrajectoryPoint {
                timestamp: start() + Duration::hours(h),
                level_m: 4.0,
                outflow_m3h: 9_500.0,
            })
            .collect();
        Schedule {
            id: Uuid::new_v4(),
            forecast_id: Uuid::new_v4(),
            generated_at: start(),
            step_minutes: 60,
            status: ScheduleStatus::Approved,
            suboptimal: false,
            overridden: false,
            energy_cost_eur: 0.0,
            commands,
            predicted,
        }
    }

    fn executor() -> Executor {
        let model = TunnelModel::new(geometry(), catalog(), 60.0);
        let station = Arc::new(MockStation::new(snapshot()));
        Executor::new(
            model,
            station,
            ExecutorConfig {
                tolerance_m: 0.3,
                trigger_steps: 2,
                correction_gain: 1.0,
            },
        )
    }

    fn state_at(hours: i64, level: f64, inflow: f64) -> TunnelState {
        let mut state = TunnelState::at_rest(&geometry(), level, start() + Duration::hours(hours));
        state.inflow_m3h = inflow;
        state.outflow_m3h = 9_500.0;
        state
    }

    #[tokio::test]
    async fn tracks_balanced_schedule_within_tolerance() {
        let mut exec = executor();
        exec.install(balanced_schedule());
        assert_eq!(exec.phase(), ExecutorPhase::Executing);

        let mut state = state_at(0, 4.0, 9_500.0);
        for _ in 0..4 {
            let (next, result) = exec.step(state).await;
            assert_eq!(result.phase, ExecutorPhase::Executing);
            let report = result.report.unwrap();
            assert!(report.within_tolerance);
            state = next;
            state.inflow_m3h = 9_500.0;
        }
    }

    #[tokio::test]
    async fn perturbation_walks_the_deviation_cycle() {
        let mut exec = executor();
        exec.install(balanced_schedule());

        // Inflow perturbed +500 m³/h: level climbs 0.4 m/h against a flat
        // prediction, out of tolerance from the first step.
        let mut state = state_at(0, 4.0, 10_000.0);
        let mut phases = Vec::new();
        for hour in 0..6 {
            let (next, result) = exec.step(state).await;
            phases.push(result.phase);
            state = next;
            // Perturbation lasts k+1 = 3 steps, then inflow returns to
            // normal while the correction drains the excess.
            state.inflow_m3h = if hour < 2 { 10_000.0 } else { 9_500.0 };
        }

        assert_eq!(phases[0], ExecutorPhase::Executing);
        assert_eq!(phases[1], ExecutorPhase::Executing);
        assert_eq!(phases[2], ExecutorPhase::Deviated);
        assert_eq!(phases[3], ExecutorPhase::Correcting);
        assert!(
            phases[4..].contains(&ExecutorPhase::Executing),
            "never recovered: {:?}",
            phases
        );
        assert!(exec.last_report().is_some());
    }

    #[tokio::test]
    async fn command_rejection_retries_then_faults() {
        let model = TunnelModel::new(geometry(), catalog(), 60.0);
        let station = Arc::new(MockStation::new(snapshot()));
        station.reject_next(2).await;
        let mut exec = Executor::new(model, Arc::clone(&station) as Arc<dyn PumpStation>, ExecutorConfig::default());
        exec.install(balanced_schedule());

        let (_, result) = exec.step(state_at(0, 4.0, 9_500.0)).await;
        assert_eq!(result.phase, ExecutorPhase::Faulted);
        assert!(matches!(
            exec.fault(),
            Some(FaultReason::CommandRejected { .. })
        ));

        exec.clear_fault();
        assert_eq!(exec.phase(), ExecutorPhase::Executing);
    }

    #[tokio::test]
    async fn single_rejection_is_retried_transparently() {
        let model = TunnelModel::new(geometry(), catalog(), 60.0);
        let station = Arc::new(MockStation::new(snapshot()));
        station.reject_next(1).await;
        let mut exec = Executor::new(model, Arc::clone(&station) as Arc<dyn PumpStation>, ExecutorConfig::default());
        exec.install(balanced_schedule());

        let (_, result) = exec.step(state_at(0, 4.0, 9_500.0)).await;
        assert_eq!(result.phase, ExecutorPhase::Executing);
    }

    #[tokio::test]
    async fn capacity_overrun_faults() {
        let mut exec = executor();
        exec.install(balanced_schedule());

        // 7.9m in a 10,000 m³ basin with a surge pouring in.
        let state = state_at(0, 7.9, 18_000.0);
        let (returned, result) = exec.step(state.clone()).await;
        assert_eq!(result.phase, ExecutorPhase::Faulted);
        assert!(matches!(
            exec.fault(),
            Some(FaultReason::CapacityExceeded { .. })
        ));
        // The failed step never mutates the state.
        assert_eq!(returned, state);
    }

    #[tokio::test]
    async fn manual_override_holds_until_new_schedule() {
        let mut exec = executor();
        exec.install(balanced_schedule());

        exec.override_command(PumpCommand {
            pump_id: "S2".into(),
            frequency_hz: 0.0,
            effective_from: start(),
        });
        assert_eq!(exec.phase(), ExecutorPhase::Executing);
        assert!(exec.active_schedule().unwrap().overridden);

        let commands = exec.effective_commands(start() + Duration::hours(3));
        let s2 = commands.iter().find(|c| c.pump_id == "S2").unwrap();
        assert_eq!(s2.frequency_hz, 0.0);

        // A newly installed schedule replaces the override explicitly.
        exec.install(balanced_schedule());
        let (_, _) = exec.step(state_at(0, 4.0, 9_500.0)).await;
        let commands = exec.effective_commands(start() + Duration::hours(1));
        let s2 = commands.iter().find(|c| c.pump_id == "S2").unwrap();
        assert_eq!(s2.frequency_hz, 47.5);
    }

    #[tokio::test]
    async fn pending_schedule_swaps_at_step_boundary() {
        let mut exec = executor();
        exec.install(balanced_schedule());
        let first_id = exec.active_schedule().unwrap().id;

        let replacement = balanced_schedule();
        let second_id = replacement.id;
        exec.install(replacement);
        // Not yet swapped: install only queues.
        assert_eq!(exec.active_schedule().unwrap().id, first_id);

        let (_, _) = exec.step(state_at(0, 4.0, 9_500.0)).await;
        assert_eq!(exec.active_schedule().unwrap().id, second_id);
    }

    #[tokio::test]
    async fn completed_horizon_returns_to_idle() {
        let mut exec = executor();
        exec.install(balanced_schedule());

        let (_, result) = exec.step(state_at(30, 4.0, 9_500.0)).await;
        assert_eq!(result.phase, ExecutorPhase::Idle);
    }
}
