//! Exact MILP encoding of the scheduling problem, solved through good_lp.
//!
//! Decision variables per pump and step: continuous drive frequency plus a
//! binary on/off indicator. Constraints: mass balance, level bounds with
//! the rain-aware surge cap, the outflow variation band, per-pump minimum
//! cycle windows, the frequency floor, and daily-emptying indicators. The
//! objective is energy cost with an epsilon price-rank term as the
//! deterministic tie-break.
//!
//! Flow and power are linearized between the band endpoints of each pump
//! curve, which is exact for flow (affinity-linear) and a modest
//! overestimate for shaft power mid-band.

use good_lp::{
    constraint, default_solver, variable, Expression, ProblemVariables, ResolutionError,
    Solution, SolverModel, Variable,
};
use uuid::Uuid;

use crate::domain::{
    ConstraintKind, ConstraintSet, Pump, PumpCommand, Schedule, ScheduleStatus, TrajectoryPoint,
};

use super::{price_ranks, PlanError, PlanRequest, PlanStrategy};

const TIE_BREAK_WEIGHT: f64 = 1e-7;

#[derive(Debug, Clone, Default)]
pub struct MilpStrategy;

struct LinearPump {
    flow_slope: f64,
    flow_intercept: f64,
    power_slope: f64,
    power_intercept: f64,
    min_frequency_hz: f64,
    max_frequency_hz: f64,
}

impl LinearPump {
    fn from_pump(pump: &Pump, constraints: &ConstraintSet) -> Self {
        let min_f = pump.min_frequency_hz.max(constraints.min_frequency_hz);
        let max_f = pump.max_frequency_hz;
        let span = (max_f - min_f).max(1e-6);
        let flow_slope = (pump.flow_at(max_f) - pump.flow_at(min_f)) / span;
        let power_slope = (pump.power_at(max_f) - pump.power_at(min_f)) / span;
        Self {
            flow_slope,
            flow_intercept: pump.flow_at(min_f) - flow_slope * min_f,
            power_slope,
            power_intercept: pump.power_at(min_f) - power_slope * min_f,
            min_frequency_hz: min_f,
            max_frequency_hz: max_f,
        }
    }

    /// flow = slope*freq + intercept*on; zero when off since freq is
    /// forced to zero together with `on`.
    fn flow(&self, freq: Variable, on: Variable) -> Expression {
        self.flow_slope * freq + self.flow_intercept * on
    }

    fn power(&self, freq: Variable, on: Variable) -> Expression {
        self.power_slope * freq + self.power_intercept * on
    }
}

struct MilpSolution {
    /// frequency per pump per step (0 = off)
    frequencies: Vec<Vec<f64>>,
    volumes: Vec<f64>,
}

impl PlanStrategy for MilpStrategy {
    fn name(&self) -> &'static str {
        "milp"
    }

    fn plan(&self, request: &PlanRequest) -> Result<Schedule, PlanError> {
        match self.solve(request, &request.constraints)? {
            Some(solution) => Ok(self.build_schedule(request, solution)),
            None => Err(PlanError::Infeasible {
                constraint: self.diagnose(request)?,
            }),
        }
    }
}

impl MilpStrategy {
    /// Same cumulative relaxation probe as the DP strategy: the first
    /// relaxation that unlocks feasibility names the tightest constraint.
    fn diagnose(&self, request: &PlanRequest) -> Result<ConstraintKind, PlanError> {
        let no_surge = request.constraints.without_surge_reserve();
        if self.solve(request, &no_surge)?.is_some() {
            return Ok(ConstraintKind::SurgeReserve);
        }
        let mut no_emptying = no_surge.clone();
        no_emptying.require_daily_emptying = false;
        if self.solve(request, &no_emptying)?.is_some() {
            return Ok(ConstraintKind::DailyEmptying);
        }
        let mut no_variation = no_emptying;
        no_variation.outflow_variation_m3h = f64::INFINITY;
        if self.solve(request, &no_variation)?.is_some() {
            return Ok(ConstraintKind::OutflowVariation);
        }
        Ok(ConstraintKind::StorageCapacity)
    }

    /// Encode and solve; Ok(None) means proven infeasible.
    fn solve(
        &self,
        request: &PlanRequest,
        constraints: &ConstraintSet,
    ) -> Result<Option<MilpSolution>, PlanError> {
        let points = &request.forecast.points;
        let n = points.len();
        let n_pumps = request.pumps.len();
        if n == 0 || n_pumps == 0 {
            return Ok(None);
        }

        let step_minutes = request.forecast.step_minutes.max(1);
        let dt_h = step_minutes as f64 / 60.0;
        let hard_cap = constraints.max_volume_m3.min(request.geometry.max_volume_m3);
        let reserved_cap = constraints.reserved_volume_cap_m3().min(hard_cap);
        let watermark_volume = request.geometry.level_to_volume(constraints.emptying_watermark_m);
        let cycle_steps =
            (constraints.min_pump_cycle.num_minutes().max(step_minutes) as f64
                / step_minutes as f64)
                .ceil() as usize;
        let steps_per_day = if (24 * 60) % step_minutes == 0 {
            (24 * 60 / step_minutes) as usize
        } else {
            0
        };
        let ranks = price_ranks(&request.forecast);

        let linear: Vec<LinearPump> = request
            .pumps
            .iter()
            .map(|p| LinearPump::from_pump(p, constraints))
            .collect();

        let mut vars = ProblemVariables::new();
        let freq: Vec<Vec<Variable>> = linear
            .iter()
            .map(|lp| vars.add_vector(variable().min(0.0).max(lp.max_frequency_hz), n))
            .collect();
        let on: Vec<Vec<Variable>> = (0..n_pumps)
            .map(|_| vars.add_vector(variable().binary(), n))
            .collect();
        let switch: Vec<Vec<Variable>> = (0..n_pumps)
            .map(|_| vars.add_vector(variable().binary(), n))
            .collect();
        let volume = vars.add_vector(variable().min(0.0).max(hard_cap), n + 1);
        let emptied: Vec<Variable> = if constraints.require_daily_emptying && steps_per_day > 0 {
            vars.add_vector(variable().binary(), n)
        } else {
            Vec::new()
        };

        let total_flow = |t: usize| -> Expression {
            (0..n_pumps)
                .map(|p| linear[p].flow(freq[p][t], on[p][t]))
                .sum()
        };

        let objective: Expression = (0..n)
            .map(|t| {
                let power: Expression = (0..n_pumps)
                    .map(|p| linear[p].power(freq[p][t], on[p][t]))
                    .sum();
                power * (points[t].price_eur_mwh * dt_h / 1_000.0)
                    + total_flow(t) * (TIE_BREAK_WEIGHT * ranks[t] as f64 / 1_000.0)
            })
            .sum();

        let mut model = vars.minimise(objective).using(default_solver);

        model = model.with(constraint!(volume[0] == request.state.volume_m3));

        for t in 0..n {
            // Mass balance.
            model = model.with(constraint!(
                volume[t + 1] == volume[t] + (points[t].inflow_mean_m3h * dt_h) - total_flow(t) * dt_h
            ));

            // Level bound, surge-reserve cap unless the forecast justifies
            // using the reserve.
            let cap = if points[t].rain_event(constraints.rain_probability_threshold) {
                hard_cap
            } else {
                reserved_cap
            };
            model = model.with(constraint!(volume[t + 1] <= cap));

            for p in 0..n_pumps {
                // Frequency floor when on, zero when off.
                model = model.with(constraint!(
                    freq[p][t] <= linear[p].max_frequency_hz * on[p][t]
                ));
                model = model.with(constraint!(
                    freq[p][t] >= linear[p].min_frequency_hz * on[p][t]
                ));

                // Switch indicators and the minimum cycle window: no two
                // switches of one pump within `cycle_steps`.
                if t > 0 {
                    model = model.with(constraint!(switch[p][t] >= on[p][t] - on[p][t - 1]));
                    model = model.with(constraint!(switch[p][t] >= on[p][t - 1] - on[p][t]));
                } else {
                    model = model.with(constraint!(switch[p][0] == 0.0));
                }
            }

            // Bounded outflow variation, anchored to the realized outflow
            // at the first step.
            if constraints.outflow_variation_m3h.is_finite() {
                let limit = constraints.outflow_variation_m3h;
                if t == 0 {
                    model = model.with(constraint!(
                        total_flow(0) - request.state.outflow_m3h <= limit
                    ));
                    model = model.with(constraint!(
                        request.state.outflow_m3h - total_flow(0) <= limit
                    ));
                } else {
                    model = model.with(constraint!(total_flow(t) - total_flow(t - 1) <= limit));
                    model = model.with(constraint!(total_flow(t - 1) - total_flow(t) <= limit));
                }
            }

            // Daily emptying indicator: e[t] = 1 forces the level below
            // the watermark at step t.
            if !emptied.is_empty() {
                model = model.with(constraint!(
                    volume[t + 1] <= watermark_volume + hard_cap * (1.0 - emptied[t])
                ));
            }
        }

        for p in 0..n_pumps {
            for window_start in 0..n.saturating_sub(cycle_steps) {
                let window: Expression = (window_start..window_start + cycle_steps + 1)
                    .map(|t| switch[p][t])
                    .sum();
                model = model.with(constraint!(window <= 1.0));
            }
        }

        if !emptied.is_empty() {
            for day_start in (0..n).step_by(steps_per_day) {
                let day_end = (day_start + steps_per_day).min(n);
                if day_end - day_start == steps_per_day {
                    let day: Expression = (day_start..day_end).map(|t| emptied[t]).sum();
                    model = model.with(constraint!(day >= 1.0));
                }
            }
        }

        match model.solve() {
            Ok(solution) => {
                let frequencies = (0..n_pumps)
                    .map(|p| {
                        (0..n)
                            .map(|t| {
                                if solution.value(on[p][t]) > 0.5 {
                                    solution.value(freq[p][t]).clamp(
                                        linear[p].min_frequency_hz,
                                        linear[p].max_frequency_hz,
                                    )
                                } else {
                                    0.0
                                }
                            })
                            .collect()
                    })
                    .collect();
                let volumes = (0..=n).map(|t| solution.value(volume[t])).collect();
                Ok(Some(MilpSolution {
                    frequencies,
                    volumes,
                }))
            }
            Err(ResolutionError::Infeasible) => Ok(None),
            Err(e) => Err(PlanError::Internal(e.to_string())),
        }
    }

    fn build_schedule(&self, request: &PlanRequest, solution: MilpSolution) -> Schedule {
        let points = &request.forecast.points;
        let n = points.len();
        let dt_h = request.forecast.step_minutes as f64 / 60.0;

        let mut commands = Vec::with_capacity(n * request.pumps.len());
        let mut predicted = Vec::with_capacity(n);
        let mut energy_cost_eur = 0.0;

        for (t, point) in points.iter().enumerate() {
            let mut outflow = 0.0;
            for (p, pump) in request.pumps.iter().enumerate() {
                let frequency_hz = solution.frequencies[p][t];
                outflow += pump.flow_at(frequency_hz);
                energy_cost_eur +=
                    pump.power_at(frequency_hz) * point.price_eur_mwh * dt_h / 1_000.0;
                commands.push(PumpCommand {
                    pump_id: pump.id.clone(),
                    frequency_hz,
                    effective_from: point.timestamp,
                });
            }
            predicted.push(TrajectoryPoint {
                timestamp: point.timestamp,
                level_m: request.geometry.volume_to_level(solution.volumes[t + 1]),
                outflow_m3h: outflow,
            });
        }

        Schedule {
            id: Uuid::new_v4(),
            forecast_id: request.forecast.id,
            generated_at: request.forecast.generated_at,
            step_minutes: request.forecast.step_minutes,
            status: ScheduleStatus::Proposed,
            suboptimal: false,
            overridden: false,
            energy_cost_eur,
            commands,
            predicted,
        }
    }
}

#[cfg(all(test, feature = "milp"))]
mod tests {
    use super::*;
    use crate::domain::{
        ConstraintSet, Forecast, ForecastPoint, PumpClass, PumpSpec, TunnelGeometry, TunnelState,
    };
    use chrono::{Duration, TimeZone, Utc};

    fn request(prices: Vec<f64>, inflow: f64) -> PlanRequest {
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
        let large = PumpSpec {
            nominal_flow_m3h: 8_000.0,
            rated_power_kw: 320.0,
            max_efficiency: 0.86,
            min_frequency_hz: 47.5,
            max_frequency_hz: 50.0,
            min_cycle: Duration::hours(2),
        };
        let pumps = vec![
            Pump::from_spec("S1", PumpClass::Small, &small),
            Pump::from_spec("S2", PumpClass::Small, &small),
            Pump::from_spec("L1", PumpClass::Large, &large),
            Pump::from_spec("L2", PumpClass::Large, &large),
        ];
        let points = prices
            .iter()
            .enumerate()
            .map(|(i, &price)| ForecastPoint {
                timestamp: start + Duration::hours(i as i64),
                inflow_mean_m3h: inflow,
                inflow_lower_m3h: inflow - 1_000.0,
                inflow_upper_m3h: inflow + 1_000.0,
                price_eur_mwh: price,
                rain_probability: 0.0,
            })
            .collect();
        let mut state = TunnelState::at_rest(&geometry, 4.0, start);
        state.inflow_m3h = inflow;
        state.outflow_m3h = inflow;
        PlanRequest {
            state,
            forecast: Forecast {
                id: uuid::Uuid::new_v4(),
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

    #[test]
    fn milp_respects_frequency_band() {
        let schedule = MilpStrategy.plan(&request(vec![75.0; 24], 9_000.0)).unwrap();
        for cmd in &schedule.commands {
            assert!(
                cmd.frequency_hz == 0.0 || (47.5..=50.0).contains(&cmd.frequency_hz),
                "frequency {} outside band",
                cmd.frequency_hz
            );
        }
    }

    #[test]
    fn milp_shifts_into_price_valley() {
        let prices: Vec<f64> = (0..24)
            .map(|h| if !(6..22).contains(&h) { 45.0 } else { 90.0 })
            .collect();
        let schedule = MilpStrategy.plan(&request(prices, 9_000.0)).unwrap();
        let valley: f64 = schedule
            .predicted
            .iter()
            .enumerate()
            .filter(|(h, _)| !(6..22).contains(&(*h as i64)))
            .map(|(_, p)| p.outflow_m3h)
            .sum();
        let peak: f64 = schedule
            .predicted
            .iter()
            .enumerate()
            .filter(|(h, _)| (6..22).contains(&(*h as i64)))
            .map(|(_, p)| p.outflow_m3h)
            .sum();
        assert!(valley / 8.0 > peak / 16.0);
    }

    #[test]
    fn milp_infeasible_cites_constraint() {
        let mut req = request(vec![75.0; 24], 10_000.0);
        for p in &mut req.forecast.points {
            p.inflow_mean_m3h = 95_000.0;
        }
        let err = MilpStrategy.plan(&req).unwrap_err();
        assert!(matches!(
            err,
            PlanError::Infeasible {
                constraint: ConstraintKind::StorageCapacity
            }
        ));
    }
}
