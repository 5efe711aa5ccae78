//! Independent schedule validation, deliberately separate from the
//! planner's own constraint encoding. The supervisor refuses to approve a
//! schedule that fails any of these checks, whatever the planner claimed.

use itertools::Itertools;

use crate::domain::{
    ConstraintKind, ConstraintSet, Forecast, Pump, Schedule, TunnelGeometry,
};

/// Numeric slack for float comparisons on levels, m.
const LEVEL_EPSILON_M: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct ConstraintViolation {
    pub constraint: ConstraintKind,
    pub detail: String,
}

/// Check every constraint family against the proposed schedule and the
/// forecast it was optimized for. Returns all violations found.
pub fn check_schedule(
    schedule: &Schedule,
    forecast: &Forecast,
    constraints: &ConstraintSet,
    pumps: &[Pump],
    geometry: &TunnelGeometry,
) -> Vec<ConstraintViolation> {
    let mut violations = Vec::new();
    check_frequencies(schedule, constraints, pumps, &mut violations);
    check_pump_cycles(schedule, constraints, pumps, &mut violations);
    check_levels(schedule, forecast, constraints, geometry, &mut violations);
    check_outflow_variation(schedule, constraints, &mut violations);
    check_daily_emptying(schedule, constraints, &mut violations);
    violations
}

/// Every command is either off or inside the pump's band, respecting the
/// process-wide frequency floor.
fn check_frequencies(
    schedule: &Schedule,
    constraints: &ConstraintSet,
    pumps: &[Pump],
    violations: &mut Vec<ConstraintViolation>,
) {
    for command in &schedule.commands {
        let Some(pump) = pumps.iter().find(|p| p.id == command.pump_id) else {
            violations.push(ConstraintViolation {
                constraint: ConstraintKind::FrequencyFloor,
                detail: format!("command for unknown pump {}", command.pump_id),
            });
            continue;
        };
        let floor = pump.min_frequency_hz.max(constraints.min_frequency_hz);
        let valid = command.frequency_hz == 0.0
            || (command.frequency_hz >= floor && command.frequency_hz <= pump.max_frequency_hz);
        if !valid {
            violations.push(ConstraintViolation {
                constraint: ConstraintKind::FrequencyFloor,
                detail: format!(
                    "{} commanded {:.2}Hz outside {{0}} u [{:.1}, {:.1}]",
                    command.pump_id, command.frequency_hz, floor, pump.max_frequency_hz
                ),
            });
        }
    }
}

/// No completed on/off run shorter than the minimum cycle. The run still
/// open at the horizon end is not judged — it continues beyond the plan.
fn check_pump_cycles(
    schedule: &Schedule,
    constraints: &ConstraintSet,
    pumps: &[Pump],
    violations: &mut Vec<ConstraintViolation>,
) {
    for pump in pumps {
        let series: Vec<_> = schedule
            .commands
            .iter()
            .filter(|c| c.pump_id == pump.id)
            .sorted_by_key(|c| c.effective_from)
            .collect();

        let mut switch_times = Vec::new();
        for pair in series.windows(2) {
            let was_on = pair[0].frequency_hz > 0.0;
            let is_on = pair[1].frequency_hz > 0.0;
            if was_on != is_on {
                switch_times.push(pair[1].effective_from);
            }
        }

        let min_cycle = constraints.min_pump_cycle;
        for pair in switch_times.windows(2) {
            let held = pair[1] - pair[0];
            if held < min_cycle {
                violations.push(ConstraintViolation {
                    constraint: ConstraintKind::PumpCycle,
                    detail: format!(
                        "{} held a state for {}min, minimum is {}min",
                        pump.id,
                        held.num_minutes(),
                        min_cycle.num_minutes()
                    ),
                });
            }
        }
    }
}

/// Predicted levels stay inside the physical bounds, and inside the
/// surge-reserve cap on steps whose forecast does not justify the reserve.
fn check_levels(
    schedule: &Schedule,
    forecast: &Forecast,
    constraints: &ConstraintSet,
    geometry: &TunnelGeometry,
    violations: &mut Vec<ConstraintViolation>,
) {
    let max_level = constraints.max_level_m.min(geometry.max_level_m);
    let reserved_level = geometry.volume_to_level(
        constraints.reserved_volume_cap_m3().min(geometry.max_volume_m3),
    );

    for point in &schedule.predicted {
        if point.level_m > max_level + LEVEL_EPSILON_M || point.level_m < -LEVEL_EPSILON_M {
            violations.push(ConstraintViolation {
                constraint: ConstraintKind::StorageCapacity,
                detail: format!(
                    "predicted level {:.2}m at {} outside [0, {:.2}]m",
                    point.level_m, point.timestamp, max_level
                ),
            });
        }

        let rain = forecast
            .points
            .iter()
            .find(|f| f.timestamp == point.timestamp)
            .map(|f| f.rain_event(constraints.rain_probability_threshold))
            .unwrap_or(false);
        if !rain && point.level_m > reserved_level + LEVEL_EPSILON_M {
            violations.push(ConstraintViolation {
                constraint: ConstraintKind::SurgeReserve,
                detail: format!(
                    "predicted level {:.2}m at {} eats into the surge reserve without rain cover",
                    point.level_m, point.timestamp
                ),
            });
        }
    }
}

fn check_outflow_variation(
    schedule: &Schedule,
    constraints: &ConstraintSet,
    violations: &mut Vec<ConstraintViolation>,
) {
    if !constraints.outflow_variation_m3h.is_finite() {
        return;
    }
    for pair in schedule.predicted.windows(2) {
        let delta = (pair[1].outflow_m3h - pair[0].outflow_m3h).abs();
        if delta > constraints.outflow_variation_m3h + 1.0 {
            violations.push(ConstraintViolation {
                constraint: ConstraintKind::OutflowVariation,
                detail: format!(
                    "outflow jumped {:.0} m³/h at {}, limit {:.0}",
                    delta, pair[1].timestamp, constraints.outflow_variation_m3h
                ),
            });
        }
    }
}

/// The level must return below the watermark in every full 24h window of
/// the horizon.
fn check_daily_emptying(
    schedule: &Schedule,
    constraints: &ConstraintSet,
    violations: &mut Vec<ConstraintViolation>,
) {
    if !constraints.require_daily_emptying {
        return;
    }
    let Some(start) = schedule.horizon_start() else {
        return;
    };
    let step_minutes = schedule.step_minutes.max(1);
    let steps_per_day = (24 * 60 / step_minutes) as usize;
    if steps_per_day == 0 {
        return;
    }

    for (day, window) in schedule.predicted.chunks(steps_per_day).enumerate() {
        if window.len() < steps_per_day {
            break;
        }
        let min_level = window.iter().map(|p| p.level_m).fold(f64::INFINITY, f64::min);
        if min_level > constraints.emptying_watermark_m {
            violations.push(ConstraintViolation {
                constraint: ConstraintKind::DailyEmptying,
                detail: format!(
                    "day {} starting {} never drains below {:.2}m (min {:.2}m)",
                    day,
                    start + chrono::Duration::minutes(step_minutes * (day * steps_per_day) as i64),
                    constraints.emptying_watermark_m,
                    min_level
                ),
            });
        }
    }
}
