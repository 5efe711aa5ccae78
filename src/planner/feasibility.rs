//! Closed-form necessary conditions checked before any solve. When a
//! condition fails the screen names the violated constraint, which is what
//! `InfeasibleSchedule` carries back to the supervisor.

use crate::domain::ConstraintKind;

use super::{PlanError, PlanRequest};

/// Screen the request against necessary feasibility conditions on the
/// max-pumping trajectory (the least volume any schedule can hold).
/// Violations are reported tightest first: physical storage capacity, then
/// the surge-reserve cap on non-rain steps, then daily-emptying
/// reachability. Passing the screen does not guarantee a feasible
/// schedule; failing it guarantees there is none.
pub fn screen(request: &PlanRequest) -> Result<(), PlanError> {
    let step_h = request.forecast.step_minutes as f64 / 60.0;
    let max_outflow: f64 = request
        .pumps
        .iter()
        .map(|p| p.flow_at(p.max_frequency_hz))
        .sum();

    let cons = &request.constraints;
    let hard_cap = cons.max_volume_m3.min(request.geometry.max_volume_m3);
    let reserved_cap = cons.reserved_volume_cap_m3().min(hard_cap);
    let watermark_volume = request.geometry.level_to_volume(cons.emptying_watermark_m);

    let steps_per_day = if request.forecast.step_minutes > 0 {
        (24 * 60 / request.forecast.step_minutes) as usize
    } else {
        0
    };

    let mut capacity_violated = false;
    let mut surge_violated = false;
    let mut emptying_violated = false;

    let mut floor_volume = request.state.volume_m3;
    let mut day_min = floor_volume;

    for (i, point) in request.forecast.points.iter().enumerate() {
        floor_volume =
            (floor_volume + (point.inflow_mean_m3h - max_outflow) * step_h).max(0.0);

        if floor_volume > hard_cap {
            capacity_violated = true;
        }
        let rain = point.rain_event(cons.rain_probability_threshold);
        if !rain && floor_volume > reserved_cap {
            surge_violated = true;
        }

        day_min = day_min.min(floor_volume);
        if cons.require_daily_emptying && steps_per_day > 0 && (i + 1) % steps_per_day == 0 {
            if day_min > watermark_volume {
                emptying_violated = true;
            }
            day_min = f64::INFINITY;
        }
    }

    let constraint = if capacity_violated {
        ConstraintKind::StorageCapacity
    } else if surge_violated {
        ConstraintKind::SurgeReserve
    } else if emptying_violated {
        ConstraintKind::DailyEmptying
    } else {
        return Ok(());
    };

    Err(PlanError::Infeasible { constraint })
}
