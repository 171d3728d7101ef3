//! MILP Allocation Optimizer
//!
//! Receding-horizon mixed-integer program deciding how much power each load tier
//! may draw from the battery over the next interval. Re-solved every control tick
//! from freshly measured SoC; only the first step is applied.
//!
//! The formulation considers:
//! - SoC balance over the horizon (`SOC[t] = SOC[t-1] - ΣP[t]`)
//! - an aggregate per-step discharge ceiling (fraction of capacity)
//! - critical load always served at its max
//! - big-M linked binary indicators switching each sheddable tier's SoC ramp on/off
//! - priority ordering between sheddable tiers
//!
//! Objective: maximize the weighted power served.

use std::collections::BTreeMap;

use good_lp::{
    constraint, default_solver, variable, Expression, ProblemVariables, Solution, SolverModel,
    Variable,
};
use tracing::{debug, warn};

use super::{OptimizationResult, OptimizerParams, PriorityOrdering, StepDecision};
use crate::domain::LoadTier;
use crate::error::ControlResult;

/// Values this close to a bound are snapped onto it
const SOLVER_EPSILON: f64 = 1e-7;

/// Pure allocation optimizer. Holds only parameters; all state arrives per call.
#[derive(Debug, Clone)]
pub struct AllocationOptimizer {
    params: OptimizerParams,
}

impl AllocationOptimizer {
    pub fn new(params: OptimizerParams) -> ControlResult<Self> {
        params.check()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &OptimizerParams {
        &self.params
    }

    /// Solve for the next interval starting from `soc_kwh` on a battery of
    /// `capacity_kwh`. Any non-optimal outcome is returned as an infeasible result.
    pub fn solve(&self, soc_kwh: f64, capacity_kwh: f64) -> OptimizationResult {
        if !soc_kwh.is_finite() || !capacity_kwh.is_finite() || capacity_kwh <= 0.0 {
            warn!(soc_kwh, capacity_kwh, "refusing to solve with invalid battery state");
            return OptimizationResult::infeasible(
                soc_kwh,
                capacity_kwh,
                format!("invalid battery state: soc={soc_kwh} capacity={capacity_kwh}"),
            );
        }

        match self.solve_lp(soc_kwh, capacity_kwh) {
            Ok(trace) => {
                debug!(soc_kwh, capacity_kwh, steps = trace.len(), "allocation solved");
                OptimizationResult::optimal(soc_kwh, capacity_kwh, trace)
            }
            Err(reason) => {
                warn!(soc_kwh, capacity_kwh, %reason, "allocation solve not optimal");
                OptimizationResult::infeasible(soc_kwh, capacity_kwh, reason)
            }
        }
    }

    fn solve_lp(&self, soc_kwh: f64, capacity_kwh: f64) -> Result<Vec<StepDecision>, String> {
        let params = &self.params;
        let n_steps = params.horizon_steps;
        let big_m = capacity_kwh;
        let ceiling_kw = params.discharge_ceiling_fraction * capacity_kwh;

        let mut vars = ProblemVariables::new();
        let mut power: Vec<BTreeMap<LoadTier, Variable>> = Vec::with_capacity(n_steps);
        let mut indicator: Vec<BTreeMap<LoadTier, Variable>> = Vec::with_capacity(n_steps);
        let mut soc: Vec<Variable> = Vec::with_capacity(n_steps);

        for _ in 0..n_steps {
            power.push(
                params
                    .tiers
                    .iter()
                    .map(|(tier, limits)| {
                        (*tier, vars.add(variable().min(0.0).max(limits.max_load_kw)))
                    })
                    .collect(),
            );
            soc.push(vars.add(variable().min(0.0).max(capacity_kwh)));
            indicator.push(
                params
                    .tiers
                    .keys()
                    .filter(|tier| tier.is_sheddable())
                    .map(|tier| (*tier, vars.add(variable().binary())))
                    .collect(),
            );
        }

        let objective = power
            .iter()
            .flat_map(|step| {
                step.iter()
                    .map(|(tier, var)| params.tiers[tier].weight * *var)
            })
            .sum::<Expression>();

        let mut model = vars.maximise(objective).using(default_solver);

        for t in 0..n_steps {
            let total = power[t].values().copied().sum::<Expression>();
            let soc_t = soc[t];

            // SoC balance: SOC[t] + ΣP[t] = SOC[t-1]
            model = if t == 0 {
                model.with(constraint!(soc_t + total.clone() == soc_kwh))
            } else {
                let previous_soc = soc[t - 1];
                model.with(constraint!(soc_t + total.clone() == previous_soc))
            };
            model = model.with(constraint!(total <= ceiling_kw));

            for (tier, limits) in &params.tiers {
                let p = power[t][tier];
                if !tier.is_sheddable() {
                    let max_load_kw = limits.max_load_kw;
                    model = model.with(constraint!(p == max_load_kw));
                    continue;
                }

                let Some(band) = limits.band else {
                    return Err(format!("sheddable tier {tier} has no SoC band"));
                };
                let ramp = band.ramp(capacity_kwh, limits.max_load_kw);
                let b = indicator[t][tier];

                model = model
                    // b = 1 only while SoC is at or above the band floor
                    .with(constraint!(soc_t >= big_m * b + (ramp.lower_kwh - big_m)))
                    // b = 0 only while SoC is at or below the band ceiling
                    .with(constraint!(soc_t <= big_m * b + ramp.upper_kwh))
                    .with(constraint!(p <= limits.max_load_kw * b))
                    .with(constraint!(
                        p <= ramp.slope * soc_t + (ramp.intercept + big_m) - big_m * b
                    ));
            }

            for pair in LoadTier::SHEDDABLE.windows(2) {
                let (higher, lower) = (pair[0], pair[1]);
                let (p_higher, p_lower) = (power[t][&higher], power[t][&lower]);
                let max_higher = params.max_load_kw(higher);
                let max_lower = params.max_load_kw(lower);
                model = match params.ordering {
                    PriorityOrdering::Normalized if max_higher > 0.0 => {
                        model.with(constraint!(max_higher * p_lower <= max_lower * p_higher))
                    }
                    _ => model.with(constraint!(p_lower <= p_higher)),
                };
            }
        }

        let solution = model.solve().map_err(|e| e.to_string())?;

        let trace = (0..n_steps)
            .map(|t| StepDecision {
                step: t + 1,
                power_kw: power[t]
                    .iter()
                    .map(|(tier, var)| {
                        let max = params.tiers[tier].max_load_kw;
                        (*tier, snap(solution.value(*var), max))
                    })
                    .collect(),
                soc_kwh: snap(solution.value(soc[t]), capacity_kwh),
                indicators: indicator[t]
                    .iter()
                    .map(|(tier, var)| (*tier, solution.value(*var) > 0.5))
                    .collect(),
            })
            .collect();

        Ok(trace)
    }
}

/// Clamp solver output into `[0, max]`, removing round-off at the bounds.
fn snap(value: f64, max: f64) -> f64 {
    if value < SOLVER_EPSILON {
        0.0
    } else if (value - max).abs() < SOLVER_EPSILON || value > max {
        max
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ControlError;
    use crate::optimizer::{SolveStatus, TierAllocation};
    use rstest::rstest;

    const TOLERANCE: f64 = 1e-6;

    fn optimizer(ordering: PriorityOrdering) -> AllocationOptimizer {
        AllocationOptimizer::new(OptimizerParams {
            ordering,
            ..Default::default()
        })
        .unwrap()
    }

    fn allocation(result: &OptimizationResult) -> &TierAllocation {
        result.allocation().expect("solve should be optimal")
    }

    #[test]
    fn test_full_battery_serves_every_tier() {
        let result = optimizer(PriorityOrdering::Normalized).solve(100.0, 100.0);

        assert_eq!(result.status, SolveStatus::Optimal);
        let alloc = allocation(&result);
        assert!((alloc.get(LoadTier::Critical) - 2.5).abs() < TOLERANCE);
        assert!((alloc.get(LoadTier::Medium) - 2.0).abs() < TOLERANCE);
        assert!((alloc.get(LoadTier::Low) - 3.0).abs() < TOLERANCE);
        assert!((result.trace[0].soc_kwh - 92.5).abs() < TOLERANCE);
    }

    #[test]
    fn test_low_soc_sheds_medium_and_low() {
        let result = optimizer(PriorityOrdering::Normalized).solve(60.0, 100.0);

        let alloc = allocation(&result);
        assert!((alloc.get(LoadTier::Critical) - 2.5).abs() < TOLERANCE);
        assert!(alloc.get(LoadTier::Medium).abs() < TOLERANCE);
        assert!(alloc.get(LoadTier::Low).abs() < TOLERANCE);
        assert_eq!(result.trace[0].indicators[&LoadTier::Medium], false);
        assert_eq!(result.trace[0].indicators[&LoadTier::Low], false);
    }

    #[test]
    fn test_absolute_ordering_caps_low_at_medium() {
        let result = optimizer(PriorityOrdering::Absolute).solve(100.0, 100.0);

        let alloc = allocation(&result);
        assert!((alloc.get(LoadTier::Medium) - 2.0).abs() < TOLERANCE);
        assert!((alloc.get(LoadTier::Low) - 2.0).abs() < TOLERANCE);
    }

    #[test]
    fn test_medium_ramps_inside_its_band() {
        // Low band floor (70) is out of reach, medium is on its ramp:
        // SOC1 = 72 - 2.5 - Pm, Pm <= 0.2 * SOC1 - 13  =>  Pm = 0.75
        let result = optimizer(PriorityOrdering::Normalized).solve(72.0, 100.0);

        let alloc = allocation(&result);
        assert!((alloc.get(LoadTier::Medium) - 0.75).abs() < 1e-4);
        assert!(alloc.get(LoadTier::Low).abs() < TOLERANCE);
    }

    #[rstest]
    #[case(100.0)]
    #[case(85.0)]
    #[case(78.0)]
    #[case(73.0)]
    #[case(66.0)]
    #[case(40.0)]
    fn test_invariants_hold_across_soc(
        #[case] soc_kwh: f64,
        #[values(PriorityOrdering::Absolute, PriorityOrdering::Normalized)]
        ordering: PriorityOrdering,
    ) {
        let result = optimizer(ordering).solve(soc_kwh, 100.0);
        let alloc = allocation(&result);

        assert!((alloc.get(LoadTier::Critical) - 2.5).abs() < TOLERANCE);
        let (medium, low) = (alloc.get(LoadTier::Medium), alloc.get(LoadTier::Low));
        match ordering {
            PriorityOrdering::Absolute => assert!(low <= medium + TOLERANCE),
            PriorityOrdering::Normalized => assert!(low / 3.0 <= medium / 2.0 + TOLERANCE),
        }
        assert!(alloc.total_kw() <= 20.0 + TOLERANCE);
    }

    #[test]
    fn test_multi_step_horizon_trace() {
        let optimizer = AllocationOptimizer::new(OptimizerParams {
            horizon_steps: 4,
            ..Default::default()
        })
        .unwrap();

        let result = optimizer.solve(80.0, 100.0);

        assert_eq!(result.trace.len(), 4);
        for (i, step) in result.trace.iter().enumerate() {
            assert_eq!(step.step, i + 1);
            assert!((step.power_kw[&LoadTier::Critical] - 2.5).abs() < TOLERANCE);
            assert!(
                step.power_kw[&LoadTier::Low] / 3.0
                    <= step.power_kw[&LoadTier::Medium] / 2.0 + TOLERANCE
            );
        }
        let first = TierAllocation::new(result.trace[0].power_kw.clone());
        assert_eq!(allocation(&result), &first);
    }

    #[test]
    fn test_critical_above_ceiling_is_infeasible() {
        // 0.2 * 10 kWh = 2 kW ceiling < 2.5 kW critical load
        let result = optimizer(PriorityOrdering::Normalized).solve(10.0, 10.0);

        assert_eq!(result.status, SolveStatus::Infeasible);
        assert!(result.trace.is_empty());
        assert!(matches!(result.allocation(), Err(ControlError::Infeasible(_))));
    }

    #[test]
    fn test_empty_battery_is_infeasible() {
        let result = optimizer(PriorityOrdering::Normalized).solve(1.0, 100.0);
        assert_eq!(result.status, SolveStatus::Infeasible);
    }

    #[test]
    fn test_invalid_state_is_infeasible() {
        let optimizer = optimizer(PriorityOrdering::Normalized);
        assert_eq!(optimizer.solve(f64::NAN, 100.0).status, SolveStatus::Infeasible);
        assert_eq!(optimizer.solve(50.0, 0.0).status, SolveStatus::Infeasible);
    }
}
