//! Allocation scenarios against the shipped configuration.

use proptest::prelude::*;
use resiliency_controller::config::Config;
use resiliency_controller::domain::LoadTier;
use resiliency_controller::optimizer::{
    fallback_allocation, AllocationOptimizer, FallbackPolicy, OptimizerParams, PriorityOrdering,
    SolveStatus,
};

const TOLERANCE: f64 = 1e-6;

fn shipped_optimizer() -> AllocationOptimizer {
    let cfg = Config::from_file("config/default.toml").expect("default config should load");
    AllocationOptimizer::new(cfg.optimizer).expect("default optimizer params are valid")
}

#[test]
fn full_battery_serves_every_tier() {
    let result = shipped_optimizer().solve(100.0, 100.0);
    let allocation = result.allocation().unwrap();

    assert!((allocation.get(LoadTier::Critical) - 2.5).abs() < TOLERANCE);
    assert!((allocation.get(LoadTier::Medium) - 2.0).abs() < TOLERANCE);
    assert!((allocation.get(LoadTier::Low) - 3.0).abs() < TOLERANCE);
}

#[test]
fn depleted_battery_keeps_only_critical() {
    let result = shipped_optimizer().solve(60.0, 100.0);
    let allocation = result.allocation().unwrap();

    assert!((allocation.get(LoadTier::Critical) - 2.5).abs() < TOLERANCE);
    assert!(allocation.get(LoadTier::Medium).abs() < TOLERANCE);
    assert!(allocation.get(LoadTier::Low).abs() < TOLERANCE);
}

#[test]
fn undersized_battery_falls_back() {
    let optimizer = shipped_optimizer();
    let previous = optimizer.solve(100.0, 100.0).allocation().unwrap().clone();

    // 0.2 * 12 kWh leaves a 2.4 kW ceiling for a 2.5 kW critical load
    let result = optimizer.solve(12.0, 12.0);
    assert_eq!(result.status, SolveStatus::Infeasible);
    assert!(result.allocation().is_err());

    let (held, used) =
        fallback_allocation(FallbackPolicy::HoldLast, Some(&previous), optimizer.params());
    assert_eq!(used, FallbackPolicy::HoldLast);
    assert_eq!(held, previous);

    let (shed, used) =
        fallback_allocation(FallbackPolicy::ShedNonCritical, Some(&previous), optimizer.params());
    assert_eq!(used, FallbackPolicy::ShedNonCritical);
    assert_eq!(shed.get(LoadTier::Critical), 2.5);
    assert_eq!(shed.total_kw(), 2.5);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn feasible_solves_respect_priorities(
        soc_kwh in 10.0f64..100.0,
        absolute in any::<bool>(),
    ) {
        let ordering = if absolute {
            PriorityOrdering::Absolute
        } else {
            PriorityOrdering::Normalized
        };
        let optimizer = AllocationOptimizer::new(OptimizerParams {
            ordering,
            ..Default::default()
        })
        .unwrap();

        let result = optimizer.solve(soc_kwh, 100.0);
        let allocation = result.allocation().unwrap();
        let (critical, medium, low) = (
            allocation.get(LoadTier::Critical),
            allocation.get(LoadTier::Medium),
            allocation.get(LoadTier::Low),
        );

        prop_assert!((critical - 2.5).abs() < TOLERANCE);
        prop_assert!(medium >= 0.0 && medium <= 2.0 + TOLERANCE);
        prop_assert!(low >= 0.0 && low <= 3.0 + TOLERANCE);
        match ordering {
            PriorityOrdering::Absolute => prop_assert!(low <= medium + TOLERANCE),
            PriorityOrdering::Normalized => prop_assert!(2.0 * low <= 3.0 * medium + 1e-5),
        }
        prop_assert!(allocation.total_kw() <= 20.0 + TOLERANCE);
        prop_assert!((result.trace[0].soc_kwh - (soc_kwh - allocation.total_kw())).abs() < 1e-5);
    }
}
