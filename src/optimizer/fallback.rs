use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{OptimizerParams, TierAllocation};

/// What the controller applies when a solve is not optimal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Keep the previous tick's allocation; shed non-critical if there is none
    HoldLast,
    /// Serve critical at its max load and shed everything else
    #[default]
    ShedNonCritical,
}

/// Allocation to apply in place of an infeasible solve, and the policy actually used.
pub fn fallback_allocation(
    policy: FallbackPolicy,
    previous: Option<&TierAllocation>,
    params: &OptimizerParams,
) -> (TierAllocation, FallbackPolicy) {
    match (policy, previous) {
        (FallbackPolicy::HoldLast, Some(previous)) => (previous.clone(), FallbackPolicy::HoldLast),
        (FallbackPolicy::HoldLast, None) => {
            warn!("no previous allocation to hold, shedding non-critical tiers");
            (
                TierAllocation::critical_only(params),
                FallbackPolicy::ShedNonCritical,
            )
        }
        (FallbackPolicy::ShedNonCritical, _) => (
            TierAllocation::critical_only(params),
            FallbackPolicy::ShedNonCritical,
        ),
    }
}
