use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use validator::Validate;

use super::{PriorityOrdering, SocBand};
use crate::domain::LoadTier;
use crate::error::{ControlError, ControlResult};

/// Per-tier limits fed to the optimizer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Validate)]
pub struct TierLimits {
    /// Maximum power the tier can draw (kW)
    #[validate(range(min = 0.0))]
    pub max_load_kw: f64,
    /// Objective weight; must strictly decrease from critical to low
    #[validate(range(min = 0.0))]
    pub weight: f64,
    /// Shed band, required for sheddable tiers and ignored for critical
    #[serde(default)]
    #[validate(nested)]
    pub band: Option<SocBand>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(default)]
pub struct OptimizerParams {
    /// Number of steps planned per solve; only the first one is applied
    #[validate(range(min = 1, max = 48))]
    pub horizon_steps: usize,
    /// Fraction of capacity that may be drawn per step
    #[validate(range(min = 0.0, max = 1.0))]
    pub discharge_ceiling_fraction: f64,
    pub ordering: PriorityOrdering,
    pub tiers: BTreeMap<LoadTier, TierLimits>,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        let tiers = BTreeMap::from([
            (
                LoadTier::Critical,
                TierLimits {
                    max_load_kw: 2.5,
                    weight: 100.0,
                    band: None,
                },
            ),
            (
                LoadTier::Medium,
                TierLimits {
                    max_load_kw: 2.0,
                    weight: 10.0,
                    band: Some(SocBand::MEDIUM_DEFAULT),
                },
            ),
            (
                LoadTier::Low,
                TierLimits {
                    max_load_kw: 3.0,
                    weight: 1.0,
                    band: Some(SocBand::LOW_DEFAULT),
                },
            ),
        ]);
        Self {
            horizon_steps: 1,
            discharge_ceiling_fraction: 0.2,
            ordering: PriorityOrdering::default(),
            tiers,
        }
    }
}

impl OptimizerParams {
    /// Check cross-field rules that range validation cannot express.
    ///
    /// Loads exceeding the discharge ceiling are accepted here; the solver reports
    /// them as infeasible.
    pub fn check(&self) -> ControlResult<()> {
        self.validate()?;
        if self.discharge_ceiling_fraction <= 0.0 {
            return Err(ControlError::InvalidConfig(
                "discharge_ceiling_fraction must be positive".to_string(),
            ));
        }

        let mut previous: Option<(LoadTier, f64)> = None;
        for tier in LoadTier::iter() {
            let limits = self
                .tiers
                .get(&tier)
                .ok_or_else(|| ControlError::InvalidConfig(format!("missing tier {tier}")))?;
            limits.validate()?;
            if !limits.max_load_kw.is_finite() || !limits.weight.is_finite() {
                return Err(ControlError::InvalidConfig(format!(
                    "tier {tier} limits must be finite"
                )));
            }
            if let Some((higher, weight)) = previous {
                if limits.weight >= weight {
                    return Err(ControlError::InvalidConfig(format!(
                        "tier {tier} weight {} must be below tier {higher} weight {weight}",
                        limits.weight
                    )));
                }
            }
            if tier.is_sheddable() {
                let band = limits.band.ok_or_else(|| {
                    ControlError::InvalidConfig(format!("sheddable tier {tier} needs a SoC band"))
                })?;
                if band.lower >= band.upper {
                    return Err(ControlError::InvalidConfig(format!(
                        "tier {tier} band lower {} must be below upper {}",
                        band.lower, band.upper
                    )));
                }
            }
            previous = Some((tier, limits.weight));
        }
        Ok(())
    }

    pub fn limits(&self, tier: LoadTier) -> Option<&TierLimits> {
        self.tiers.get(&tier)
    }

    pub fn max_load_kw(&self, tier: LoadTier) -> f64 {
        self.limits(tier).map(|l| l.max_load_kw).unwrap_or(0.0)
    }
}

/// Power ceiling per tier for one interval (kW)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TierAllocation {
    pub power_kw: BTreeMap<LoadTier, f64>,
}

impl TierAllocation {
    pub fn new(power_kw: BTreeMap<LoadTier, f64>) -> Self {
        Self { power_kw }
    }

    /// Critical tier at its max load, everything else shed
    pub fn critical_only(params: &OptimizerParams) -> Self {
        let power_kw = LoadTier::iter()
            .map(|tier| {
                let kw = if tier.is_sheddable() {
                    0.0
                } else {
                    params.max_load_kw(tier)
                };
                (tier, kw)
            })
            .collect();
        Self { power_kw }
    }

    pub fn get(&self, tier: LoadTier) -> f64 {
        self.power_kw.get(&tier).copied().unwrap_or(0.0)
    }

    pub fn total_kw(&self) -> f64 {
        self.power_kw.values().sum()
    }

    /// Take `kw` out of a tier's ceiling, never going below zero.
    pub fn reduce(&mut self, tier: LoadTier, kw: f64) {
        if let Some(ceiling) = self.power_kw.get_mut(&tier) {
            *ceiling = (*ceiling - kw.max(0.0)).max(0.0);
        }
    }
}

/// One planned step of the horizon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDecision {
    pub step: usize,
    pub power_kw: BTreeMap<LoadTier, f64>,
    /// Planned SoC at the end of the step; planning only, never fed back
    pub soc_kwh: f64,
    /// Whether SoC sits inside or above each sheddable tier's band
    pub indicators: BTreeMap<LoadTier, bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SolveStatus {
    Optimal,
    Infeasible,
}

/// Outcome of one solve. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub status: SolveStatus,
    /// SoC snapshot the solve started from (kWh)
    pub soc_kwh: f64,
    pub capacity_kwh: f64,
    /// First-step allocation; `None` unless optimal
    allocation: Option<TierAllocation>,
    pub trace: Vec<StepDecision>,
    pub reason: Option<String>,
    pub solved_at: DateTime<Utc>,
}

impl OptimizationResult {
    pub fn optimal(soc_kwh: f64, capacity_kwh: f64, trace: Vec<StepDecision>) -> Self {
        let allocation = trace
            .first()
            .map(|step| TierAllocation::new(step.power_kw.clone()));
        Self {
            status: SolveStatus::Optimal,
            soc_kwh,
            capacity_kwh,
            allocation,
            trace,
            reason: None,
            solved_at: Utc::now(),
        }
    }

    pub fn infeasible(soc_kwh: f64, capacity_kwh: f64, reason: impl Into<String>) -> Self {
        Self {
            status: SolveStatus::Infeasible,
            soc_kwh,
            capacity_kwh,
            allocation: None,
            trace: Vec::new(),
            reason: Some(reason.into()),
            solved_at: Utc::now(),
        }
    }

    pub fn is_optimal(&self) -> bool {
        self.status == SolveStatus::Optimal && self.allocation.is_some()
    }

    /// The usable allocation, or `Infeasible` when the solve did not succeed.
    pub fn allocation(&self) -> ControlResult<&TierAllocation> {
        match (&self.status, &self.allocation) {
            (SolveStatus::Optimal, Some(allocation)) => Ok(allocation),
            _ => Err(ControlError::Infeasible(
                self.reason
                    .clone()
                    .unwrap_or_else(|| "solver returned no allocation".to_string()),
            )),
        }
    }
}
