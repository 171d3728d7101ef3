//! Load priority control
//!
//! Turns the tick's tier allocation into device setpoints. Within each tier the
//! ceiling, less whatever uncontrollable members already draw, is split across
//! the controllable members so the issued setpoints never exceed it.

use tracing::debug;

use super::{
    controllable, mismatch, setpoint_command, ControlCommand, ControlStrategy, DispatchContext,
    Distribution, StrategyKind,
};
use crate::domain::{IssuedCommand, SharedDevice};
use crate::error::{ControlError, ControlResult};
use crate::groups::DeviceGroup;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadPriorityControl;

/// Device facts needed for a split, read once so no lock is held while sharing.
struct Candidate {
    handle: SharedDevice,
    id: String,
    priority: u8,
    rated_w: f64,
    deferrable: bool,
}

impl ControlStrategy for LoadPriorityControl {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LoadPriority
    }

    fn execute(
        &self,
        group: &DeviceGroup,
        command: &ControlCommand,
        ctx: &DispatchContext,
    ) -> ControlResult<Vec<IssuedCommand>> {
        let ControlCommand::LoadPriority { distribution } = *command else {
            return Err(mismatch(self.kind(), command));
        };
        let allocation = ctx.allocation.as_ref().ok_or_else(|| {
            ControlError::InvalidCommand("load priority control needs a tier allocation".to_string())
        })?;

        let mut issued = Vec::with_capacity(group.len());
        for (tier, members) in group.group_by_tier() {
            let ceiling_w = allocation.get(tier).max(0.0) * 1000.0;
            let mut uncontrolled_w = 0.0;
            let mut candidates = Vec::new();
            for handle in members.devices() {
                let device = handle.read();
                if controllable(&device, self.kind()) {
                    candidates.push(Candidate {
                        handle: handle.clone(),
                        id: device.id.clone(),
                        priority: device.priority,
                        rated_w: device.rated_power_w,
                        deferrable: device.is_deferrable(),
                    });
                } else {
                    uncontrolled_w += device.power_w;
                }
            }

            let budget_w = (ceiling_w - uncontrolled_w).max(0.0);
            let shares = match distribution {
                Distribution::Proportional => proportional_shares(&candidates, budget_w),
                Distribution::PriorityOrder => priority_order_shares(&mut candidates, budget_w),
            };
            debug!(
                group = group.name(),
                %tier,
                ceiling_w,
                uncontrolled_w,
                budget_w,
                "distributing tier ceiling"
            );

            for (candidate, share_w) in candidates.iter().zip(shares) {
                let mut device = candidate.handle.write();
                issued.push(device.record_command(
                    setpoint_command(share_w),
                    self.kind(),
                    ctx.issued_at,
                ));
            }
        }
        Ok(issued)
    }
}

fn proportional_shares(candidates: &[Candidate], budget_w: f64) -> Vec<f64> {
    let total_rated: f64 = candidates.iter().map(|c| c.rated_w).sum();
    if total_rated <= 0.0 {
        return vec![0.0; candidates.len()];
    }
    candidates
        .iter()
        .map(|c| (budget_w * c.rated_w / total_rated).min(c.rated_w))
        .collect()
}

/// Sorts candidates into fill order and returns their shares in that order.
fn priority_order_shares(candidates: &mut [Candidate], budget_w: f64) -> Vec<f64> {
    candidates.sort_by(|a, b| {
        a.deferrable
            .cmp(&b.deferrable)
            .then(a.priority.cmp(&b.priority))
            .then_with(|| a.id.cmp(&b.id))
    });
    let mut remaining_w = budget_w;
    candidates
        .iter()
        .map(|c| {
            let share = c.rated_w.min(remaining_w).max(0.0);
            remaining_w -= share;
            share
        })
        .collect()
}
