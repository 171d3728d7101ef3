use super::{
    controllable, mismatch, setpoint_command, ControlCommand, ControlStrategy, DispatchContext,
    StrategyKind,
};
use crate::domain::IssuedCommand;
use crate::error::{ControlError, ControlResult};
use crate::groups::DeviceGroup;

/// Moves each device's setpoint by a fixed step, starting from the last
/// setpoint or the measured power when none was issued yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncrementalControl;

impl ControlStrategy for IncrementalControl {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Incremental
    }

    fn execute(
        &self,
        group: &DeviceGroup,
        command: &ControlCommand,
        ctx: &DispatchContext,
    ) -> ControlResult<Vec<IssuedCommand>> {
        let ControlCommand::Incremental { step_w } = *command else {
            return Err(mismatch(self.kind(), command));
        };
        if !step_w.is_finite() {
            return Err(ControlError::InvalidCommand(format!(
                "increment step must be finite, got {step_w}"
            )));
        }

        let mut issued = Vec::with_capacity(group.len());
        for handle in group.devices() {
            let mut device = handle.write();
            if !controllable(&device, self.kind()) {
                continue;
            }
            let base_w = device.setpoint_w.unwrap_or(device.power_w);
            let target_w = (base_w + step_w).clamp(0.0, device.rated_power_w);
            issued.push(device.record_command(setpoint_command(target_w), self.kind(), ctx.issued_at));
        }
        Ok(issued)
    }
}
