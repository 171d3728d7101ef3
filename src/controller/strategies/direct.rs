use tracing::debug;

use super::{
    controllable, mismatch, setpoint_command, ControlCommand, ControlStrategy, DispatchContext,
    StrategyKind,
};
use crate::domain::IssuedCommand;
use crate::error::{ControlError, ControlResult};
use crate::groups::DeviceGroup;

/// Sets every controllable device in the group to the commanded power,
/// clamped to its rating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectControl;

impl ControlStrategy for DirectControl {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    fn execute(
        &self,
        group: &DeviceGroup,
        command: &ControlCommand,
        ctx: &DispatchContext,
    ) -> ControlResult<Vec<IssuedCommand>> {
        let ControlCommand::Direct { power_w } = *command else {
            return Err(mismatch(self.kind(), command));
        };
        if !power_w.is_finite() {
            return Err(ControlError::InvalidCommand(format!(
                "direct power must be finite, got {power_w}"
            )));
        }

        let mut issued = Vec::with_capacity(group.len());
        for handle in group.devices() {
            let mut device = handle.write();
            if !controllable(&device, self.kind()) {
                continue;
            }
            let target_w = power_w.clamp(0.0, device.rated_power_w);
            issued.push(device.record_command(setpoint_command(target_w), self.kind(), ctx.issued_at));
        }
        debug!(group = group.name(), power_w, commands = issued.len(), "direct control applied");
        Ok(issued)
    }
}
