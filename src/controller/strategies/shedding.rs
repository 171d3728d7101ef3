use tracing::info;

use super::{controllable, mismatch, ControlCommand, ControlStrategy, DispatchContext, StrategyKind};
use crate::domain::{DeviceCommand, IssuedCommand};
use crate::error::ControlResult;
use crate::groups::DeviceGroup;

/// Turns off every controllable device in the group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SheddingControl;

impl ControlStrategy for SheddingControl {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Shed
    }

    fn execute(
        &self,
        group: &DeviceGroup,
        command: &ControlCommand,
        ctx: &DispatchContext,
    ) -> ControlResult<Vec<IssuedCommand>> {
        if !matches!(command, ControlCommand::Shed) {
            return Err(mismatch(self.kind(), command));
        }

        let issued: Vec<_> = group
            .devices()
            .filter_map(|handle| {
                let mut device = handle.write();
                controllable(&device, self.kind())
                    .then(|| device.record_command(DeviceCommand::TurnOff, self.kind(), ctx.issued_at))
            })
            .collect();
        info!(group = group.name(), shed = issued.len(), "group shed");
        Ok(issued)
    }
}
