//! Control Strategies
//!
//! Policies turning a command, and for load priority control the tick's
//! allocation, into per-device commands:
//! - Direct: exact power for every device
//! - Incremental: nudge setpoints by a fixed step
//! - Shedding: switch everything off
//! - LoadPriorityControl: split each tier's ceiling across its devices
//!
//! Shared contract: devices that cannot be power-controlled are skipped with a
//! warning, setpoints stay within `[0, rated_power_w]`, and every command is
//! recorded on the device with its timestamp.

pub mod direct;
pub mod incremental;
pub mod load_priority;
pub mod shedding;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub use direct::DirectControl;
pub use incremental::IncrementalControl;
pub use load_priority::LoadPriorityControl;
pub use shedding::SheddingControl;

pub use crate::domain::StrategyKind;

use crate::domain::{Device, DeviceCommand, IssuedCommand, LoadTier};
use crate::error::{ControlError, ControlResult};
use crate::groups::DeviceGroup;
use crate::optimizer::TierAllocation;

/// Setpoints below this are sent as a plain turn-off
const MIN_SETPOINT_W: f64 = 1.0;

/// How load priority control splits a tier ceiling inside a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// Proportional to rated power
    #[default]
    Proportional,
    /// Greedy fill: non-deferrable first, then by priority level and id
    PriorityOrder,
}

/// Command bound to a group together with its strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ControlCommand {
    #[serde(rename = "direct")]
    Direct { power_w: f64 },
    #[serde(rename = "increment")]
    Incremental { step_w: f64 },
    #[serde(rename = "shed")]
    Shed,
    #[serde(rename = "lpc")]
    LoadPriority {
        #[serde(default)]
        distribution: Distribution,
    },
}

impl ControlCommand {
    pub fn kind(&self) -> StrategyKind {
        match self {
            ControlCommand::Direct { .. } => StrategyKind::Direct,
            ControlCommand::Incremental { .. } => StrategyKind::Incremental,
            ControlCommand::Shed => StrategyKind::Shed,
            ControlCommand::LoadPriority { .. } => StrategyKind::LoadPriority,
        }
    }

    /// Build a command from loosely typed operator input.
    pub fn from_operator(command: &OperatorCommand) -> ControlResult<Self> {
        let kind = StrategyKind::parse(&command.kind)?;
        let value = |name: &str| {
            command
                .value
                .filter(|v| v.is_finite())
                .ok_or_else(|| {
                    ControlError::InvalidCommand(format!("{kind} command needs a finite {name}"))
                })
        };
        Ok(match kind {
            StrategyKind::Direct => ControlCommand::Direct {
                power_w: value("power_w")?,
            },
            StrategyKind::Incremental => ControlCommand::Incremental {
                step_w: value("step_w")?,
            },
            StrategyKind::Shed => ControlCommand::Shed,
            StrategyKind::LoadPriority => ControlCommand::LoadPriority {
                distribution: command.distribution.unwrap_or_default(),
            },
        })
    }
}

/// Operator-facing command: a textual kind plus an optional numeric parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorCommand {
    pub kind: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub distribution: Option<Distribution>,
}

/// Per-tick inputs shared by every strategy execution.
///
/// When groups run one after another, `allocation` holds what is left of each
/// tier ceiling after the groups already dispatched this tick.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub allocation: Option<TierAllocation>,
    pub issued_at: DateTime<Utc>,
}

impl DispatchContext {
    pub fn new(allocation: Option<TierAllocation>) -> Self {
        Self {
            allocation,
            issued_at: Utc::now(),
        }
    }

    /// Charge a dispatched group's draw against the remaining tier ceilings.
    ///
    /// Commanded devices count at their new setpoint, the rest at measured power.
    pub fn consume(&mut self, group: &DeviceGroup, issued: &[IssuedCommand]) {
        let Some(allocation) = self.allocation.as_mut() else {
            return;
        };
        let mut used_w: BTreeMap<LoadTier, f64> = BTreeMap::new();
        for handle in group.devices() {
            let device = handle.read();
            let draw_w = issued
                .iter()
                .rev()
                .find(|c| c.device_id == device.id)
                .map(|c| c.command.target_power_w(device.rated_power_w))
                .unwrap_or(device.power_w);
            *used_w.entry(device.tier()).or_default() += draw_w;
        }
        for (tier, watts) in used_w {
            allocation.reduce(tier, watts / 1000.0);
        }
    }
}

pub trait ControlStrategy {
    fn kind(&self) -> StrategyKind;

    fn execute(
        &self,
        group: &DeviceGroup,
        command: &ControlCommand,
        ctx: &DispatchContext,
    ) -> ControlResult<Vec<IssuedCommand>>;
}

/// The four strategy variants behind one `execute` contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct(DirectControl),
    Incremental(IncrementalControl),
    Shedding(SheddingControl),
    LoadPriority(LoadPriorityControl),
}

impl Strategy {
    pub fn for_kind(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::Direct => Strategy::Direct(DirectControl),
            StrategyKind::Incremental => Strategy::Incremental(IncrementalControl),
            StrategyKind::Shed => Strategy::Shedding(SheddingControl),
            StrategyKind::LoadPriority => Strategy::LoadPriority(LoadPriorityControl),
        }
    }

    fn inner(&self) -> &dyn ControlStrategy {
        match self {
            Strategy::Direct(s) => s,
            Strategy::Incremental(s) => s,
            Strategy::Shedding(s) => s,
            Strategy::LoadPriority(s) => s,
        }
    }
}

impl ControlStrategy for Strategy {
    fn kind(&self) -> StrategyKind {
        self.inner().kind()
    }

    fn execute(
        &self,
        group: &DeviceGroup,
        command: &ControlCommand,
        ctx: &DispatchContext,
    ) -> ControlResult<Vec<IssuedCommand>> {
        if command.kind() != self.kind() {
            return Err(ControlError::InvalidCommand(format!(
                "{} strategy cannot execute a {} command",
                self.kind(),
                command.kind()
            )));
        }
        self.inner().execute(group, command, ctx)
    }
}

/// Warns and returns false for devices the core may not command.
pub(crate) fn controllable(device: &Device, kind: StrategyKind) -> bool {
    if device.can_control_power() {
        return true;
    }
    warn!(
        device_id = %device.id,
        strategy = %kind,
        "device does not support power control, skipping"
    );
    false
}

pub(crate) fn setpoint_command(power_w: f64) -> DeviceCommand {
    if power_w < MIN_SETPOINT_W {
        DeviceCommand::TurnOff
    } else {
        DeviceCommand::SetPower { watts: power_w }
    }
}

pub(crate) fn mismatch(expected: StrategyKind, command: &ControlCommand) -> ControlError {
    ControlError::InvalidCommand(format!(
        "{expected} strategy received a {} command",
        command.kind()
    ))
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::domain::{Device, DeviceCapabilities, DeviceType, SharedDevice};
    use crate::groups::DeviceGroup;

    pub fn device(id: &str, priority: u8, rated_w: f64, controllable: bool) -> SharedDevice {
        let mut device = Device::new(
            id,
            DeviceType::SmartPlug,
            priority,
            rated_w,
            DeviceCapabilities {
                can_control_power: controllable,
                is_deferrable: false,
            },
        );
        device.power_w = rated_w / 2.0;
        device.into_shared()
    }

    pub fn group(devices: Vec<SharedDevice>) -> DeviceGroup {
        let mut group = DeviceGroup::new("test");
        for device in devices {
            group.add(device).unwrap();
        }
        group
    }
}
