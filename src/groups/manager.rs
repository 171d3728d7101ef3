use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{info, warn};

use super::DeviceGroup;
use crate::controller::strategies::{
    ControlCommand, ControlStrategy, DispatchContext, OperatorCommand, Strategy, StrategyKind,
};
use crate::domain::{IssuedCommand, SharedDevice, TelemetryOutcome, TelemetryUpdate};
use crate::error::{ControlError, ControlResult};

/// Name of the superset group spanning every registered group
pub const ALL_DEVICES: &str = "all";

/// Strategy bound to a group together with the command it runs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assignment {
    pub strategy: Strategy,
    pub command: ControlCommand,
}

impl Assignment {
    pub fn new(command: ControlCommand) -> Self {
        Self {
            strategy: Strategy::for_kind(command.kind()),
            command,
        }
    }

    fn execute(
        &self,
        group: &DeviceGroup,
        ctx: &DispatchContext,
    ) -> ControlResult<Vec<IssuedCommand>> {
        self.strategy.execute(group, &self.command, ctx)
    }
}

/// Consumption summary for one group
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GroupSummary {
    pub name: String,
    pub device_count: usize,
    pub consumption_w: f64,
    pub strategy: Option<StrategyKind>,
    pub command: Option<ControlCommand>,
}

/// Registry of device groups and their strategy assignments.
///
/// Groups run in registration order. The merged superset is rebuilt on every
/// membership change so it always matches the union of the groups.
#[derive(Debug, Default)]
pub struct GroupManager {
    groups: Vec<DeviceGroup>,
    merged: DeviceGroup,
    assignments: HashMap<String, Assignment>,
    site: Option<Assignment>,
}

impl GroupManager {
    pub fn new() -> Self {
        Self {
            merged: DeviceGroup::new(ALL_DEVICES),
            ..Default::default()
        }
    }

    pub fn add_group(&mut self, group: DeviceGroup) -> ControlResult<()> {
        if group.name() == ALL_DEVICES || self.group(group.name()).is_some() {
            return Err(ControlError::DuplicateGroup(group.name().to_string()));
        }
        info!(group = group.name(), devices = group.len(), "group registered");
        self.groups.push(group);
        self.rebuild_merged();
        Ok(())
    }

    /// Remove a group together with its strategy assignment.
    pub fn remove_group(&mut self, name: &str) -> ControlResult<DeviceGroup> {
        let index = self.index_of(name)?;
        let group = self.groups.remove(index);
        self.assignments.remove(name);
        self.rebuild_merged();
        info!(group = name, "group removed");
        Ok(group)
    }

    pub fn group(&self, name: &str) -> Option<&DeviceGroup> {
        self.groups.iter().find(|g| g.name() == name)
    }

    pub fn groups(&self) -> &[DeviceGroup] {
        &self.groups
    }

    pub fn add_device(&mut self, group: &str, device: SharedDevice) -> ControlResult<()> {
        let index = self.index_of(group)?;
        self.groups[index].add(device)?;
        self.rebuild_merged();
        Ok(())
    }

    pub fn remove_device(&mut self, group: &str, device_id: &str) -> ControlResult<SharedDevice> {
        let index = self.index_of(group)?;
        let device = self.groups[index].remove(device_id)?;
        self.rebuild_merged();
        Ok(device)
    }

    /// Every device across all groups
    pub fn merged(&self) -> &DeviceGroup {
        &self.merged
    }

    pub fn device(&self, device_id: &str) -> Option<&SharedDevice> {
        self.merged.get(device_id)
    }

    pub fn group_by_priority(&self) -> BTreeMap<u8, DeviceGroup> {
        self.merged.group_by_priority()
    }

    /// Bind a strategy to a group, replacing any previous assignment.
    pub fn assign_strategy(
        &mut self,
        group: &str,
        command: ControlCommand,
    ) -> ControlResult<StrategyKind> {
        self.index_of(group)?;
        let assignment = Assignment::new(command);
        info!(group, strategy = %command.kind(), "strategy assigned");
        self.assignments.insert(group.to_string(), assignment);
        Ok(command.kind())
    }

    pub fn assign_operator_command(
        &mut self,
        group: &str,
        command: &OperatorCommand,
    ) -> ControlResult<StrategyKind> {
        let command = ControlCommand::from_operator(command)?;
        self.assign_strategy(group, command)
    }

    pub fn unassign_strategy(&mut self, group: &str) -> ControlResult<Option<Assignment>> {
        self.index_of(group)?;
        Ok(self.assignments.remove(group))
    }

    pub fn clear_strategies(&mut self) {
        self.assignments.clear();
    }

    pub fn assignment(&self, group: &str) -> Option<&Assignment> {
        self.assignments.get(group)
    }

    pub fn has_assignments(&self) -> bool {
        !self.assignments.is_empty()
    }

    /// Run each group's strategy in registration order.
    ///
    /// A failing group is logged and skipped; the remaining groups still run.
    pub fn execute_all(&self, ctx: &DispatchContext) -> ControlResult<Vec<IssuedCommand>> {
        if self.assignments.is_empty() {
            return Err(ControlError::NoStrategyAssigned);
        }
        // groups draw on one set of tier ceilings, in registration order
        let mut ctx = ctx.clone();
        let mut issued = Vec::new();
        for group in &self.groups {
            let Some(assignment) = self.assignments.get(group.name()) else {
                continue;
            };
            match assignment.execute(group, &ctx) {
                Ok(commands) => {
                    ctx.consume(group, &commands);
                    issued.extend(commands);
                }
                Err(e) => warn!(group = group.name(), error = %e, "group strategy failed"),
            }
        }
        Ok(issued)
    }

    /// Set the site-wide command applied to the merged superset, or clear it.
    pub fn set_site_command(&mut self, command: Option<ControlCommand>) {
        match command {
            Some(command) => {
                info!(strategy = %command.kind(), "site-wide command set");
                self.site = Some(Assignment::new(command));
            }
            None => {
                info!("site-wide command cleared");
                self.site = None;
            }
        }
    }

    pub fn site_command(&self) -> Option<ControlCommand> {
        self.site.map(|a| a.command)
    }

    /// Run the site-wide command once over every device.
    pub fn control_all_groups(&self, ctx: &DispatchContext) -> ControlResult<Vec<IssuedCommand>> {
        let site = self.site.as_ref().ok_or(ControlError::NoStrategyAssigned)?;
        site.execute(&self.merged, ctx)
    }

    /// Site command when set, otherwise the per-group assignments.
    pub fn dispatch(&self, ctx: &DispatchContext) -> ControlResult<Vec<IssuedCommand>> {
        if self.site.is_some() {
            self.control_all_groups(ctx)
        } else {
            self.execute_all(ctx)
        }
    }

    pub fn apply_telemetry(&self, update: &TelemetryUpdate) -> ControlResult<TelemetryOutcome> {
        let handle = self
            .device(&update.device_id)
            .ok_or_else(|| ControlError::MissingDevice {
                group: ALL_DEVICES.to_string(),
                device: update.device_id.clone(),
            })?;
        let outcome = handle.write().apply_telemetry(update);
        Ok(outcome)
    }

    pub fn consumption_by_group(&self) -> Vec<GroupSummary> {
        self.groups
            .iter()
            .map(|group| {
                let assignment = self.assignments.get(group.name());
                GroupSummary {
                    name: group.name().to_string(),
                    device_count: group.len(),
                    consumption_w: group.total_consumption_w(),
                    strategy: assignment.map(|a| a.command.kind()),
                    command: assignment.map(|a| a.command),
                }
            })
            .collect()
    }

    fn index_of(&self, name: &str) -> ControlResult<usize> {
        self.groups
            .iter()
            .position(|g| g.name() == name)
            .ok_or_else(|| ControlError::UnknownGroup(name.to_string()))
    }

    fn rebuild_merged(&mut self) {
        self.merged = DeviceGroup::merged(ALL_DEVICES, &self.groups);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Device, DeviceCapabilities, DeviceCommand, DeviceStatus, DeviceType, LoadTier,
    };
    use crate::optimizer::{OptimizerParams, TierAllocation};
    use chrono::Utc;

    fn plug(id: &str, priority: u8, rated_w: f64) -> SharedDevice {
        Device::new(id, DeviceType::SmartPlug, priority, rated_w, DeviceCapabilities::default())
            .into_shared()
    }

    fn manager() -> GroupManager {
        let mut manager = GroupManager::new();
        manager.add_group(DeviceGroup::new("essentials")).unwrap();
        manager.add_group(DeviceGroup::new("comfort")).unwrap();
        manager.add_device("essentials", plug("fridge", 0, 300.0)).unwrap();
        manager.add_device("comfort", plug("heater", 3, 2000.0)).unwrap();
        manager.add_device("comfort", plug("tv", 4, 200.0)).unwrap();
        manager
    }

    #[test]
    fn test_merged_tracks_membership() {
        let mut manager = manager();
        assert_eq!(manager.merged().len(), 3);

        manager.remove_device("comfort", "tv").unwrap();
        assert_eq!(manager.merged().len(), 2);
        assert!(manager.device("tv").is_none());

        manager.remove_group("essentials").unwrap();
        let ids: Vec<_> = manager.merged().device_ids().cloned().collect();
        assert_eq!(ids, vec!["heater".to_string()]);
    }

    #[test]
    fn test_group_errors() {
        let mut manager = manager();
        assert_eq!(
            manager.add_group(DeviceGroup::new("comfort")),
            Err(ControlError::DuplicateGroup("comfort".to_string()))
        );
        assert!(manager.add_group(DeviceGroup::new(ALL_DEVICES)).is_err());
        assert_eq!(
            manager.assign_strategy("garage", ControlCommand::Shed),
            Err(ControlError::UnknownGroup("garage".to_string()))
        );
        assert!(matches!(
            manager.add_device("comfort", plug("heater", 1, 10.0)),
            Err(ControlError::DuplicateDevice { .. })
        ));
    }

    #[test]
    fn test_execute_without_strategies_fails() {
        let manager = manager();
        assert_eq!(
            manager.execute_all(&DispatchContext::new(None)),
            Err(ControlError::NoStrategyAssigned)
        );
        assert_eq!(
            manager.control_all_groups(&DispatchContext::new(None)),
            Err(ControlError::NoStrategyAssigned)
        );
    }

    #[test]
    fn test_each_group_runs_its_own_strategy() {
        let mut manager = manager();
        manager
            .assign_strategy("essentials", ControlCommand::Direct { power_w: 250.0 })
            .unwrap();
        manager.assign_strategy("comfort", ControlCommand::Shed).unwrap();

        let issued = manager.execute_all(&DispatchContext::new(None)).unwrap();

        assert_eq!(issued.len(), 3);
        assert_eq!(issued[0].device_id, "fridge");
        assert_eq!(issued[0].strategy, StrategyKind::Direct);
        assert!(issued[1..]
            .iter()
            .all(|c| c.command == DeviceCommand::TurnOff && c.strategy == StrategyKind::Shed));
    }

    #[test]
    fn test_groups_share_tier_ceiling() {
        let mut manager = GroupManager::new();
        manager.add_group(DeviceGroup::new("kitchen")).unwrap();
        manager.add_group(DeviceGroup::new("laundry")).unwrap();
        manager.add_device("kitchen", plug("oven", 2, 2000.0)).unwrap();
        manager.add_device("laundry", plug("dryer", 2, 2000.0)).unwrap();
        for group in ["kitchen", "laundry"] {
            manager
                .assign_strategy(
                    group,
                    ControlCommand::LoadPriority {
                        distribution: Default::default(),
                    },
                )
                .unwrap();
        }
        let allocation = TierAllocation::new(BTreeMap::from([
            (LoadTier::Critical, 0.0),
            (LoadTier::Medium, 2.0),
            (LoadTier::Low, 0.0),
        ]));

        let issued = manager
            .execute_all(&DispatchContext::new(Some(allocation)))
            .unwrap();

        let medium_w: f64 = issued.iter().map(|c| c.command.target_power_w(0.0)).sum();
        assert!(medium_w <= 2000.0 + 1e-9, "medium tier commanded {medium_w} W");
        assert_eq!(issued[0].command, DeviceCommand::SetPower { watts: 2000.0 });
        assert_eq!(issued[1].command, DeviceCommand::TurnOff);
    }

    #[test]
    fn test_removing_group_drops_assignment() {
        let mut manager = manager();
        manager.assign_strategy("comfort", ControlCommand::Shed).unwrap();
        manager.remove_group("comfort").unwrap();
        assert!(manager.assignment("comfort").is_none());
        assert!(!manager.has_assignments());
    }

    #[test]
    fn test_operator_command_validation() {
        let mut manager = manager();
        let unknown = OperatorCommand {
            kind: "turbo".to_string(),
            value: None,
            distribution: None,
        };
        assert_eq!(
            manager.assign_operator_command("comfort", &unknown),
            Err(ControlError::UnknownStrategyKind("turbo".to_string()))
        );
        assert!(manager.assignment("comfort").is_none());

        let step = OperatorCommand {
            kind: "increment".to_string(),
            value: Some(100.0),
            distribution: None,
        };
        assert_eq!(
            manager.assign_operator_command("comfort", &step),
            Ok(StrategyKind::Incremental)
        );
    }

    #[test]
    fn test_site_command_overrides_groups() {
        let mut manager = manager();
        manager
            .assign_strategy("comfort", ControlCommand::Direct { power_w: 100.0 })
            .unwrap();
        manager.set_site_command(Some(ControlCommand::Shed));

        let issued = manager.dispatch(&DispatchContext::new(None)).unwrap();
        assert_eq!(issued.len(), 3);
        assert!(issued.iter().all(|c| c.strategy == StrategyKind::Shed));

        manager.set_site_command(None);
        let issued = manager.dispatch(&DispatchContext::new(None)).unwrap();
        assert_eq!(issued.len(), 2);
    }

    #[test]
    fn test_lpc_over_merged_devices() {
        let mut manager = manager();
        manager.set_site_command(Some(ControlCommand::LoadPriority {
            distribution: Default::default(),
        }));
        let allocation = TierAllocation::critical_only(&OptimizerParams::default());

        let issued = manager
            .control_all_groups(&DispatchContext::new(Some(allocation)))
            .unwrap();

        let fridge = issued.iter().find(|c| c.device_id == "fridge").unwrap();
        assert_eq!(fridge.command, DeviceCommand::SetPower { watts: 300.0 });
        assert_eq!(manager.device("heater").unwrap().read().status, DeviceStatus::Off);
    }

    #[test]
    fn test_telemetry_routing() {
        let manager = manager();
        let update = TelemetryUpdate {
            device_id: "heater".to_string(),
            current_a: 5.0,
            frequency_hz: 50.0,
            priority: 3,
            voltage_v: 230.0,
            command_echo: None,
            energy_consumption_wh: 0.0,
            temperature_c: 20.0,
            status: DeviceStatus::On,
            observed_at: Utc::now(),
        };
        assert_eq!(manager.apply_telemetry(&update), Ok(TelemetryOutcome::Applied));

        let summary = manager.consumption_by_group();
        assert!((summary[1].consumption_w - 1150.0).abs() < 1e-9);

        let unknown = TelemetryUpdate {
            device_id: "ghost".to_string(),
            ..update
        };
        assert!(matches!(
            manager.apply_telemetry(&unknown),
            Err(ControlError::MissingDevice { .. })
        ));
    }
}
