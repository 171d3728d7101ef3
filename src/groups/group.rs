use std::collections::BTreeMap;

use itertools::Itertools;
use tracing::{debug, error};

use crate::domain::{DeviceId, LoadTier, SharedDevice};
use crate::error::{ControlError, ControlResult};

/// Named set of devices addressed together by one strategy.
///
/// Devices are keyed by id, so iteration order is stable across ticks.
#[derive(Debug, Clone, Default)]
pub struct DeviceGroup {
    name: String,
    devices: BTreeMap<DeviceId, SharedDevice>,
}

impl DeviceGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            devices: BTreeMap::new(),
        }
    }

    /// Union of several groups; a device present in more than one keeps one entry.
    pub fn merged<'a>(
        name: impl Into<String>,
        groups: impl IntoIterator<Item = &'a DeviceGroup>,
    ) -> Self {
        let devices = groups
            .into_iter()
            .flat_map(|group| group.devices.iter())
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();
        Self {
            name: name.into(),
            devices,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&mut self, device: SharedDevice) -> ControlResult<()> {
        let id = device.read().id.clone();
        if self.devices.contains_key(&id) {
            error!(group = %self.name, device_id = %id, "device already in group");
            return Err(ControlError::DuplicateDevice {
                group: self.name.clone(),
                device: id,
            });
        }
        debug!(group = %self.name, device_id = %id, "device added to group");
        self.devices.insert(id, device);
        Ok(())
    }

    pub fn remove(&mut self, device_id: &str) -> ControlResult<SharedDevice> {
        self.devices
            .remove(device_id)
            .ok_or_else(|| ControlError::MissingDevice {
                group: self.name.clone(),
                device: device_id.to_string(),
            })
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<&SharedDevice> {
        self.devices.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> impl Iterator<Item = &SharedDevice> {
        self.devices.values()
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.devices.keys()
    }

    /// Partition into sub-groups by priority level, reading each device's current priority.
    pub fn group_by_priority(&self) -> BTreeMap<u8, DeviceGroup> {
        let levels = self
            .devices
            .values()
            .map(|handle| (handle.read().priority, handle.clone()))
            .sorted_by_key(|(priority, _)| *priority)
            .chunk_by(|(priority, _)| *priority);

        let mut partitions = BTreeMap::new();
        for (priority, members) in &levels {
            let mut group = DeviceGroup::new(format!("{}/p{priority}", self.name));
            for (_, handle) in members {
                let id = handle.read().id.clone();
                group.devices.insert(id, handle);
            }
            partitions.insert(priority, group);
        }
        partitions
    }

    /// Partition into the three load tiers. Tiers with no devices are omitted.
    pub fn group_by_tier(&self) -> BTreeMap<LoadTier, DeviceGroup> {
        let mut partitions: BTreeMap<LoadTier, DeviceGroup> = BTreeMap::new();
        for (priority, group) in self.group_by_priority() {
            let tier = LoadTier::from_priority(priority);
            let target = partitions
                .entry(tier)
                .or_insert_with(|| DeviceGroup::new(format!("{}/{tier}", self.name)));
            target.devices.extend(group.devices);
        }
        partitions
    }

    /// Sum of the latest measured power across members (W)
    pub fn total_consumption_w(&self) -> f64 {
        self.devices.values().map(|handle| handle.read().power_w).sum()
    }
}
