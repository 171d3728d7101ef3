use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{debug, info};
use uuid::Uuid;

use super::{LoadTier, StrategyKind};

pub type DeviceId = String;

/// Shared handle to a device. Groups and the merged superset hold clones of the
/// same handle; the lock is only held for short synchronous sections.
pub type SharedDevice = Arc<RwLock<Device>>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceType {
    EvCharger,
    SmartPlug,
    Generic,
}

/// What the core is allowed to do with a device
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub can_control_power: bool,
    pub is_deferrable: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            can_control_power: true,
            is_deferrable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Off,
    On,
}

/// Command payload sent to a device
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DeviceCommand {
    TurnOn,
    TurnOff,
    SetPower { watts: f64 },
}

impl DeviceCommand {
    /// Power the device is expected to draw once the command is applied
    pub fn target_power_w(&self, rated_power_w: f64) -> f64 {
        match self {
            DeviceCommand::TurnOn => rated_power_w,
            DeviceCommand::TurnOff => 0.0,
            DeviceCommand::SetPower { watts } => *watts,
        }
    }
}

/// Audit record of a command issued to a device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssuedCommand {
    pub id: Uuid,
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    pub priority: u8,
    pub command: DeviceCommand,
    pub strategy: StrategyKind,
    pub issued_at: DateTime<Utc>,
}

impl IssuedCommand {
    /// Wire payload delivered to the device bus
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "command_id": self.id,
            "issued_at": self.issued_at,
            "strategy": self.strategy,
            "command": self.command,
        })
    }
}

/// Latest electrical readings reported by the device
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceReadings {
    pub current_a: f64,
    pub voltage_v: f64,
    pub frequency_hz: f64,
    pub energy_consumption_wh: f64,
    pub temperature_c: f64,
    pub command_echo: Option<f64>,
}

/// Telemetry sample delivered by the device bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryUpdate {
    pub device_id: DeviceId,
    pub current_a: f64,
    pub frequency_hz: f64,
    pub priority: u8,
    pub voltage_v: f64,
    #[serde(default)]
    pub command_echo: Option<f64>,
    #[serde(default)]
    pub energy_consumption_wh: f64,
    #[serde(default)]
    pub temperature_c: f64,
    pub status: DeviceStatus,
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TelemetryOutcome {
    Applied,
    /// Sample older than the last one applied; ignored
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub device_type: DeviceType,
    /// Priority level; lower is more important, see [`LoadTier::from_priority`]
    pub priority: u8,
    pub power_w: f64,
    /// Highest power the device may be commanded to
    pub rated_power_w: f64,
    pub setpoint_w: Option<f64>,
    pub status: DeviceStatus,
    pub connected: bool,
    pub capabilities: DeviceCapabilities,
    pub readings: DeviceReadings,
    pub last_command: Option<IssuedCommand>,
    pub last_telemetry_at: Option<DateTime<Utc>>,
    pub control_attempts: u32,
}

impl Device {
    pub fn new(
        id: impl Into<DeviceId>,
        device_type: DeviceType,
        priority: u8,
        rated_power_w: f64,
        capabilities: DeviceCapabilities,
    ) -> Self {
        Self {
            id: id.into(),
            device_type,
            priority,
            power_w: 0.0,
            rated_power_w: rated_power_w.max(0.0),
            setpoint_w: None,
            status: DeviceStatus::Off,
            connected: false,
            capabilities,
            readings: DeviceReadings::default(),
            last_command: None,
            last_telemetry_at: None,
            control_attempts: 0,
        }
    }

    pub fn into_shared(self) -> SharedDevice {
        Arc::new(RwLock::new(self))
    }

    pub fn tier(&self) -> LoadTier {
        LoadTier::from_priority(self.priority)
    }

    pub fn can_control_power(&self) -> bool {
        self.capabilities.can_control_power
    }

    pub fn is_deferrable(&self) -> bool {
        self.capabilities.is_deferrable
    }

    /// Record a command as issued to this device and update the expected setpoint.
    pub fn record_command(
        &mut self,
        command: DeviceCommand,
        strategy: StrategyKind,
        issued_at: DateTime<Utc>,
    ) -> IssuedCommand {
        let target_w = command.target_power_w(self.rated_power_w);
        self.setpoint_w = Some(target_w);
        self.status = if target_w > 0.0 {
            DeviceStatus::On
        } else {
            DeviceStatus::Off
        };
        self.control_attempts = self.control_attempts.saturating_add(1);

        let issued = IssuedCommand {
            id: Uuid::new_v4(),
            device_id: self.id.clone(),
            device_type: self.device_type,
            priority: self.priority,
            command,
            strategy,
            issued_at,
        };
        self.last_command = Some(issued.clone());
        info!(
            device_id = %self.id,
            device_type = %self.device_type,
            priority = self.priority,
            target_w,
            strategy = %strategy,
            "device command issued"
        );
        issued
    }

    /// Apply a telemetry sample. Samples older than the last applied one are ignored.
    pub fn apply_telemetry(&mut self, update: &TelemetryUpdate) -> TelemetryOutcome {
        if let Some(last) = self.last_telemetry_at {
            if update.observed_at < last {
                debug!(
                    device_id = %self.id,
                    observed_at = %update.observed_at,
                    last = %last,
                    "discarding out-of-order telemetry"
                );
                return TelemetryOutcome::Stale;
            }
        }

        self.power_w = (update.voltage_v * update.current_a).max(0.0);
        self.priority = update.priority;
        self.status = update.status;
        self.connected = true;
        self.readings = DeviceReadings {
            current_a: update.current_a,
            voltage_v: update.voltage_v,
            frequency_hz: update.frequency_hz,
            energy_consumption_wh: update.energy_consumption_wh,
            temperature_c: update.temperature_c,
            command_echo: update.command_echo,
        };
        if self.power_w > self.rated_power_w {
            self.rated_power_w = self.power_w;
        }
        self.last_telemetry_at = Some(update.observed_at);

        debug!(
            device_id = %self.id,
            power_w = self.power_w,
            priority = self.priority,
            status = ?self.status,
            "device telemetry applied"
        );
        TelemetryOutcome::Applied
    }
}
