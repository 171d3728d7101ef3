use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use validator::Validate;

use crate::controller::strategies::{ControlCommand, OperatorCommand};
use crate::domain::{BatteryParams, Device, DeviceCapabilities, DeviceType};
use crate::error::{ControlError, ControlResult};
use crate::groups::{DeviceGroup, GroupManager};
use crate::optimizer::{FallbackPolicy, OptimizerParams};

const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
const ENV_PREFIX: &str = "RESILIENCY__";

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub controller: ControllerConfig,
    pub battery: BatteryParams,
    pub optimizer: OptimizerParams,
    pub groups: Vec<GroupConfig>,
    pub devices: Vec<DeviceConfig>,
    /// Command applied to every device, overriding per-group strategies
    pub site_command: Option<OperatorCommand>,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[validate(range(min = 1))]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            request_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ControllerConfig {
    #[validate(range(min = 1))]
    pub tick_seconds: u64,
    #[validate(range(min = 1))]
    pub state_read_timeout_ms: u64,
    #[validate(range(min = 1))]
    pub publish_timeout_ms: u64,
    pub fallback: FallbackPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: 60,
            state_read_timeout_ms: 2_000,
            publish_timeout_ms: 1_000,
            fallback: FallbackPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default)]
    pub strategy: Option<OperatorCommand>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DeviceConfig {
    #[validate(length(min = 1))]
    pub id: String,
    pub device_type: DeviceType,
    pub priority: u8,
    #[validate(range(min = 0.0))]
    pub rated_power_w: f64,
    pub group: String,
    #[serde(default = "default_true")]
    pub can_control_power: bool,
    #[serde(default)]
    pub is_deferrable: bool,
}

fn default_true() -> bool {
    true
}

impl DeviceConfig {
    pub fn build(&self) -> Device {
        Device::new(
            self.id.clone(),
            self.device_type,
            self.priority,
            self.rated_power_w,
            DeviceCapabilities {
                can_control_power: self.can_control_power,
                is_deferrable: self.is_deferrable,
            },
        )
    }
}

/// In-process stand-ins used when no field bus is attached
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Discharge the simulated storage by the measured load every tick
    pub draw_load: bool,
    /// Feed published commands back as device telemetry
    pub echo_telemetry: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            draw_load: true,
            echo_telemetry: true,
        }
    }
}

impl Config {
    /// Load `config/default.toml` overlaid with `RESILIENCY__*` environment variables.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(DEFAULT_CONFIG_PATH))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::extract(Figment::new().merge(Toml::file(path.as_ref())))
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::extract(Figment::new().merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let cfg: Config = figment.extract().context("failed to read configuration")?;
        cfg.check().context("invalid configuration")?;
        Ok(cfg)
    }

    /// Range checks plus the cross-field rules of each section.
    pub fn check(&self) -> ControlResult<()> {
        self.validate()?;
        self.optimizer.check()?;
        for device in &self.devices {
            device.validate()?;
            if !self.groups.iter().any(|g| g.name == device.group) {
                return Err(ControlError::InvalidConfig(format!(
                    "device {} references unknown group {}",
                    device.id, device.group
                )));
            }
        }
        Ok(())
    }

    /// Build the group registry with its devices and configured strategies.
    pub fn group_manager(&self) -> ControlResult<GroupManager> {
        let mut manager = GroupManager::new();
        for group in &self.groups {
            manager.add_group(DeviceGroup::new(group.name.clone()))?;
        }
        for device in &self.devices {
            manager.add_device(&device.group, device.build().into_shared())?;
        }
        for group in &self.groups {
            if let Some(command) = &group.strategy {
                manager.assign_operator_command(&group.name, command)?;
            }
        }
        if let Some(command) = &self.site_command {
            manager.set_site_command(Some(ControlCommand::from_operator(command)?));
        }
        Ok(manager)
    }
}
