//! Collaborator seams
//!
//! The controller only sees these traits. Field buses, BMS links and the
//! simulated stand-ins used by the binary and tests plug in behind them.

pub mod simulated;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use simulated::{RecordingPublisher, SimulatedStorage};

use crate::domain::DeviceType;

/// Storage state as reported by the BMS
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SocReading {
    pub soc_kwh: f64,
    pub capacity_kwh: f64,
}

/// Storage parameters pushed to the provider at startup
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StorageSettings {
    pub capacity_kwh: f64,
    pub nominal_power_kw: f64,
    pub min_soc_percent: f64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatteryStateProvider: Send + Sync {
    async fn read_soc(&self) -> Result<SocReading>;
    async fn configure(&self, settings: StorageSettings) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceCommandPublisher: Send + Sync {
    /// Deliver one command payload to a device.
    async fn publish(
        &self,
        device_id: String,
        device_type: DeviceType,
        payload: serde_json::Value,
    ) -> Result<()>;
}
