use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::{BatteryStateProvider, DeviceCommandPublisher, SocReading, StorageSettings};
use crate::domain::{
    BatteryModel, BatterySnapshot, Device, DeviceCommand, DeviceStatus, DeviceType,
    TelemetryUpdate,
};

/// Supply voltage assumed when echoing commands back as telemetry
const ECHO_VOLTAGE_V: f64 = 230.0;
const ECHO_FREQUENCY_HZ: f64 = 50.0;

/// Storage backed by the in-process battery model
pub struct SimulatedStorage {
    model: Mutex<BatteryModel>,
    /// Artificial BMS read delay
    latency: Option<Duration>,
}

impl SimulatedStorage {
    pub fn new(model: BatteryModel) -> Self {
        Self {
            model: Mutex::new(model),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Discharge the model for the loads drawn over one interval; returns delivered power (W).
    pub fn draw(&self, power_w: f64, duration_h: f64) -> f64 {
        self.model.lock().discharge(power_w, duration_h)
    }

    /// Charge the model, e.g. from PV surplus; returns power accepted (W).
    pub fn recharge(&self, power_w: f64, duration_h: f64) -> f64 {
        self.model.lock().charge(power_w, duration_h)
    }

    pub fn snapshot(&self) -> BatterySnapshot {
        self.model.lock().snapshot()
    }
}

#[async_trait]
impl BatteryStateProvider for SimulatedStorage {
    async fn read_soc(&self) -> Result<SocReading> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let model = self.model.lock();
        Ok(SocReading {
            soc_kwh: model.soc_kwh(),
            capacity_kwh: model.capacity_kwh_actual(),
        })
    }

    /// Rebuild the model around new storage parameters, keeping the stored energy.
    async fn configure(&self, settings: StorageSettings) -> Result<()> {
        let mut model = self.model.lock();
        let mut params = model.params().clone();
        params.capacity_kwh = settings.capacity_kwh;
        params.max_discharge_kw = settings.nominal_power_kw;
        params.min_soc_percent = settings.min_soc_percent;
        params.state_of_health = model.state_of_health();

        let capacity_wh = settings.capacity_kwh * 1000.0 * params.state_of_health;
        params.initial_soc = if capacity_wh > 0.0 {
            (model.soc_wh() / capacity_wh).clamp(settings.min_soc_percent / 100.0, 1.0)
        } else {
            0.0
        };

        *model = BatteryModel::new(params).context("invalid storage settings")?;
        info!(
            capacity_kwh = settings.capacity_kwh,
            nominal_power_kw = settings.nominal_power_kw,
            min_soc_percent = settings.min_soc_percent,
            "simulated storage configured"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PublishedCommand {
    pub device_id: String,
    pub device_type: DeviceType,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl PublishedCommand {
    pub fn command(&self) -> Option<DeviceCommand> {
        serde_json::from_value(self.payload.get("command")?.clone()).ok()
    }

    /// Telemetry a compliant device would report after applying this command.
    pub fn echo(&self, device: &Device) -> Option<TelemetryUpdate> {
        let target_w = self.command()?.target_power_w(device.rated_power_w);
        Some(TelemetryUpdate {
            device_id: device.id.clone(),
            current_a: target_w / ECHO_VOLTAGE_V,
            frequency_hz: ECHO_FREQUENCY_HZ,
            priority: device.priority,
            voltage_v: ECHO_VOLTAGE_V,
            command_echo: Some(target_w),
            energy_consumption_wh: device.readings.energy_consumption_wh,
            temperature_c: device.readings.temperature_c,
            status: if target_w > 0.0 {
                DeviceStatus::On
            } else {
                DeviceStatus::Off
            },
            observed_at: Utc::now(),
        })
    }
}

/// Publisher that logs and keeps every payload instead of sending it
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<PublishedCommand>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedCommand> {
        self.sent.lock().clone()
    }

    /// Drain everything published since the last call.
    pub fn take(&self) -> Vec<PublishedCommand> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl DeviceCommandPublisher for RecordingPublisher {
    async fn publish(
        &self,
        device_id: String,
        device_type: DeviceType,
        payload: serde_json::Value,
    ) -> Result<()> {
        debug!(%device_id, %device_type, %payload, "publishing device command");
        self.sent.lock().push(PublishedCommand {
            device_id,
            device_type,
            payload,
            published_at: Utc::now(),
        });
        Ok(())
    }
}
