pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::ControllerConfig;
use crate::domain::{IssuedCommand, LoadTier};
use crate::error::{ControlError, ControlResult};
use crate::groups::GroupManager;
use crate::hardware::{BatteryStateProvider, DeviceCommandPublisher, SocReading, StorageSettings};
use crate::optimizer::{
    fallback_allocation, AllocationOptimizer, FallbackPolicy, OptimizationResult, OptimizerParams,
    SolveStatus, TierAllocation,
};
use strategies::DispatchContext;

pub type SharedGroups = Arc<Mutex<GroupManager>>;

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub tick: Duration,
    pub state_read_timeout: Duration,
    pub publish_timeout: Duration,
    pub fallback: FallbackPolicy,
}

impl From<&ControllerConfig> for ControllerSettings {
    fn from(cfg: &ControllerConfig) -> Self {
        Self {
            tick: Duration::from_secs(cfg.tick_seconds.max(1)),
            state_read_timeout: Duration::from_millis(cfg.state_read_timeout_ms),
            publish_timeout: Duration::from_millis(cfg.publish_timeout_ms),
            fallback: cfg.fallback,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

/// Control loop counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickStats {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub dispatched_count: u64,
    pub skipped_count: u64,
    pub state_timeouts: u64,
    pub fallback_count: u64,
    pub publish_failures: u64,
}

/// What one dispatched tick did
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub reading: SocReading,
    pub status: SolveStatus,
    pub allocation: TierAllocation,
    /// Set when the allocation came from the fallback policy
    pub fallback: Option<FallbackPolicy>,
    pub commands: Vec<IssuedCommand>,
    pub published: usize,
    pub publish_failures: usize,
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    Dispatched(TickReport),
    /// Aborted before or during dispatch; nothing was published
    Skipped(ControlError),
}

/// Periodic resiliency controller: read SoC, solve, dispatch, publish.
pub struct ResiliencyController {
    provider: Arc<dyn BatteryStateProvider>,
    publisher: Arc<dyn DeviceCommandPublisher>,
    optimizer: RwLock<AllocationOptimizer>,
    groups: SharedGroups,
    settings: ControllerSettings,
    last_allocation: RwLock<Option<TierAllocation>>,
    last_result: RwLock<Option<OptimizationResult>>,
    last_reading: RwLock<Option<SocReading>>,
    stats: RwLock<TickStats>,
}

impl ResiliencyController {
    pub fn new(
        provider: Arc<dyn BatteryStateProvider>,
        publisher: Arc<dyn DeviceCommandPublisher>,
        optimizer: AllocationOptimizer,
        groups: SharedGroups,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            provider,
            publisher,
            optimizer: RwLock::new(optimizer),
            groups,
            settings,
            last_allocation: RwLock::new(None),
            last_result: RwLock::new(None),
            last_reading: RwLock::new(None),
            stats: RwLock::new(TickStats::default()),
        }
    }

    pub fn groups(&self) -> SharedGroups {
        self.groups.clone()
    }

    pub fn settings(&self) -> ControllerSettings {
        self.settings
    }

    pub fn stats(&self) -> TickStats {
        self.stats.read().clone()
    }

    pub fn last_allocation(&self) -> Option<TierAllocation> {
        self.last_allocation.read().clone()
    }

    pub fn last_result(&self) -> Option<OptimizationResult> {
        self.last_result.read().clone()
    }

    pub fn last_reading(&self) -> Option<SocReading> {
        *self.last_reading.read()
    }

    pub fn optimizer_params(&self) -> OptimizerParams {
        self.optimizer.read().params().clone()
    }

    /// Swap optimizer parameters; takes effect on the next tick.
    pub fn update_optimizer(&self, params: OptimizerParams) -> ControlResult<()> {
        let optimizer = AllocationOptimizer::new(params)?;
        *self.optimizer.write() = optimizer;
        info!("optimizer parameters updated");
        Ok(())
    }

    /// Push storage parameters to the provider, bounded by the state read timeout.
    pub async fn configure_storage(&self, settings: StorageSettings) -> Result<()> {
        match timeout(self.settings.state_read_timeout, self.provider.configure(settings)).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "storage configure timed out after {:?}",
                self.settings.state_read_timeout
            ),
        }
    }

    /// Run ticks until `shutdown` resolves. Missed ticks are skipped, never queued.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(tick = ?self.settings.tick, "control loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    if timeout(self.settings.tick, self.tick()).await.is_err() {
                        warn!(tick = ?self.settings.tick, "tick overran its interval, abandoned");
                        let mut stats = self.stats.write();
                        stats.skipped_count += 1;
                        stats.last_error = Some("tick overran its interval".to_string());
                    }
                }
            }
        }
        info!("control loop stopped");
    }

    /// One control step. Never fails; problems are reported in the outcome.
    pub async fn tick(&self) -> TickOutcome {
        let issued_at = Utc::now();
        {
            let mut stats = self.stats.write();
            stats.last_run = Some(issued_at);
            stats.run_count += 1;
        }
        #[cfg(feature = "metrics")]
        metrics::increment_counter!("resiliency_ticks_total");

        let reading = match timeout(self.settings.state_read_timeout, self.provider.read_soc()).await {
            Ok(Ok(reading)) => reading,
            Ok(Err(e)) => return self.skip(ControlError::StateRead(format!("{e:#}"))),
            Err(_) => {
                return self.skip(ControlError::StateReadTimeout(self.settings.state_read_timeout))
            }
        };
        *self.last_reading.write() = Some(reading);

        let result = self
            .optimizer
            .read()
            .solve(reading.soc_kwh, reading.capacity_kwh);
        let (allocation, fallback) = match result.allocation() {
            Ok(allocation) => (allocation.clone(), None),
            Err(e) => {
                let params = self.optimizer_params();
                let previous = self.last_allocation();
                let (allocation, used) =
                    fallback_allocation(self.settings.fallback, previous.as_ref(), &params);
                warn!(
                    error = %e,
                    soc_kwh = reading.soc_kwh,
                    capacity_kwh = reading.capacity_kwh,
                    fallback = ?used,
                    "no optimal allocation, applying fallback"
                );
                self.stats.write().fallback_count += 1;
                #[cfg(feature = "metrics")]
                metrics::increment_counter!("resiliency_infeasible_total");
                (allocation, Some(used))
            }
        };
        let status = result.status;
        *self.last_result.write() = Some(result);
        *self.last_allocation.write() = Some(allocation.clone());

        let ctx = DispatchContext {
            allocation: Some(allocation.clone()),
            issued_at,
        };
        // lock scope ends before any publish is awaited
        let dispatched = self.groups.lock().dispatch(&ctx);
        let commands = match dispatched {
            Ok(commands) => commands,
            Err(e) => return self.skip(e),
        };

        let (published, publish_failures) = self.publish(&commands).await;

        info!(
            soc_kwh = reading.soc_kwh,
            capacity_kwh = reading.capacity_kwh,
            critical_kw = allocation.get(LoadTier::Critical),
            medium_kw = allocation.get(LoadTier::Medium),
            low_kw = allocation.get(LoadTier::Low),
            commands = commands.len(),
            publish_failures,
            "control tick"
        );
        {
            let mut stats = self.stats.write();
            stats.last_success = Some(Utc::now());
            stats.last_error = None;
            stats.dispatched_count += 1;
            stats.publish_failures += publish_failures as u64;
        }

        TickOutcome::Dispatched(TickReport {
            reading,
            status,
            allocation,
            fallback,
            commands,
            published,
            publish_failures,
        })
    }

    async fn publish(&self, commands: &[IssuedCommand]) -> (usize, usize) {
        let mut published = 0;
        let mut failures = 0;
        for issued in commands {
            let send = self.publisher.publish(
                issued.device_id.clone(),
                issued.device_type,
                issued.payload(),
            );
            match timeout(self.settings.publish_timeout, send).await {
                Ok(Ok(())) => published += 1,
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(device_id = %issued.device_id, error = %e, "command publish failed");
                }
                Err(_) => {
                    failures += 1;
                    warn!(
                        device_id = %issued.device_id,
                        timeout = ?self.settings.publish_timeout,
                        "command publish timed out"
                    );
                }
            }
        }
        #[cfg(feature = "metrics")]
        {
            if failures > 0 {
                metrics::counter!("resiliency_publish_failures_total", failures as u64);
            }
        }
        (published, failures)
    }

    fn skip(&self, reason: ControlError) -> TickOutcome {
        match &reason {
            ControlError::NoStrategyAssigned => warn!("no strategy assigned, tick skipped"),
            ControlError::StateReadTimeout(_) => {
                warn!(error = %reason, "battery state read timed out, tick skipped")
            }
            _ => error!(error = %reason, "tick skipped"),
        }
        self.record_skip(&reason);
        TickOutcome::Skipped(reason)
    }

    fn record_skip(&self, reason: &ControlError) {
        let mut stats = self.stats.write();
        stats.skipped_count += 1;
        stats.last_error = Some(reason.to_string());
        if matches!(reason, ControlError::StateReadTimeout(_)) {
            stats.state_timeouts += 1;
            #[cfg(feature = "metrics")]
            metrics::increment_counter!("resiliency_state_timeouts_total");
        }
    }
}
