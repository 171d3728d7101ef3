use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use resiliency_controller::{
    api,
    config::Config,
    controller::{ControllerSettings, ResiliencyController, SharedGroups},
    domain::BatteryModel,
    hardware::{RecordingPublisher, SimulatedStorage, StorageSettings},
    optimizer::AllocationOptimizer,
    telemetry,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let cfg = Config::load()?;

    let storage = Arc::new(SimulatedStorage::new(
        BatteryModel::new(cfg.battery.clone()).context("invalid battery parameters")?,
    ));
    let publisher = Arc::new(RecordingPublisher::new());
    let groups: SharedGroups = Arc::new(Mutex::new(cfg.group_manager()?));
    let controller = Arc::new(ResiliencyController::new(
        storage.clone(),
        publisher.clone(),
        AllocationOptimizer::new(cfg.optimizer.clone())?,
        groups.clone(),
        ControllerSettings::from(&cfg.controller),
    ));

    controller
        .configure_storage(StorageSettings {
            capacity_kwh: cfg.battery.capacity_kwh,
            nominal_power_kw: cfg.battery.max_discharge_kw,
            min_soc_percent: cfg.battery.min_soc_percent,
        })
        .await
        .context("storage configuration failed")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_controller = controller.clone();
    let mut loop_shutdown = shutdown_rx.clone();
    let control_loop = tokio::spawn(async move {
        loop_controller
            .run(async move {
                let _ = loop_shutdown.changed().await;
            })
            .await;
    });

    let simulation = spawn_simulation(
        &cfg,
        storage,
        publisher,
        groups,
        controller.settings().tick,
        shutdown_rx,
    );

    #[allow(unused_mut)]
    let mut app = api::router(api::AppState::new(controller.clone()), &cfg);

    #[cfg(feature = "metrics")]
    {
        app = api::with_metrics(app)?;
    }

    let addr = cfg.server.socket_addr()?;
    if cfg.server.host == "0.0.0.0" {
        warn!("operator API bound to all interfaces");
    }
    info!(%addr, "starting resiliency controller");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = control_loop.await {
        warn!(error = %e, "control loop task failed");
    }
    if let Some(simulation) = simulation {
        let _ = simulation.await;
    }

    warn!("shutdown complete");
    Ok(())
}

/// Closes the loop around the simulated collaborators: published commands come
/// back as telemetry and the measured load drains the simulated storage.
fn spawn_simulation(
    cfg: &Config,
    storage: Arc<SimulatedStorage>,
    publisher: Arc<RecordingPublisher>,
    groups: SharedGroups,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    let sim = cfg.simulation.clone();
    if !sim.draw_load && !sim.echo_telemetry {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        let tick_hours = tick.as_secs_f64() / 3600.0;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }

            if sim.echo_telemetry {
                for published in publisher.take() {
                    let Some(device) = groups.lock().device(&published.device_id).cloned() else {
                        continue;
                    };
                    let echo = published.echo(&device.read());
                    if let Some(update) = echo {
                        if let Err(e) = groups.lock().apply_telemetry(&update) {
                            warn!(error = %e, "simulated telemetry rejected");
                        }
                    }
                }
            }

            if sim.draw_load {
                let load_w = groups.lock().merged().total_consumption_w();
                let delivered_w = storage.draw(load_w, tick_hours);
                let snapshot = storage.snapshot();
                debug!(
                    load_w,
                    delivered_w,
                    soc_percent = snapshot.soc_percent,
                    "simulated storage drawn"
                );
            }
        }
    }))
}
