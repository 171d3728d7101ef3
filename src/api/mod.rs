pub mod devices;
pub mod error;
pub mod groups;
pub mod health;
pub mod response;
pub mod status;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::Config;
use crate::controller::{ResiliencyController, SharedGroups};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ResiliencyController>,
    pub groups: SharedGroups,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(controller: Arc<ResiliencyController>) -> Self {
        Self {
            groups: controller.groups(),
            controller,
            started_at: Utc::now(),
        }
    }
}

pub fn router(state: AppState, cfg: &Config) -> Router {
    routes(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(axum::extract::DefaultBodyLimit::max(64 * 1024))
            .layer(TimeoutLayer::new(Duration::from_secs(
                cfg.server.request_timeout_secs,
            ))),
    )
}

fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/status", get(status::get_status))
        .route("/allocation", get(status::get_allocation))
        .route("/groups", get(groups::list_groups))
        .route(
            "/groups/:name/strategy",
            put(groups::assign_strategy).delete(groups::unassign_strategy),
        )
        .route(
            "/site/strategy",
            put(groups::set_site_strategy).delete(groups::clear_site_strategy),
        )
        .route("/telemetry", post(devices::post_telemetry))
        .with_state(state)
}

#[cfg(feature = "metrics")]
pub fn with_metrics(app: Router) -> anyhow::Result<Router> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    let handle = PrometheusBuilder::new().install_recorder()?;
    let metrics_router =
        Router::new().route("/metrics", get(move || async move { handle.render() }));
    Ok(app.merge(metrics_router))
}
