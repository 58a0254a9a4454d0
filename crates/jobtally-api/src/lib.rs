//! jobtally-api — HTTP surface of the exporter.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/metrics` | Prometheus exposition, once per scraper per generation |
//! | GET | `/status` | Current generation, shapes, and parse statistics |
//! | GET | `/healthz` | Liveness |
//!
//! `/metrics` needs the peer address to identify scrapers; serve the
//! router with `into_make_service_with_connect_info::<SocketAddr>()`.

pub mod handlers;
pub mod identity;

use std::sync::Arc;

use axum::http::header::InvalidHeaderName;
use axum::routing::get;
use axum::Router;
use jobtally_core::TallyConfig;
use jobtally_metrics::{ExpositionOptions, SnapshotStore};

pub use identity::IdentityPolicy;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<SnapshotStore>,
    pub exposition: Arc<ExpositionOptions>,
    pub identity: Arc<IdentityPolicy>,
}

impl ApiState {
    pub fn new(
        store: Arc<SnapshotStore>,
        exposition: ExpositionOptions,
        identity: IdentityPolicy,
    ) -> Self {
        Self {
            store,
            exposition: Arc::new(exposition),
            identity: Arc::new(identity),
        }
    }

    pub fn from_config(
        store: Arc<SnapshotStore>,
        config: &TallyConfig,
    ) -> Result<Self, InvalidHeaderName> {
        let exposition = ExpositionOptions::from_config(&config.aggregation);
        let identity = IdentityPolicy::from_config(&config.scrape)?;
        Ok(Self::new(store, exposition, identity))
    }
}

/// Build the complete router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/status", get(handlers::status))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}
