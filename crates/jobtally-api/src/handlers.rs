//! HTTP handlers.
//!
//! `/metrics` always answers 200 with a well-formed body. A scraper that
//! already read the current generation gets an empty body, not an error.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tracing::{error, info, warn};

use jobtally_core::ParseStats;
use jobtally_metrics::{render, render_text, Admission, StoreStatus};

use crate::ApiState;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn exposition(body: String) -> axum::response::Response {
    (StatusCode::OK, [("content-type", TEXT_FORMAT)], body).into_response()
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>, request: Request) -> impl IntoResponse {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = state.identity.derive(peer, request.headers());

    match state.store.admit(&identity) {
        Ok(Admission::Admitted(snapshot)) => {
            let families = render(&snapshot, &state.exposition);
            info!(
                %identity,
                generation = snapshot.generation(),
                families = families.len(),
                keys = snapshot.len(),
                "serving snapshot"
            );
            exposition(render_text(&families))
        }
        Ok(Admission::Denied { generation }) => {
            warn!(%identity, generation, "scraper already served this generation, returning no data");
            exposition(String::new())
        }
        Err(e) => {
            error!(%identity, error = %e, "scrape gate invariant violated");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ShapeStatus {
    labels: Vec<String>,
    keys: usize,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    generation: u64,
    created_at: u64,
    keys: usize,
    shapes: Vec<ShapeStatus>,
    stats: ParseStats,
    admitted_scrapers: usize,
}

/// GET /status
///
/// Reads the current snapshot without touching the scrape gate.
pub async fn status(State(state): State<ApiState>) -> impl IntoResponse {
    let StoreStatus {
        snapshot,
        admitted_scrapers,
    } = state.store.status();
    let body = StatusBody {
        generation: snapshot.generation(),
        created_at: snapshot.created_at(),
        keys: snapshot.len(),
        shapes: snapshot
            .shapes()
            .iter()
            .map(|(shape, &keys)| ShapeStatus {
                labels: shape.names().to_vec(),
                keys,
            })
            .collect(),
        stats: *snapshot.stats(),
        admitted_scrapers,
    };
    ApiResponse::ok(body)
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
