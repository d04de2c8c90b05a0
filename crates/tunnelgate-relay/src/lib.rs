//! Library surface for the gateway binary, split out so integration tests
//! under `tests/` can drive the registry, correlator, inspector, and
//! session together against a real `Router` — the teacher's relay is a
//! bin-only crate with no equivalent, so this split follows
//! `nomadflow-server`'s `lib.rs`/`build_router` pattern from the wider
//! retrieval pack instead.

pub mod config;
pub mod correlator;
pub mod headers;
pub mod http;
pub mod inspector;
pub mod pending;
pub mod registry;
pub mod session;
pub mod stats;

use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;
use tower_http::cors::CorsLayer;

use config::Config;
use inspector::Inspector;
use registry::Registry;
use stats::Stats;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub inspector: Arc<Inspector>,
    pub stats: Stats,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        Self {
            registry: Arc::new(Registry::new(config.max_tunnels_per_channel)),
            inspector: Arc::new(Inspector::new(config.max_stored_exchanges, config.retention)),
            stats: Stats::new(),
            config,
            started_at: std::time::Instant::now(),
        }
    }
}

/// Build the one `Router` both the public and control listeners serve.
///
/// The `/api/*` surface allows cross-origin reads from the configured
/// dashboard origin (spec §6); `"*"` falls back to `CorsLayer::permissive()`
/// the same way the teacher's relay did before any dashboard origin was
/// configured.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.dashboard_origin);
    Router::new()
        .route("/control", get(http::ws_control_handler))
        .route("/health", get(http::health_handler))
        .route("/api/tunnels", get(http::list_tunnels_handler))
        .route("/api/tunnels/:id", get(http::get_tunnel_handler))
        .route("/api/traffic", get(http::list_traffic_handler))
        .route("/api/traffic/tunnel/:tunnel_id", get(http::list_tunnel_traffic_handler))
        .route("/api/traffic/:id", get(http::get_traffic_entry_handler))
        .route("/api/traffic/:id/curl", get(http::get_traffic_curl_handler))
        .route("/api/stats", get(http::stats_handler))
        .fallback(any(http::entry_handler))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(dashboard_origin: &str) -> CorsLayer {
    if dashboard_origin == "*" {
        return CorsLayer::permissive();
    }
    match axum::http::HeaderValue::from_str(dashboard_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
        Err(_) => {
            tracing::warn!(dashboard_origin, "invalid DASHBOARD_ORIGIN value, falling back to permissive CORS");
            CorsLayer::permissive()
        }
    }
}

/// Spawn the periodic inspector retention sweep.
pub fn spawn_retention_sweep(inspector: Arc<Inspector>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            inspector.sweep(tunnelgate_protocol::message::now_millis());
        }
    });
}
