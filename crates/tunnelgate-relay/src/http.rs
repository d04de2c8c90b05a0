//! Public HTTP entry and control surface (spec §4.H).
//!
//! Generalizes the teacher's `proxy_handler`/`health_handler` (host-header
//! subdomain extraction, a catch-all fallback route) but splits "this host
//! is the apex — serve the control surface" from "this host is a tunnel
//! subdomain — forward it" by an exact suffix match against the configured
//! public domain, resolving spec's apex mis-routing open question (see
//! `SPEC_FULL.md`): `host == domain` is the apex banner/API, `host == label
//! + "." + domain` is a tunnel lookup, and anything else is
//! `INVALID_REQUEST` rather than guessed at.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use hyper::header::HOST;
use serde::Deserialize;
use tunnelgate_protocol::GatewayError;

use crate::AppState;

/// Split a `Host` header against the configured public domain. `None` means
/// the host doesn't belong to this gateway at all (wrong domain entirely).
pub enum HostKind {
    Apex,
    Tunnel(String),
}

pub fn classify_host(host: &str, public_domain: &str) -> Option<HostKind> {
    let host = host.split(':').next().unwrap_or(host);
    if host.eq_ignore_ascii_case(public_domain) {
        return Some(HostKind::Apex);
    }
    let suffix = format!(".{public_domain}");
    if let Some(label) = host.strip_suffix(&suffix) {
        if !label.is_empty() && !label.contains('.') {
            let label = label.to_lowercase();
            // spec §6: `www` and `api` are never tunnel lookups, even as a
            // label in front of the public domain — they fall through to
            // the apex banner/API surface instead.
            if label == "www" || label == "api" {
                return Some(HostKind::Apex);
            }
            return Some(HostKind::Tunnel(label));
        }
    }
    None
}

fn error_response(err: GatewayError) -> axum::response::Response {
    let status = StatusCode::from_u16(err.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_json())).into_response()
}

/// The catch-all handler for every request that isn't `/control` or under
/// `/api`/`/health`: apex hosts get the banner, tunnel hosts get forwarded.
pub async fn entry_handler(State(state): State<AppState>, req: axum::extract::Request) -> axum::response::Response {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();

    match classify_host(&host, &state.config.public_domain) {
        Some(HostKind::Apex) => apex_banner(&state).into_response(),
        Some(HostKind::Tunnel(subdomain)) => proxy_to_tunnel(state, subdomain, req).await,
        None => error_response(GatewayError::invalid_subdomain(format!(
            "host '{host}' is not served by this gateway"
        ))),
    }
}

fn apex_banner(state: &AppState) -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "tunnelgate",
        "active_tunnels": state.registry.tunnel_count(),
    }))
}

async fn proxy_to_tunnel(state: AppState, subdomain: String, req: axum::extract::Request) -> axum::response::Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query: Vec<(String, String)> = req.uri().query().map(url_decode_query).unwrap_or_default();
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
        .collect();

    let body_bytes = match axum::body::to_bytes(req.into_body(), state.config.max_body_bytes).await {
        Ok(b) if !b.is_empty() => Some(b.to_vec()),
        Ok(_) => None,
        Err(_) => {
            return error_response(GatewayError::new(
                tunnelgate_protocol::ErrorCode::BodyTooLarge,
                "request body exceeds the configured limit",
            ))
        }
    };

    let result = crate::correlator::forward(
        &state.registry,
        &state.inspector,
        &state.stats,
        state.config.request_timeout,
        &state.config.public_scheme,
        &state.config.public_domain,
        &subdomain,
        method,
        path,
        query,
        headers,
        body_bytes,
    )
    .await;

    match result {
        Ok(r) => {
            let status = StatusCode::from_u16(r.status_code).unwrap_or(StatusCode::OK);
            let mut builder = hyper::Response::builder().status(status);
            if let Some(map) = builder.headers_mut() {
                for (k, v) in &r.headers {
                    if let (Ok(name), Ok(value)) = (
                        hyper::header::HeaderName::from_bytes(k.as_bytes()),
                        hyper::header::HeaderValue::from_str(v),
                    ) {
                        map.insert(name, value);
                    }
                }
            }
            match builder.body(axum::body::Body::from(r.body.unwrap_or_default())) {
                Ok(resp) => resp.into_response(),
                Err(_) => error_response(GatewayError::new(
                    tunnelgate_protocol::ErrorCode::GenericError,
                    "failed to build response",
                )),
            }
        }
        Err(e) => error_response(e),
    }
}

/// Minimal `application/x-www-form-urlencoded`-style query decoder: splits
/// on `&` then `=`, percent-decoding is intentionally not implemented here
/// since the forwarded value only needs to round-trip back through the
/// agent's own HTTP client, not be interpreted by this gateway.
fn url_decode_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "tunnels": state.registry.tunnel_count(),
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

async fn tunnel_stats_json(state: &AppState, t: &crate::registry::Tunnel) -> serde_json::Value {
    serde_json::json!({
        "id": t.id,
        "subdomain": t.subdomain,
        "publicUrl": state.config.public_url(&t.subdomain),
        "localPort": t.local_port,
        "requestCount": t.request_count(),
        "bytesIn": t.bytes_in(),
        "bytesOut": t.bytes_out(),
        "createdAgoSecs": t.created_at.elapsed().as_secs(),
        "lastActivityAgoSecs": t.last_activity().await.elapsed().as_secs(),
    })
}

pub async fn list_tunnels_handler(State(state): State<AppState>) -> impl IntoResponse {
    let all = state.registry.list_all();
    let mut tunnels = Vec::with_capacity(all.len());
    for t in &all {
        tunnels.push(tunnel_stats_json(&state, t).await);
    }
    Json(serde_json::json!({ "tunnels": tunnels, "count": all.len() }))
}

pub async fn get_tunnel_handler(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> axum::response::Response {
    match state.registry.lookup_by_id(&id) {
        Some(t) => Json(tunnel_stats_json(&state, &t).await).into_response(),
        None => error_response(GatewayError::tunnel_not_found(format!("no tunnel with id '{id}'"))),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct TrafficQuery {
    #[serde(rename = "tunnelId")]
    pub tunnel_id: Option<String>,
    pub method: Option<String>,
    #[serde(rename = "statusCode")]
    pub status_code: Option<u16>,
    pub path: Option<String>,
    pub since: Option<u64>,
    pub sanitize: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn not_found(id: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "error": format!("no captured exchange with id '{id}'"),
            "code": "GENERIC_ERROR",
        })),
    )
        .into_response()
}

/// Build an inspector filter from the query string, reporting a malformed
/// `path` regex as `INVALID_REQUEST` rather than silently ignoring it.
fn build_filter(q: &TrafficQuery, tunnel_id_override: Option<String>) -> Result<crate::inspector::TrafficFilter, GatewayError> {
    let path = q
        .path
        .as_ref()
        .map(|p| regex::RegexBuilder::new(p).case_insensitive(true).build())
        .transpose()
        .map_err(|e| GatewayError::new(tunnelgate_protocol::ErrorCode::InvalidRequest, format!("invalid path regex: {e}")))?;

    Ok(crate::inspector::TrafficFilter {
        tunnel_id: tunnel_id_override.or_else(|| q.tunnel_id.clone()),
        method: q.method.as_ref().map(|m| m.to_uppercase()),
        status: q.status_code,
        path,
        since_ms: q.since,
        sanitize: q.sanitize.unwrap_or(false),
        limit: q.limit.unwrap_or(50),
        offset: q.offset.unwrap_or(0),
    })
}

pub async fn list_traffic_handler(State(state): State<AppState>, Query(q): Query<TrafficQuery>) -> axum::response::Response {
    let filter = match build_filter(&q, None) {
        Ok(f) => f,
        Err(e) => return error_response(e),
    };
    let page = state.inspector.list(&filter, tunnelgate_protocol::message::now_millis());
    Json(serde_json::json!({
        "total": page.total,
        "entries": page.entries,
    }))
    .into_response()
}

/// `GET /api/traffic/tunnel/:tunnelId` — the same filtered page as
/// `list_traffic_handler`, scoped to one tunnel regardless of a `tunnelId`
/// query parameter (spec §6).
pub async fn list_tunnel_traffic_handler(
    State(state): State<AppState>,
    axum::extract::Path(tunnel_id): axum::extract::Path<String>,
    Query(q): Query<TrafficQuery>,
) -> axum::response::Response {
    let filter = match build_filter(&q, Some(tunnel_id)) {
        Ok(f) => f,
        Err(e) => return error_response(e),
    };
    let page = state.inspector.list(&filter, tunnelgate_protocol::message::now_millis());
    Json(serde_json::json!({
        "total": page.total,
        "entries": page.entries,
    }))
    .into_response()
}

pub async fn get_traffic_entry_handler(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Query(q): Query<TrafficQuery>,
) -> axum::response::Response {
    match state.inspector.get(&id, q.sanitize.unwrap_or(false)) {
        Some(e) => Json(e).into_response(),
        None => not_found(&id),
    }
}

pub async fn get_traffic_curl_handler(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    Query(q): Query<TrafficQuery>,
) -> axum::response::Response {
    match state.inspector.get(&id, false) {
        Some(e) => Json(serde_json::json!({ "curl": e.to_curl(q.sanitize.unwrap_or(true)) })).into_response(),
        None => not_found(&id),
    }
}

pub async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let summary = state.stats.summary(state.registry.tunnel_count() as u64).await;
    Json(summary)
}

pub async fn ws_control_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let channel_id = tunnelgate_protocol::ids::tunnel_id_candidate();
        crate::session::run(channel_id, socket, state.registry, state.config).await;
    })
}
