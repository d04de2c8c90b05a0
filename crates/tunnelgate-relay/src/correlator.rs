//! Request/response correlator: the hot path marrying stateless inbound
//! HTTP with the asynchronous, duplex control channel.
//!
//! Pulled out of the axum handler itself so the resolve → allocate id → send
//! → await → translate sequence lives in one place. Keeps the state machine
//! (`Init → AwaitingReply → {Replied, Failed, TimedOut, Cancelled}`) and the
//! inspector/stats side effects together so `http.rs` stays a thin axum
//! adapter.

use std::time::Duration;

use tokio::time::timeout;
use tracing::warn;
use tunnelgate_protocol::message::{now_millis, ControlMessage, HttpRequestPayload};
use tunnelgate_protocol::{ErrorCode, GatewayError};

use crate::headers::strip_hop_by_hop;
use crate::inspector::{Exchange, Inspector};
use crate::registry::Registry;
use crate::stats::Stats;

pub struct ForwardResult {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

/// Resolve `subdomain` to a tunnel, forward the request over its control
/// channel, and wait up to `request_timeout` for the client's answer.
///
/// Every exit path — success, tunnel missing, send failure, timeout — is
/// captured as an [`Exchange`] and folded into [`Stats`] before returning,
/// so a caller only has to translate the `Result` into an HTTP response.
#[allow(clippy::too_many_arguments)]
pub async fn forward(
    registry: &Registry,
    inspector: &Inspector,
    stats: &Stats,
    request_timeout: Duration,
    public_scheme: &str,
    public_domain: &str,
    subdomain: &str,
    method: String,
    path: String,
    query: Vec<(String, String)>,
    mut headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
) -> Result<ForwardResult, GatewayError> {
    let start = std::time::Instant::now();
    let bytes_in = body.as_ref().map(|b| b.len() as u64).unwrap_or(0) as u64;

    let tunnel = match registry.lookup_by_subdomain(subdomain) {
        Some(t) => t,
        None => {
            let err = GatewayError::tunnel_not_found(format!("no tunnel registered for '{subdomain}'"));
            stats.record_request(err.code.http_status(), start.elapsed().as_micros() as u64, bytes_in, 0).await;
            return Err(err);
        }
    };

    strip_hop_by_hop(&mut headers);

    let request_id = tunnelgate_protocol::ids::generate_unique(
        tunnelgate_protocol::ids::request_id_candidate,
        |candidate| tunnel.pending.contains(candidate),
        GatewayError::new(ErrorCode::GenericError, "could not allocate a request id"),
    )?;

    let url = if query.is_empty() {
        format!("{public_scheme}://{subdomain}.{public_domain}{path}")
    } else {
        let qs: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{public_scheme}://{subdomain}.{public_domain}{path}?{}", qs.join("&"))
    };
    let request_body_b64 = body.as_deref().map(ControlMessage::encode_body);

    let payload = HttpRequestPayload {
        request_id: request_id.clone(),
        method: method.clone(),
        path: path.clone(),
        headers: headers.clone(),
        body: request_body_b64.clone(),
        query: query.clone(),
        timestamp: now_millis(),
    };

    // Captured before the request is even sent (spec §4.E step 5): the
    // exchange is already visible to `/api/traffic` while the correlator is
    // still awaiting the client's reply, and `record_response` below only
    // ever mutates this same entry in place.
    inspector.record_request(Exchange {
        id: request_id.clone(),
        tunnel_id: tunnel.id.clone(),
        subdomain: subdomain.to_string(),
        method: method.clone(),
        url: url.clone(),
        request_headers: headers.clone(),
        request_body: request_body_b64.clone(),
        status_code: None,
        response_headers: vec![],
        response_body: None,
        error: None,
        latency_us: 0,
        captured_at_ms: now_millis(),
    });

    // `_pending_guard` outlives every `await` below it and its `Drop` removes
    // the table entry unconditionally. That's what makes the CANCELLED
    // terminal state (spec §4.E/§5) actually hold: the 30s deadline below
    // only fires while this function is being polled, but if the inbound
    // HTTP connection closes first, axum drops this whole future — timeout
    // included — without ever running the code that would otherwise remove
    // the entry. The guard's `Drop` runs regardless of *how* the future
    // goes away, so the pending entry never outlives the request that
    // created it.
    let (_pending_guard, receiver) = tunnel.pending.insert_guarded(request_id.clone());

    if let Err(e) = registry.send_to_channel(&tunnel.channel_id, ControlMessage::HttpRequest(payload)).await {
        record_failure(inspector, stats, &tunnel, &request_id, start, bytes_in, e.clone()).await;
        return Err(e);
    }

    let completion = match timeout(request_timeout, receiver).await {
        Ok(Ok(completion)) => completion,
        Ok(Err(_)) => {
            let e = GatewayError::connection_closed("tunnel closed while awaiting response");
            record_failure(inspector, stats, &tunnel, &request_id, start, bytes_in, e.clone()).await;
            return Err(e);
        }
        Err(_) => {
            // Scenario 3 (§8) fixes this literal wording in the 504 body.
            let e = GatewayError::request_timeout("Gateway timeout");
            record_failure(inspector, stats, &tunnel, &request_id, start, bytes_in, e.clone()).await;
            return Err(e);
        }
    };

    match completion {
        Ok(response) => {
            let body = match &response.body {
                Some(b) => Some(ControlMessage::decode_body(b)?),
                None => None,
            };
            let mut response_headers = response.headers.clone();
            strip_hop_by_hop(&mut response_headers);
            let bytes_out = body.as_ref().map(|b| b.len() as u64).unwrap_or(0);
            let latency_us = start.elapsed().as_micros() as u64;

            stats.record_request(response.status_code, latency_us, bytes_in, bytes_out).await;
            tunnel.touch(bytes_in, bytes_out).await;
            inspector.record_response(
                &request_id,
                crate::inspector::ExchangeUpdate {
                    status_code: Some(response.status_code),
                    response_headers: response_headers.clone(),
                    response_body: response.body.clone(),
                    error: None,
                    latency_us,
                },
            );

            Ok(ForwardResult {
                status_code: response.status_code,
                headers: response_headers,
                body,
            })
        }
        Err(client_err) => {
            record_failure(inspector, stats, &tunnel, &request_id, start, bytes_in, client_err.clone()).await;
            Err(client_err)
        }
    }
}

async fn record_failure(
    inspector: &Inspector,
    stats: &Stats,
    tunnel: &crate::registry::Tunnel,
    request_id: &str,
    start: std::time::Instant,
    bytes_in: u64,
    err: GatewayError,
) {
    let latency_us = start.elapsed().as_micros() as u64;
    warn!(subdomain = %tunnel.subdomain, code = err.code.as_str(), "request forwarding failed");
    stats.record_request(err.code.http_status(), latency_us, bytes_in, 0).await;
    tunnel.touch(bytes_in, 0).await;
    inspector.record_response(
        request_id,
        crate::inspector::ExchangeUpdate {
            status_code: None,
            response_headers: vec![],
            response_body: None,
            error: Some(err.message.clone()),
            latency_us,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use tokio::sync::mpsc;
    use tunnelgate_protocol::message::HttpResponsePayload;

    fn test_registry() -> (Registry, mpsc::Receiver<ControlMessage>, String) {
        let registry = Registry::new(10);
        let (tx, rx) = mpsc::channel(8);
        registry.open_channel("chan-1".into(), tx);
        let tunnel = registry.register(&"chan-1".to_string(), Some("demo1".into()), 3000).unwrap();
        (registry, rx, tunnel.id)
    }

    #[tokio::test]
    async fn missing_tunnel_reports_tunnel_not_found() {
        let registry = Registry::new(10);
        let inspector = Inspector::new(10, Duration::from_secs(3600));
        let stats = Stats::new();
        let err = forward(
            &registry,
            &inspector,
            &stats,
            Duration::from_millis(50),
            "http",
            "example.com",
            "nobody-here",
            "GET".into(),
            "/".into(),
            vec![],
            vec![],
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::TunnelNotFound);
    }

    #[tokio::test]
    async fn successful_round_trip_returns_the_client_response() {
        let (registry, mut rx, _tunnel_id) = test_registry();
        let inspector = Inspector::new(10, Duration::from_secs(3600));
        let stats = Stats::new();

        let responder = tokio::spawn(async move {
            let msg = rx.recv().await.unwrap();
            let ControlMessage::HttpRequest(req) = msg else { panic!("expected http:request") };
            (req.request_id, req)
        });

        let forward_fut = forward(
            &registry,
            &inspector,
            &stats,
            Duration::from_secs(2),
            "http",
            "example.com",
            "demo1",
            "GET".into(),
            "/ping".into(),
            vec![],
            vec![],
            None,
        );

        let (request_id, _req) = responder.await.unwrap();
        let tunnel = registry.lookup_by_subdomain("demo1").unwrap();
        assert!(tunnel.pending.complete(
            &request_id,
            Ok(HttpResponsePayload {
                request_id: request_id.clone(),
                status_code: 200,
                headers: vec![],
                body: Some(ControlMessage::encode_body(b"pong")),
                timestamp: 0,
            })
        ));

        let result = forward_fut.await.unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(result.body.unwrap(), b"pong");
        assert_eq!(inspector.len(), 1);
    }

    #[tokio::test]
    async fn timeout_without_a_reply_reports_request_timeout() {
        let (registry, _rx, _tunnel_id) = test_registry();
        let inspector = Inspector::new(10, Duration::from_secs(3600));
        let stats = Stats::new();

        let err = forward(
            &registry,
            &inspector,
            &stats,
            Duration::from_millis(30),
            "http",
            "example.com",
            "demo1",
            "GET".into(),
            "/slow".into(),
            vec![],
            vec![],
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestTimeout);
        assert_eq!(err.message, "Gateway timeout");
    }

    #[tokio::test]
    async fn cancelling_the_caller_future_removes_the_pending_entry() {
        // Simulates the inbound HTTP connection closing mid-request: axum
        // drops the handler's future (and with it `forward`'s own timeout)
        // before a reply or a timeout ever resolves it.
        let (registry, mut rx, tunnel_id) = test_registry();
        let inspector = Inspector::new(10, Duration::from_secs(3600));
        let stats = Stats::new();

        let fut = forward(
            &registry,
            &inspector,
            &stats,
            Duration::from_secs(30),
            "http",
            "example.com",
            "demo1",
            "GET".into(),
            "/slow".into(),
            vec![],
            vec![],
            None,
        );
        tokio::pin!(fut);

        // Poll once so the pending entry is actually registered, then drop
        // the future without ever letting it complete.
        let _ = tokio::time::timeout(Duration::from_millis(20), &mut fut).await;
        let _req = rx.recv().await.unwrap();
        drop(fut);

        let tunnel = registry.lookup_by_id(&tunnel_id).unwrap();
        assert!(tunnel.pending.is_empty(), "cancelled request must not leak its pending entry");
    }

    #[tokio::test]
    async fn closed_channel_reports_connection_closed() {
        let (registry, rx, _tunnel_id) = test_registry();
        drop(rx);
        let inspector = Inspector::new(10, Duration::from_secs(3600));
        let stats = Stats::new();

        let err = forward(
            &registry,
            &inspector,
            &stats,
            Duration::from_millis(50),
            "http",
            "example.com",
            "demo1",
            "GET".into(),
            "/".into(),
            vec![],
            vec![],
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionClosed);
    }
}
