//! Control-channel session (spec §4.F): the per-channel receiver loop that
//! dispatches the seven message types, drives the liveness heartbeat, and
//! tears a channel's tunnels down on disconnect, graceful or not.
//!
//! Generalizes the teacher's `handle_socket` (`relay/src/main.rs`), which
//! inlined registration parsing, a 30-second ping timer, and `select!`-based
//! dispatch directly in the websocket handler. Here dispatch covers seven
//! message types instead of one binary frame shape, and a session can own
//! more than one tunnel at a time.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};
use tunnelgate_protocol::message::{now_millis, ControlMessage, ErrorPayload, PongPayload, TunnelRegisteredPayload};
use tunnelgate_protocol::{ErrorCode, GatewayError};

use crate::config::Config;
use crate::registry::Registry;

/// Run one control channel to completion: register tunnels as requested,
/// dispatch `http:response`/`http:error` replies to the matching pending
/// request, answer liveness pings, and close every tunnel the channel owns
/// once the socket ends (cleanly or not).
pub async fn run(channel_id: String, socket: WebSocket, registry: Arc<Registry>, config: Arc<Config>) {
    let (tx, mut outbound_rx) = mpsc::channel::<ControlMessage>(64);
    registry.open_channel(channel_id.clone(), tx);

    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    let mut last_pong = Instant::now();

    // Reason every surviving pending request on this channel's tunnels
    // resolves with once the loop below exits — spec §4.F distinguishes a
    // plain disconnect from a missed-heartbeat eviction.
    let mut close_reason = "Client disconnected";

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_frame(&channel_id, &text, &registry, &config, &mut sender).await {
                            break;
                        }
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("control channel {channel_id} read error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
            Some(msg) = outbound_rx.recv() => {
                if sender.send(Message::Text(msg.encode().into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if last_pong.elapsed() > config.heartbeat_interval * 3 {
                    warn!("control channel {channel_id} missed heartbeats, closing");
                    close_reason = "Client unresponsive";
                    break;
                }
                let ping = ControlMessage::Ping(tunnelgate_protocol::message::PingPayload { timestamp: now_millis() });
                if sender.send(Message::Text(ping.encode().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // The pending-request failure message is the spec-fixed "Tunnel closed"
    // (§4.C `close`) regardless of why the channel went away; `close_reason`
    // only enriches the `closed(tunnel, reason)` observability event below
    // (§4.F distinguishes a plain disconnect from a missed-heartbeat
    // eviction there).
    let closed = registry.close_channel(&channel_id);
    for tunnel in &closed {
        tunnel.pending.fail_all();
        info!("tunnel {} ({}) closed with channel {channel_id}: {close_reason}", tunnel.id, tunnel.subdomain);
    }
}

/// Decode and dispatch one inbound frame. Returns `false` when the session
/// should end (a `tunnel:close` for the channel's only tunnel does not end
/// the session; only the socket closing, a read error, or an unrecoverable
/// decode failure does).
async fn handle_frame(
    channel_id: &str,
    text: &str,
    registry: &Registry,
    config: &Config,
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) -> bool {
    let msg = match ControlMessage::decode(text) {
        Ok(m) => m,
        Err(e) => {
            let nack = ControlMessage::Error(ErrorPayload {
                error: e.message,
                code: e.code.as_str().to_string(),
                timestamp: now_millis(),
            });
            return sender.send(Message::Text(nack.encode().into())).await.is_ok();
        }
    };

    match msg {
        ControlMessage::TunnelRegister(reg) => {
            let result = registry.register(&channel_id.to_string(), reg.subdomain, reg.local_port);
            let reply = match result {
                Ok(tunnel) => ControlMessage::TunnelRegistered(TunnelRegisteredPayload {
                    tunnel_id: tunnel.id,
                    public_url: config.public_url(&tunnel.subdomain),
                    subdomain: tunnel.subdomain,
                    timestamp: now_millis(),
                }),
                Err(e) => ControlMessage::Error(ErrorPayload {
                    error: e.message,
                    code: e.code.as_str().to_string(),
                    timestamp: now_millis(),
                }),
            };
            sender.send(Message::Text(reply.encode().into())).await.is_ok()
        }
        ControlMessage::TunnelClose(close) => {
            if let Some(tunnel) = registry.close(&close.tunnel_id) {
                tunnel.pending.fail_all();
                info!("tunnel {} closed by client request on channel {channel_id}", tunnel.id);
            }
            true
        }
        ControlMessage::HttpResponse(resp) => {
            if let Some(tunnel) = registry
                .list_by_channel(&channel_id.to_string())
                .into_iter()
                .find(|t| t.pending.contains(&resp.request_id))
            {
                tunnel.pending.complete(&resp.request_id, Ok(resp));
            }
            true
        }
        ControlMessage::HttpError(err) => {
            if let Some(tunnel) = registry
                .list_by_channel(&channel_id.to_string())
                .into_iter()
                .find(|t| t.pending.contains(&err.request_id))
            {
                let code = parse_error_code(&err.code);
                tunnel.pending.complete(&err.request_id, Err(GatewayError::new(code, err.error)));
            }
            true
        }
        ControlMessage::Ping(ping) => {
            let pong = ControlMessage::Pong(PongPayload {
                ping_timestamp: Some(ping.timestamp),
                timestamp: now_millis(),
            });
            sender.send(Message::Text(pong.encode().into())).await.is_ok()
        }
        ControlMessage::Pong(_) => true,
        ControlMessage::TunnelRegistered(_) | ControlMessage::Error(_) => {
            // These are gateway→client or nack messages; a client sending one
            // back is a protocol violation we simply ignore rather than
            // tearing down the whole session over.
            true
        }
    }
}

fn parse_error_code(wire: &str) -> ErrorCode {
    match wire {
        "CONNECTION_FAILED" => ErrorCode::ConnectionFailed,
        "CONNECTION_CLOSED" => ErrorCode::ConnectionClosed,
        "CONNECTION_TIMEOUT" => ErrorCode::ConnectionTimeout,
        "TUNNEL_NOT_FOUND" => ErrorCode::TunnelNotFound,
        "TUNNEL_LIMIT_EXCEEDED" => ErrorCode::TunnelLimitExceeded,
        "SUBDOMAIN_TAKEN" => ErrorCode::SubdomainTaken,
        "INVALID_SUBDOMAIN" => ErrorCode::InvalidSubdomain,
        "REQUEST_TIMEOUT" => ErrorCode::RequestTimeout,
        "REQUEST_FAILED" => ErrorCode::RequestFailed,
        "INVALID_REQUEST" => ErrorCode::InvalidRequest,
        "BODY_TOO_LARGE" => ErrorCode::BodyTooLarge,
        "UNAUTHORIZED" => ErrorCode::Unauthorized,
        "INVALID_TOKEN" => ErrorCode::InvalidToken,
        "TOKEN_EXPIRED" => ErrorCode::TokenExpired,
        "RATE_LIMITED" => ErrorCode::RateLimited,
        "LOCAL_SERVER_ERROR" => ErrorCode::LocalServerError,
        "LOCAL_SERVER_UNREACHABLE" => ErrorCode::LocalServerUnreachable,
        "INVALID_MESSAGE" => ErrorCode::InvalidMessage,
        "UNKNOWN_MESSAGE" => ErrorCode::UnknownMessage,
        _ => ErrorCode::GenericError,
    }
}
