//! Reference agent: connects to a gateway's control channel, registers a
//! tunnel, and forwards each `http:request` to a local HTTP server,
//! answering with `http:response`/`http:error`.
//!
//! The core multiplexer this repository implements treats the client-side
//! agent as an external collaborator described only by the control-channel
//! contract it must honor — this binary exists to exercise that contract
//! end to end, not as a polished product. It keeps the teacher's CLI shape
//! (`clap` subcommand, `--relay` URL, `-s/--subdomain`) from
//! `client/src/main.rs` but drops the dashboard, multi-tunnel profile
//! loader, and TCP-tunnel mode the teacher's client carried — none of which
//! this gateway's protocol exists to support.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};
use tunnelgate_protocol::message::{
    now_millis, ControlMessage, HttpErrorPayload, HttpResponsePayload, TunnelRegisterPayload,
};

#[derive(Parser)]
#[command(name = "tunnelgate-agent")]
#[command(about = "Expose a local HTTP server through a tunnelgate relay", long_about = None)]
struct Cli {
    /// Local port to expose.
    port: u16,

    /// Control-channel WebSocket URL of the relay.
    #[arg(short, long, default_value = "ws://localhost:3001/control")]
    relay: String,

    /// Requested subdomain (the relay assigns one if omitted).
    #[arg(short, long)]
    subdomain: Option<String>,

    /// Opaque token forwarded verbatim with the registration request.
    #[arg(short, long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("tunnelgate_agent=info").init();
    let cli = Cli::parse();

    let (ws_stream, _) = connect_async(&cli.relay).await.context("connecting to relay control channel")?;
    let (mut sender, mut receiver) = ws_stream.split();

    let register = ControlMessage::TunnelRegister(TunnelRegisterPayload {
        subdomain: cli.subdomain.clone(),
        local_port: cli.port,
        auth_token: cli.token.clone(),
        timestamp: now_millis(),
    });
    sender.send(Message::Text(register.encode())).await.context("sending tunnel:register")?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(25))
        .build()
        .context("building local HTTP client")?;

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                error!("control channel error: {e}");
                break;
            }
        };

        let Message::Text(text) = frame else {
            if matches!(frame, Message::Close(_)) {
                break;
            }
            continue;
        };

        let msg = match ControlMessage::decode(&text) {
            Ok(m) => m,
            Err(e) => {
                warn!("received malformed control message: {}", e.message);
                continue;
            }
        };

        match msg {
            ControlMessage::TunnelRegistered(reg) => {
                info!("tunnel active: {} (id {})", reg.public_url, reg.tunnel_id);
            }
            ControlMessage::Error(err) => {
                error!("registration rejected: {} ({})", err.error, err.code);
                break;
            }
            ControlMessage::HttpRequest(req) => {
                let reply = forward_to_local(&http, cli.port, req).await;
                if sender.send(Message::Text(reply.encode())).await.is_err() {
                    break;
                }
            }
            ControlMessage::Ping(ping) => {
                let pong = ControlMessage::Pong(tunnelgate_protocol::message::PongPayload {
                    ping_timestamp: Some(ping.timestamp),
                    timestamp: now_millis(),
                });
                if sender.send(Message::Text(pong.encode())).await.is_err() {
                    break;
                }
            }
            _ => {}
        }
    }

    info!("control channel closed, exiting");
    Ok(())
}

/// Replay one forwarded request against the local server and translate its
/// answer (or failure to answer) into the matching control message.
async fn forward_to_local(
    http: &reqwest::Client,
    local_port: u16,
    req: tunnelgate_protocol::message::HttpRequestPayload,
) -> ControlMessage {
    let mut url = format!("http://127.0.0.1:{local_port}{}", req.path);
    if !req.query.is_empty() {
        let qs: Vec<String> = req.query.iter().map(|(k, v)| format!("{k}={v}")).collect();
        url.push('?');
        url.push_str(&qs.join("&"));
    }

    let method = match req.method.parse::<reqwest::Method>() {
        Ok(m) => m,
        Err(_) => {
            return ControlMessage::HttpError(HttpErrorPayload {
                request_id: req.request_id,
                error: format!("invalid method '{}'", req.method),
                code: "INVALID_REQUEST".to_string(),
                timestamp: now_millis(),
            })
        }
    };

    let mut builder = http.request(method, &url);
    for (k, v) in &req.headers {
        builder = builder.header(k, v);
    }
    if let Some(body) = &req.body {
        match ControlMessage::decode_body(body) {
            Ok(bytes) => builder = builder.body(bytes),
            Err(e) => {
                return ControlMessage::HttpError(HttpErrorPayload {
                    request_id: req.request_id,
                    error: e.message,
                    code: e.code.as_str().to_string(),
                    timestamp: now_millis(),
                })
            }
        }
    }

    match builder.send().await {
        Ok(resp) => {
            let status_code = resp.status().as_u16();
            let headers: Vec<(String, String)> = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
                .collect();
            let body = resp.bytes().await.unwrap_or_default();
            let body = if body.is_empty() { None } else { Some(ControlMessage::encode_body(&body)) };

            ControlMessage::HttpResponse(HttpResponsePayload {
                request_id: req.request_id,
                status_code,
                headers,
                body,
                timestamp: now_millis(),
            })
        }
        Err(e) => ControlMessage::HttpError(HttpErrorPayload {
            request_id: req.request_id,
            error: format!("local server unreachable: {e}"),
            code: "LOCAL_SERVER_UNREACHABLE".to_string(),
            timestamp: now_millis(),
        }),
    }
}
