//! End-to-end integration test: a real `TcpListener` serving the actual
//! `Router`, a real WebSocket control-channel client, and a real HTTP
//! request routed through subdomain classification, the correlator, and
//! the pending-request rendezvous — together, not individually.
//!
//! Grounded in the retrieval pack's `subdomain_assignment_test.rs` style:
//! spin up real async state over a real listener, drive it with a real
//! client, assert on observable output, no mocking framework.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tunnelgate_protocol::message::{ControlMessage, HttpResponsePayload, TunnelRegisterPayload};
use tunnelgate_relay::config::Config;
use tunnelgate_relay::{build_router, AppState};

fn test_config(http_port: u16) -> Config {
    Config {
        bind_host: "127.0.0.1".into(),
        http_port,
        control_port: 0,
        public_domain: "test.local".into(),
        public_scheme: "http".into(),
        dashboard_origin: "*".into(),
        max_body_bytes: 1024 * 1024,
        max_stored_exchanges: 100,
        retention: Duration::from_secs(3600),
        heartbeat_interval: Duration::from_secs(30),
        request_timeout: Duration::from_secs(2),
        max_tunnels_per_channel: 10,
    }
}

/// Binds first so the config's `http_port` (and therefore every tunnel's
/// advertised `publicUrl`) matches the port the listener actually serves on.
async fn spawn_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(test_config(addr.port()));
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn registers_and_forwards_a_request_end_to_end() {
    let addr = spawn_server().await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/control")).await.unwrap();
    let register = ControlMessage::TunnelRegister(TunnelRegisterPayload {
        subdomain: Some("itst1".into()),
        local_port: 4000,
        auth_token: None,
        timestamp: tunnelgate_protocol::message::now_millis(),
    });
    ws.send(WsMessage::Text(register.encode())).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let WsMessage::Text(text) = reply else { panic!("expected text frame") };
    let ControlMessage::TunnelRegistered(reg) = ControlMessage::decode(&text).unwrap() else {
        panic!("expected tunnel:registered")
    };
    assert_eq!(reg.subdomain, "itst1");
    assert_eq!(reg.public_url, format!("http://itst1.test.local:{}", addr.port()));

    let responder = tokio::spawn(async move {
        loop {
            let frame = ws.next().await.unwrap().unwrap();
            let WsMessage::Text(text) = frame else { continue };
            if let Ok(ControlMessage::HttpRequest(req)) = ControlMessage::decode(&text) {
                let resp = ControlMessage::HttpResponse(HttpResponsePayload {
                    request_id: req.request_id,
                    status_code: 200,
                    headers: vec![("x-served-by".into(), "agent".into())],
                    body: Some(ControlMessage::encode_body(b"hello from the tunnel")),
                    timestamp: tunnelgate_protocol::message::now_millis(),
                });
                ws.send(WsMessage::Text(resp.encode())).await.unwrap();
                return ws;
            }
        }
    });

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/some/path"))
        .header("host", "itst1.test.local")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("x-served-by").unwrap(), "agent");
    let body = resp.text().await.unwrap();
    assert_eq!(body, "hello from the tunnel");

    responder.await.unwrap();
}

#[tokio::test]
async fn unregistered_subdomain_yields_tunnel_not_found() {
    let addr = spawn_server().await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/"))
        .header("host", "nobody-here.test.local")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 404);
    let text = resp.text().await.unwrap();
    let body: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["code"], "TUNNEL_NOT_FOUND");
}

#[tokio::test]
async fn apex_host_serves_the_banner_not_a_tunnel_lookup() {
    let addr = spawn_server().await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/"))
        .header("host", "test.local")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    let body: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["service"], "tunnelgate");
}

#[tokio::test]
async fn reserved_subdomain_is_rejected_then_a_free_one_succeeds() {
    let addr = spawn_server().await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/control")).await.unwrap();
    let register_api = ControlMessage::TunnelRegister(TunnelRegisterPayload {
        subdomain: Some("api".into()),
        local_port: 4000,
        auth_token: None,
        timestamp: tunnelgate_protocol::message::now_millis(),
    });
    ws.send(WsMessage::Text(register_api.encode())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    let WsMessage::Text(text) = reply else { panic!("expected text frame") };
    let ControlMessage::Error(err) = ControlMessage::decode(&text).unwrap() else {
        panic!("expected error for reserved subdomain")
    };
    assert_eq!(err.code, "SUBDOMAIN_TAKEN");

    let register_free = ControlMessage::TunnelRegister(TunnelRegisterPayload {
        subdomain: Some("hello42".into()),
        local_port: 4000,
        auth_token: None,
        timestamp: tunnelgate_protocol::message::now_millis(),
    });
    ws.send(WsMessage::Text(register_free.encode())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    let WsMessage::Text(text) = reply else { panic!("expected text frame") };
    let ControlMessage::TunnelRegistered(reg) = ControlMessage::decode(&text).unwrap() else {
        panic!("expected tunnel:registered")
    };
    assert_eq!(reg.subdomain, "hello42");

    // a second channel requesting the now-held subdomain is rejected too.
    let (mut ws2, _) = connect_async(format!("ws://{addr}/control")).await.unwrap();
    let register_dup = ControlMessage::TunnelRegister(TunnelRegisterPayload {
        subdomain: Some("hello42".into()),
        local_port: 4001,
        auth_token: None,
        timestamp: tunnelgate_protocol::message::now_millis(),
    });
    ws2.send(WsMessage::Text(register_dup.encode())).await.unwrap();
    let reply = ws2.next().await.unwrap().unwrap();
    let WsMessage::Text(text) = reply else { panic!("expected text frame") };
    let ControlMessage::Error(err) = ControlMessage::decode(&text).unwrap() else {
        panic!("expected error for duplicate subdomain")
    };
    assert_eq!(err.code, "SUBDOMAIN_TAKEN");
}

#[tokio::test]
async fn channel_death_mid_request_fails_with_request_failed_and_frees_the_tunnel() {
    let addr = spawn_server().await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/control")).await.unwrap();
    let register = ControlMessage::TunnelRegister(TunnelRegisterPayload {
        subdomain: Some("dropme1".into()),
        local_port: 4000,
        auth_token: None,
        timestamp: tunnelgate_protocol::message::now_millis(),
    });
    ws.send(WsMessage::Text(register.encode())).await.unwrap();
    let _ = ws.next().await.unwrap().unwrap();

    let request_task = tokio::spawn(async move {
        let client = reqwest::Client::new();
        client
            .get(format!("http://{addr}/"))
            .header("host", "dropme1.test.local")
            .send()
            .await
            .unwrap()
    });

    // give the request time to land on the control channel, then drop it
    // without ever answering.
    let _ = ws.next().await.unwrap().unwrap();
    drop(ws);

    let resp = request_task.await.unwrap();
    assert_eq!(resp.status(), 502);
    let text = resp.text().await.unwrap();
    let body: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["code"], "REQUEST_FAILED");
    assert!(body["error"].as_str().unwrap().contains("Tunnel closed"));

    let client = reqwest::Client::new();
    let health = client.get(format!("http://{addr}/health")).send().await.unwrap();
    let health_body: serde_json::Value = serde_json::from_str(&health.text().await.unwrap()).unwrap();
    assert_eq!(health_body["tunnels"], 0);
}

#[tokio::test]
async fn api_tunnels_reflects_a_freshly_registered_tunnel() {
    let addr = spawn_server().await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/control")).await.unwrap();
    let register = ControlMessage::TunnelRegister(TunnelRegisterPayload {
        subdomain: Some("itst2".into()),
        local_port: 5000,
        auth_token: None,
        timestamp: tunnelgate_protocol::message::now_millis(),
    });
    ws.send(WsMessage::Text(register.encode())).await.unwrap();
    let _ = ws.next().await.unwrap().unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/api/tunnels"))
        .send()
        .await
        .unwrap();
    let text = resp.text().await.unwrap();
    let body: serde_json::Value = serde_json::from_str(&text).unwrap();
    let tunnels = body["tunnels"].as_array().unwrap();
    assert!(tunnels.iter().any(|t| t["subdomain"] == "itst2"));
}
