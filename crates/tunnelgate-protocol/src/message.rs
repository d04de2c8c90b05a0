//! Control-channel wire protocol (spec §4.A).
//!
//! Every message is a JSON object `{"type": "...", "payload": {...}}`.
//! `payload` always carries a millisecond Unix `timestamp` alongside its
//! type-specific fields. Bodies are base64 of raw bytes, or absent entirely.
//!
//! This is a JSON reshaping of the same "tagged enum over a duplex stream"
//! idea the teacher's `shared/src/protocol.rs` encodes as a `#[repr(u8)]`
//! `MessageType` plus one struct per message — here the tag is the `type`
//! string spec §4.A names, and serde's internally-tagged representation
//! produces the `{type, payload}` envelope directly, with no hand-rolled
//! dispatch match needed on either side.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, GatewayError};

/// Every control message, tagged by its wire `type` string with the
/// type-specific fields nested under `payload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum ControlMessage {
    #[serde(rename = "tunnel:register")]
    TunnelRegister(TunnelRegisterPayload),
    #[serde(rename = "tunnel:registered")]
    TunnelRegistered(TunnelRegisteredPayload),
    #[serde(rename = "tunnel:close")]
    TunnelClose(TunnelClosePayload),
    #[serde(rename = "http:request")]
    HttpRequest(HttpRequestPayload),
    #[serde(rename = "http:response")]
    HttpResponse(HttpResponsePayload),
    #[serde(rename = "http:error")]
    HttpError(HttpErrorPayload),
    #[serde(rename = "ping")]
    Ping(PingPayload),
    #[serde(rename = "pong")]
    Pong(PongPayload),
    /// Sent by either side in reply to a frame that failed to decode or
    /// named an unrecognized `type`. Not one of the seven message contracts
    /// itself — a control-channel-level nack, never the intended `type` of a
    /// well-formed send.
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

/// Implemented by every payload so call sites can read `timestamp` without
/// matching on the outer enum first.
pub trait MessagePayload {
    fn timestamp(&self) -> u64;
}

macro_rules! payload {
    (
        $(#[$meta:meta])*
        pub struct $name:ident { $( $(#[$fmeta:meta])* pub $field:ident : $ty:ty ),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
            pub timestamp: u64,
        }

        impl MessagePayload for $name {
            fn timestamp(&self) -> u64 {
                self.timestamp
            }
        }
    };
}

payload! {
    /// client→gateway: request a tunnel, optionally naming a subdomain.
    pub struct TunnelRegisterPayload {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        pub subdomain: Option<String>,
        pub local_port: u16,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        pub auth_token: Option<String>,
    }
}

payload! {
    /// gateway→client: registration succeeded.
    pub struct TunnelRegisteredPayload {
        pub tunnel_id: String,
        pub public_url: String,
        pub subdomain: String,
    }
}

payload! {
    /// either direction: tear down a tunnel.
    pub struct TunnelClosePayload {
        pub tunnel_id: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        pub reason: Option<String>,
    }
}

payload! {
    /// gateway→client: forward one HTTP request for the client to answer.
    pub struct HttpRequestPayload {
        pub request_id: String,
        pub method: String,
        pub path: String,
        pub headers: Vec<(String, String)>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        pub body: Option<String>,
        pub query: Vec<(String, String)>,
    }
}

payload! {
    /// client→gateway: the local server's answer to an `http:request`.
    pub struct HttpResponsePayload {
        pub request_id: String,
        pub status_code: u16,
        pub headers: Vec<(String, String)>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        pub body: Option<String>,
    }
}

payload! {
    /// client→gateway: the local server (or the agent itself) could not
    /// answer the forwarded request.
    pub struct HttpErrorPayload {
        pub request_id: String,
        pub error: String,
        pub code: String,
    }
}

payload! {
    /// either direction: liveness probe.
    pub struct PingPayload {}
}

payload! {
    /// either direction: liveness reply.
    pub struct PongPayload {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        pub ping_timestamp: Option<u64>,
    }
}

payload! {
    /// Sent back for a frame that failed to decode or named an unknown type.
    pub struct ErrorPayload {
        pub error: String,
        pub code: String,
    }
}

impl ControlMessage {
    /// Encode to the wire representation: one JSON object per message. The
    /// caller's transport (WebSocket text frame) supplies the framing.
    pub fn encode(&self) -> String {
        // Infallible: every variant above is plain data, no non-UTF8 keys,
        // non-finite floats, or cycles.
        serde_json::to_string(self).expect("control message must serialize")
    }

    /// Decode a single frame. Malformed JSON or an unrecognized `type`
    /// produces `INVALID_MESSAGE` rather than a panic — the session loop
    /// reports it back to the sender as an `error` payload and keeps the
    /// channel open (spec §4.A, §4.F).
    pub fn decode(raw: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(raw)
            .map_err(|e| GatewayError::invalid_message(format!("malformed control message: {e}")))
    }

    /// Base64-encode a raw body for the wire.
    pub fn encode_body(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    /// Decode a wire body back to raw bytes.
    pub fn decode_body(encoded: &str) -> Result<Vec<u8>, GatewayError> {
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| GatewayError::new(ErrorCode::InvalidMessage, format!("bad base64 body: {e}")))
    }
}

/// Current time as milliseconds since the Unix epoch, for stamping outgoing
/// payloads. Clamps to 0 rather than panicking if the system clock is before
/// the epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
