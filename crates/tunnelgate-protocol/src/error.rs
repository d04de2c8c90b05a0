//! The closed error taxonomy shared by the control channel and the public
//! HTTP surface (spec §7).
//!
//! A single [`GatewayError`] value carries everything either side needs: the
//! machine-readable `code` (sent verbatim in `error` control payloads and in
//! `{error, code}` HTTP bodies), a human message, and — for the HTTP surface —
//! the status to answer with.

use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// The closed set of wire error codes (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    ConnectionFailed,
    ConnectionClosed,
    ConnectionTimeout,
    TunnelNotFound,
    TunnelLimitExceeded,
    SubdomainTaken,
    InvalidSubdomain,
    RequestTimeout,
    RequestFailed,
    InvalidRequest,
    BodyTooLarge,
    Unauthorized,
    InvalidToken,
    TokenExpired,
    RateLimited,
    LocalServerError,
    LocalServerUnreachable,
    InvalidMessage,
    UnknownMessage,
    GenericError,
}

impl ErrorCode {
    /// The exact string sent on the wire and in JSON error bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::TunnelNotFound => "TUNNEL_NOT_FOUND",
            ErrorCode::TunnelLimitExceeded => "TUNNEL_LIMIT_EXCEEDED",
            ErrorCode::SubdomainTaken => "SUBDOMAIN_TAKEN",
            ErrorCode::InvalidSubdomain => "INVALID_SUBDOMAIN",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::RequestFailed => "REQUEST_FAILED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::BodyTooLarge => "BODY_TOO_LARGE",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::LocalServerError => "LOCAL_SERVER_ERROR",
            ErrorCode::LocalServerUnreachable => "LOCAL_SERVER_UNREACHABLE",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::UnknownMessage => "UNKNOWN_MESSAGE",
            ErrorCode::GenericError => "GENERIC_ERROR",
        }
    }

    /// The public HTTP status this code answers with, for codes that ever
    /// surface on the public HTTP response path.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::TunnelNotFound => 404,
            ErrorCode::ConnectionClosed | ErrorCode::RequestFailed => 502,
            ErrorCode::RequestTimeout | ErrorCode::ConnectionTimeout => 504,
            ErrorCode::InvalidRequest | ErrorCode::InvalidSubdomain => 400,
            ErrorCode::BodyTooLarge => 413,
            ErrorCode::Unauthorized | ErrorCode::InvalidToken | ErrorCode::TokenExpired => 401,
            ErrorCode::RateLimited => 429,
            ErrorCode::SubdomainTaken | ErrorCode::TunnelLimitExceeded => 409,
            ErrorCode::LocalServerUnreachable | ErrorCode::LocalServerError => 502,
            _ => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Serialize into the `{error, code}` shape the public HTTP surface and
    /// control-channel `error` payload both use.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.message,
            "code": self.code.as_str(),
        })
    }
}

macro_rules! ctor {
    ($name:ident, $code:ident) => {
        pub fn $name(message: impl Into<String>) -> Self {
            Self::new(ErrorCode::$code, message)
        }
    };
}

impl GatewayError {
    ctor!(tunnel_not_found, TunnelNotFound);
    ctor!(tunnel_limit_exceeded, TunnelLimitExceeded);
    ctor!(subdomain_taken, SubdomainTaken);
    ctor!(invalid_subdomain, InvalidSubdomain);
    ctor!(request_timeout, RequestTimeout);
    ctor!(request_failed, RequestFailed);
    ctor!(connection_closed, ConnectionClosed);
    ctor!(invalid_message, InvalidMessage);
    ctor!(unknown_message, UnknownMessage);
}
