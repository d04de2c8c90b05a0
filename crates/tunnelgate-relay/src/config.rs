//! Environment-variable configuration (spec §6).
//!
//! Loaded once at startup, same style the teacher used for `ZTUNNEL_DOMAIN`
//! and `PORT` (`std::env::var(..).unwrap_or_else(..).parse().unwrap_or(..)`)
//! — no config file, no builder, no validation crate. The teacher's relay
//! never read a config file; only its client did, and client configuration
//! is out of scope here.

#[derive(Debug, Clone)]
pub struct Config {
    /// Interface to bind both listeners on.
    pub bind_host: String,
    /// Port serving public tunnel traffic, the apex banner, and the control
    /// surface (`/health`, `/api/*`).
    pub http_port: u16,
    /// Port serving the control-channel WebSocket upgrade agents connect to.
    pub control_port: u16,
    /// Domain tunnels are allocated under, e.g. `tunnelgate.dev`.
    pub public_domain: String,
    /// Scheme used when building a tunnel's `publicUrl` (resolves spec's
    /// open question about the source's hardcoded `http://`).
    pub public_scheme: String,
    /// `Access-Control-Allow-Origin` value the dashboard/API responses use.
    pub dashboard_origin: String,
    /// Maximum request body size accepted from the public HTTP surface.
    pub max_body_bytes: usize,
    /// Maximum number of captured exchanges the inspector retains.
    pub max_stored_exchanges: usize,
    /// How long a captured exchange is retained before the sweep evicts it.
    pub retention: std::time::Duration,
    /// Interval between control-channel liveness pings.
    pub heartbeat_interval: std::time::Duration,
    /// How long a forwarded request waits for a reply before timing out.
    pub request_timeout: std::time::Duration,
    /// Maximum number of tunnels a single control channel may hold open.
    pub max_tunnels_per_channel: usize,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_host: env_or("BIND_HOST", "0.0.0.0"),
            http_port: env_parse("HTTP_PORT", 3000),
            control_port: env_parse("CONTROL_PORT", 3001),
            public_domain: env_or("PUBLIC_DOMAIN", "localhost"),
            public_scheme: env_or("PUBLIC_SCHEME", "http"),
            dashboard_origin: env_or("DASHBOARD_ORIGIN", "*"),
            max_body_bytes: env_parse("MAX_BODY_BYTES", 10 * 1024 * 1024),
            max_stored_exchanges: env_parse("MAX_STORED_EXCHANGES", 1000),
            retention: std::time::Duration::from_secs(env_parse("RETENTION_SECS", 3600)),
            heartbeat_interval: std::time::Duration::from_secs(env_parse("HEARTBEAT_SECS", 30)),
            request_timeout: std::time::Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 30)),
            max_tunnels_per_channel: env_parse("MAX_TUNNELS_PER_CHANNEL", 10),
        }
    }

    /// Build the public URL tunnels are advertised under. Always carries the
    /// HTTP port explicitly (e.g. `http://demo1.localhost:3000`) since the
    /// default public domain is bare (no DNS in front of it); a deployment
    /// fronted by a real domain on 80/443 sets `PUBLIC_DOMAIN` and
    /// `HTTP_PORT` so the port segment matches whatever is actually exposed.
    pub fn public_url(&self, subdomain: &str) -> String {
        format!(
            "{}://{}.{}:{}",
            self.public_scheme, subdomain, self.public_domain, self.http_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_url_uses_configured_scheme_domain_and_port() {
        let cfg = Config {
            public_scheme: "https".into(),
            public_domain: "example.com".into(),
            http_port: 443,
            ..Config::from_env()
        };
        assert_eq!(cfg.public_url("demo1"), "https://demo1.example.com:443");
    }

    #[test]
    fn default_public_url_matches_localhost_scenario() {
        let cfg = Config::from_env();
        assert_eq!(cfg.public_url("demo1"), "http://demo1.localhost:3000");
    }
}
