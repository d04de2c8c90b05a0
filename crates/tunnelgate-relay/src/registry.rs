//! Tunnel registry.
//!
//! Owns the authoritative mapping from subdomain, tunnel id, and owning
//! control channel to tunnel state, as three independently-queryable
//! indexes over the one source of truth — a single `HashMap<String, Tunnel>`
//! keyed by subdomain alone wouldn't let a channel-close teardown enumerate
//! every tunnel a channel owns, nor a single tunnel-id lookup skip the
//! subdomain index entirely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tunnelgate_protocol::{ids, ControlMessage, GatewayError};

use crate::pending::PendingTable;

pub type TunnelId = String;
pub type ChannelId = String;

/// Cumulative counters and last-activity clock a tunnel accrues over its
/// lifetime (spec §3 Tunnel attributes). Kept behind an `Arc` so every
/// `Tunnel` clone shares the same counters.
struct Activity {
    request_count: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    last_activity: AsyncMutex<Instant>,
}

/// One registered tunnel: the subdomain it answers on, the channel that
/// owns it, and the pending-request table (component D) forwarded requests
/// wait on.
#[derive(Clone)]
pub struct Tunnel {
    pub id: TunnelId,
    pub subdomain: String,
    pub channel_id: ChannelId,
    pub local_port: u16,
    pub created_at: Instant,
    pub pending: Arc<PendingTable>,
    activity: Arc<Activity>,
}

impl Tunnel {
    /// Record one forwarded exchange against this tunnel: bumps the
    /// request count, adds to the byte counters, and refreshes
    /// last-activity. Called by the correlator for every outcome —
    /// success, agent error, or timeout (spec §4.E step 8).
    pub async fn touch(&self, bytes_in: u64, bytes_out: u64) {
        self.activity.request_count.fetch_add(1, Ordering::Relaxed);
        self.activity.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.activity.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        *self.activity.last_activity.lock().await = Instant::now();
    }

    pub fn request_count(&self) -> u64 {
        self.activity.request_count.load(Ordering::Relaxed)
    }

    pub fn bytes_in(&self) -> u64 {
        self.activity.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.activity.bytes_out.load(Ordering::Relaxed)
    }

    pub async fn last_activity(&self) -> Instant {
        *self.activity.last_activity.lock().await
    }
}

struct Channel {
    sender: mpsc::Sender<ControlMessage>,
    tunnel_ids: Vec<TunnelId>,
}

/// The tunnel registry: subdomain → id, id → tunnel, channel → owned ids.
pub struct Registry {
    by_subdomain: DashMap<String, TunnelId>,
    by_id: DashMap<TunnelId, Tunnel>,
    channels: DashMap<ChannelId, Channel>,
    max_tunnels_per_channel: usize,
}

impl Registry {
    pub fn new(max_tunnels_per_channel: usize) -> Self {
        Self {
            by_subdomain: DashMap::new(),
            by_id: DashMap::new(),
            channels: DashMap::new(),
            max_tunnels_per_channel,
        }
    }

    /// Register a new channel (a newly-accepted control connection) before
    /// any tunnel is registered on it, so `send_to_channel` has somewhere to
    /// deliver to even before the first `tunnel:register`.
    pub fn open_channel(&self, channel_id: ChannelId, sender: mpsc::Sender<ControlMessage>) {
        self.channels.insert(
            channel_id,
            Channel {
                sender,
                tunnel_ids: Vec::new(),
            },
        );
    }

    /// Register a tunnel on an already-open channel. Honors an explicitly
    /// requested subdomain (failing with `SUBDOMAIN_TAKEN` if it collides)
    /// or mints a fresh one otherwise.
    pub fn register(
        &self,
        channel_id: &ChannelId,
        requested_subdomain: Option<String>,
        local_port: u16,
    ) -> Result<Tunnel, GatewayError> {
        let owned = self
            .channels
            .get(channel_id)
            .map(|c| c.tunnel_ids.len())
            .unwrap_or(0);
        if owned >= self.max_tunnels_per_channel {
            return Err(GatewayError::tunnel_limit_exceeded(format!(
                "channel already owns {owned} tunnels, limit is {}",
                self.max_tunnels_per_channel
            )));
        }

        let subdomain = match requested_subdomain {
            Some(s) => {
                let s = s.to_lowercase();
                if !is_valid_subdomain(&s) {
                    return Err(GatewayError::invalid_subdomain(format!(
                        "'{s}' is not a valid subdomain"
                    )));
                }
                if is_reserved(&s) || self.by_subdomain.contains_key(&s) {
                    return Err(GatewayError::subdomain_taken(format!(
                        "subdomain '{s}' is already in use"
                    )));
                }
                s
            }
            None => ids::generate_unique(
                ids::subdomain_candidate,
                |candidate| is_reserved(candidate) || self.by_subdomain.contains_key(candidate),
                GatewayError::subdomain_taken("could not allocate a free subdomain"),
            )?,
        };

        let tunnel_id = ids::generate_unique(
            ids::tunnel_id_candidate,
            |candidate| self.by_id.contains_key(candidate),
            GatewayError::new(
                tunnelgate_protocol::ErrorCode::GenericError,
                "could not allocate a free tunnel id",
            ),
        )?;

        let now = Instant::now();
        let tunnel = Tunnel {
            id: tunnel_id.clone(),
            subdomain: subdomain.clone(),
            channel_id: channel_id.clone(),
            local_port,
            created_at: now,
            pending: Arc::new(PendingTable::new()),
            activity: Arc::new(Activity {
                request_count: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                last_activity: AsyncMutex::new(now),
            }),
        };

        self.by_subdomain.insert(subdomain, tunnel_id.clone());
        self.by_id.insert(tunnel_id.clone(), tunnel.clone());
        if let Some(mut c) = self.channels.get_mut(channel_id) {
            c.tunnel_ids.push(tunnel_id);
        }

        tracing::info!(tunnel_id = %tunnel.id, subdomain = %tunnel.subdomain, "tunnel created");
        Ok(tunnel)
    }

    pub fn lookup_by_subdomain(&self, subdomain: &str) -> Option<Tunnel> {
        let id = self.by_subdomain.get(subdomain)?.clone();
        self.by_id.get(&id).map(|t| t.clone())
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<Tunnel> {
        self.by_id.get(id).map(|t| t.clone())
    }

    pub fn list_by_channel(&self, channel_id: &ChannelId) -> Vec<Tunnel> {
        self.channels
            .get(channel_id)
            .map(|c| {
                c.tunnel_ids
                    .iter()
                    .filter_map(|id| self.by_id.get(id).map(|t| t.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_all(&self) -> Vec<Tunnel> {
        self.by_id.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Send a control message to the channel owning `channel_id`, if still
    /// open. Errors propagate as `CONNECTION_CLOSED` rather than a panic —
    /// the channel may have been torn down between lookup and send.
    pub async fn send_to_channel(&self, channel_id: &ChannelId, msg: ControlMessage) -> Result<(), GatewayError> {
        let sender = self
            .channels
            .get(channel_id)
            .map(|c| c.sender.clone())
            .ok_or_else(|| GatewayError::connection_closed(format!("channel {channel_id} is gone")))?;
        sender
            .send(msg)
            .await
            .map_err(|_| GatewayError::connection_closed(format!("channel {channel_id} closed mid-send")))
    }

    /// Tear down a single tunnel, leaving the owning channel (and its other
    /// tunnels) untouched.
    pub fn close(&self, tunnel_id: &str) -> Option<Tunnel> {
        let tunnel = self.by_id.remove(tunnel_id).map(|(_, t)| t)?;
        self.by_subdomain.remove(&tunnel.subdomain);
        if let Some(mut c) = self.channels.get_mut(&tunnel.channel_id) {
            c.tunnel_ids.retain(|id| id != tunnel_id);
        }
        Some(tunnel)
    }

    /// Tear down every tunnel owned by a channel and drop the channel
    /// itself — called when a control connection closes, abruptly or not.
    pub fn close_channel(&self, channel_id: &ChannelId) -> Vec<Tunnel> {
        let Some((_, channel)) = self.channels.remove(channel_id) else {
            return Vec::new();
        };
        channel
            .tunnel_ids
            .iter()
            .filter_map(|id| {
                let tunnel = self.by_id.remove(id).map(|(_, t)| t)?;
                self.by_subdomain.remove(&tunnel.subdomain);
                Some(tunnel)
            })
            .collect()
    }

    pub fn close_all(&self) -> Vec<Tunnel> {
        let channel_ids: Vec<ChannelId> = self.channels.iter().map(|e| e.key().clone()).collect();
        channel_ids
            .into_iter()
            .flat_map(|id| self.close_channel(&id))
            .collect()
    }

    pub fn tunnel_count(&self) -> usize {
        self.by_id.len()
    }
}

/// Process-global reserved labels (spec §3): never assignable to a tunnel,
/// whether requested explicitly or drawn by the generator.
pub const RESERVED_SUBDOMAINS: &[&str] = &["api", "www", "admin", "dashboard", "app", "mail", "ftp"];

pub fn is_reserved(s: &str) -> bool {
    RESERVED_SUBDOMAINS.iter().any(|r| r.eq_ignore_ascii_case(s))
}

/// `[a-z0-9][a-z0-9-]*[a-z0-9]`, length 4-32 (spec §3) — the same shape the
/// gateway itself generates (spec §4.B), so a caller-requested subdomain is
/// held to the identical rule.
fn is_valid_subdomain(s: &str) -> bool {
    if s.len() < 4 || s.len() > 32 {
        return false;
    }
    if s.starts_with('-') || s.ends_with('-') {
        return false;
    }
    s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        let r = Registry::new(2);
        let (tx, _rx) = mpsc::channel(8);
        r.open_channel("chan-1".into(), tx);
        r
    }

    #[test]
    fn registers_with_requested_subdomain() {
        let r = registry();
        let t = r.register(&"chan-1".to_string(), Some("demo1".into()), 3000).unwrap();
        assert_eq!(t.subdomain, "demo1");
        assert_eq!(r.lookup_by_subdomain("demo1").unwrap().id, t.id);
    }

    #[test]
    fn rejects_duplicate_requested_subdomain() {
        let r = registry();
        r.register(&"chan-1".to_string(), Some("demo1".into()), 3000).unwrap();
        let (tx, _rx) = mpsc::channel(8);
        r.open_channel("chan-2".into(), tx);
        let err = r.register(&"chan-2".to_string(), Some("demo1".into()), 3000).unwrap_err();
        assert_eq!(err.code, tunnelgate_protocol::ErrorCode::SubdomainTaken);
    }

    #[test]
    fn rejects_invalid_requested_subdomain() {
        let r = registry();
        let err = r
            .register(&"chan-1".to_string(), Some("Not_Valid!".into()), 3000)
            .unwrap_err();
        assert_eq!(err.code, tunnelgate_protocol::ErrorCode::InvalidSubdomain);
    }

    #[test]
    fn generates_a_subdomain_when_none_requested() {
        let r = registry();
        let t = r.register(&"chan-1".to_string(), None, 3000).unwrap();
        assert_eq!(t.subdomain.len(), 8);
    }

    #[test]
    fn enforces_per_channel_tunnel_limit() {
        let r = registry();
        r.register(&"chan-1".to_string(), None, 3000).unwrap();
        r.register(&"chan-1".to_string(), None, 3001).unwrap();
        let err = r.register(&"chan-1".to_string(), None, 3002).unwrap_err();
        assert_eq!(err.code, tunnelgate_protocol::ErrorCode::TunnelLimitExceeded);
    }

    #[test]
    fn close_channel_removes_every_owned_tunnel() {
        let r = registry();
        let a = r.register(&"chan-1".to_string(), None, 3000).unwrap();
        let b = r.register(&"chan-1".to_string(), None, 3001).unwrap();
        let closed = r.close_channel(&"chan-1".to_string());
        assert_eq!(closed.len(), 2);
        assert!(r.lookup_by_id(&a.id).is_none());
        assert!(r.lookup_by_id(&b.id).is_none());
        assert!(r.lookup_by_subdomain(&a.subdomain).is_none());
    }

    #[test]
    fn rejects_reserved_requested_subdomain() {
        let r = registry();
        let err = r.register(&"chan-1".to_string(), Some("api".into()), 3000).unwrap_err();
        assert_eq!(err.code, tunnelgate_protocol::ErrorCode::SubdomainTaken);
    }

    #[test]
    fn rejects_subdomain_below_minimum_length() {
        let r = registry();
        let err = r.register(&"chan-1".to_string(), Some("abc".into()), 3000).unwrap_err();
        assert_eq!(err.code, tunnelgate_protocol::ErrorCode::InvalidSubdomain);
        let ok = r.register(&"chan-1".to_string(), Some("abcd".into()), 3000);
        assert!(ok.is_ok());
    }

    #[test]
    fn rejects_subdomain_above_maximum_length() {
        let r = registry();
        let too_long = "a".repeat(33);
        let err = r.register(&"chan-1".to_string(), Some(too_long), 3000).unwrap_err();
        assert_eq!(err.code, tunnelgate_protocol::ErrorCode::InvalidSubdomain);
        let exactly_32 = "a".repeat(32);
        let ok = r.register(&"chan-1".to_string(), Some(exactly_32), 3000);
        assert!(ok.is_ok());
    }

    #[test]
    fn case_folds_requested_subdomain() {
        let r = registry();
        let t = r.register(&"chan-1".to_string(), Some("DemoOne".into()), 3000).unwrap();
        assert_eq!(t.subdomain, "demoone");
    }

    #[test]
    fn close_single_tunnel_leaves_channel_siblings() {
        let r = registry();
        let a = r.register(&"chan-1".to_string(), None, 3000).unwrap();
        let b = r.register(&"chan-1".to_string(), None, 3001).unwrap();
        r.close(&a.id);
        assert!(r.lookup_by_id(&a.id).is_none());
        assert!(r.lookup_by_id(&b.id).is_some());
        assert_eq!(r.list_by_channel(&"chan-1".to_string()).len(), 1);
    }
}
