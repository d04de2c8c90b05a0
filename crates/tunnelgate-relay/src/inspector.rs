//! Inspector store (spec §4.G): a bounded circular buffer of captured
//! request/response exchanges, queryable globally, per tunnel, or by id,
//! with header sanitization and curl reconstruction.
//!
//! Grounded in the teacher's client-side `client/src/inspector.rs`, which
//! kept a `VecDeque<InspectorEntry>` ring buffer of the agent's own traffic
//! for local debugging. This repository relocates the same idea to the
//! gateway side per spec §4.G, adds the per-tunnel and by-id indexes the
//! global view alone can't answer efficiently, and extends it with a
//! retention sweep so exchanges age out even before the buffer fills.

use std::collections::VecDeque;
use std::sync::Mutex;

use dashmap::DashMap;

use crate::headers;

/// One captured request/response pair.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Exchange {
    pub id: String,
    pub tunnel_id: String,
    pub subdomain: String,
    pub method: String,
    pub url: String,
    pub request_headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    pub status_code: Option<u16>,
    pub response_headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_us: u64,
    pub captured_at_ms: u64,
}

impl Exchange {
    fn sanitized(&self) -> Self {
        let mut copy = self.clone();
        copy.request_headers = headers::sanitize(&copy.request_headers);
        copy.response_headers = headers::sanitize(&copy.response_headers);
        copy
    }

    /// Reconstruct the request as a shell `curl` invocation (spec §4.G).
    /// Omits `host`/`content-length` (the transport supplies both), emits
    /// `-X METHOD` unless the method is `GET`, and escapes single quotes
    /// inside header/body values with the standard `'\''` technique so the
    /// command is safe to paste into a POSIX shell. Sanitization here only
    /// ever affects header *values* — the method, url, and body are never
    /// redacted.
    pub fn to_curl(&self, sanitize: bool) -> String {
        let source = if sanitize { self.sanitized() } else { self.clone() };
        let mut cmd = "curl".to_string();
        if source.method != "GET" {
            cmd.push_str(&format!(" -X {}", source.method));
        }
        for (k, v) in &source.request_headers {
            if k.eq_ignore_ascii_case("host") || k.eq_ignore_ascii_case("content-length") {
                continue;
            }
            cmd.push_str(&format!(" -H '{}: {}'", shell_escape(k), shell_escape(v)));
        }
        if let Some(body) = &source.request_body {
            // `request_body` is stored base64-encoded (the wire shape); curl
            // needs the original bytes back, not the base64 text itself.
            let decoded = tunnelgate_protocol::ControlMessage::decode_body(body)
                .ok()
                .and_then(|b| String::from_utf8(b).ok())
                .unwrap_or_else(|| body.clone());
            cmd.push_str(&format!(" -d '{}'", shell_escape(&decoded)));
        }
        cmd.push_str(&format!(" '{}'", shell_escape(&source.url)));
        cmd
    }
}

fn shell_escape(s: &str) -> String {
    s.replace('\'', r"'\''")
}

/// The client's eventual answer to a previously-recorded request, applied
/// via [`Inspector::record_response`].
#[derive(Debug, Clone, Default)]
pub struct ExchangeUpdate {
    pub status_code: Option<u16>,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub latency_us: u64,
}

#[derive(Debug, Default, Clone)]
pub struct TrafficFilter {
    pub tunnel_id: Option<String>,
    pub method: Option<String>,
    pub status: Option<u16>,
    pub path: Option<regex::Regex>,
    pub since_ms: Option<u64>,
    pub sanitize: bool,
    pub limit: usize,
    pub offset: usize,
}

pub struct TrafficPage {
    pub entries: Vec<Exchange>,
    pub total: usize,
}

struct OrderEntry {
    id: String,
    tunnel_id: String,
    captured_at_ms: u64,
}

/// Bounded, three-index store: insertion order (for global listing and
/// capacity eviction), by id, and by owning tunnel.
pub struct Inspector {
    capacity: usize,
    retention_ms: u64,
    order: Mutex<VecDeque<OrderEntry>>,
    by_id: DashMap<String, Exchange>,
    by_tunnel: DashMap<String, Vec<String>>,
}

impl Inspector {
    pub fn new(capacity: usize, retention: std::time::Duration) -> Self {
        Self {
            capacity,
            retention_ms: retention.as_millis() as u64,
            order: Mutex::new(VecDeque::new()),
            by_id: DashMap::new(),
            by_tunnel: DashMap::new(),
        }
    }

    /// Record a freshly-dispatched request (spec §4.G `recordRequest`),
    /// before the client's reply is known — so an in-flight exchange is
    /// already visible to `/api/traffic` while the correlator awaits a
    /// response. Evicts the oldest entry globally if the buffer is now over
    /// capacity, and the oldest entry for the same tunnel if that tunnel now
    /// holds more than its per-tunnel share (spec §3 invariant 5: at most N
    /// globally, at most ⌊N/2⌋ per tunnel).
    pub fn record_request(&self, exchange: Exchange) {
        let id = exchange.id.clone();
        let tunnel_id = exchange.tunnel_id.clone();
        let captured_at_ms = exchange.captured_at_ms;

        self.by_id.insert(id.clone(), exchange);
        self.by_tunnel.entry(tunnel_id.clone()).or_default().push(id.clone());

        let mut order = self.order.lock().expect("inspector order mutex poisoned");
        order.push_back(OrderEntry {
            id,
            tunnel_id: tunnel_id.clone(),
            captured_at_ms,
        });
        while order.len() > self.capacity {
            if let Some(evicted) = order.pop_front() {
                self.evict(&evicted.id, &evicted.tunnel_id);
            }
        }
        drop(order);

        let per_tunnel_cap = self.capacity / 2;
        loop {
            let oldest_for_tunnel = self.by_tunnel.get(&tunnel_id).and_then(|ids| {
                if ids.len() > per_tunnel_cap {
                    ids.first().cloned()
                } else {
                    None
                }
            });
            let Some(oldest_id) = oldest_for_tunnel else { break };
            self.by_id.remove(&oldest_id);
            if let Some(mut ids) = self.by_tunnel.get_mut(&tunnel_id) {
                ids.retain(|x| x != &oldest_id);
            }
            let mut order = self.order.lock().expect("inspector order mutex poisoned");
            order.retain(|e| e.id != oldest_id);
        }
    }

    /// Mutate a previously-recorded exchange in place with the client's
    /// answer (spec §4.G `recordResponse`): either a response or an error,
    /// never both. An id with no matching request — the client replying to
    /// something this store never captured, or the entry having already
    /// aged out — is dropped with a warning rather than inserting a
    /// half-formed exchange.
    pub fn record_response(&self, id: &str, update: ExchangeUpdate) {
        let Some(mut entry) = self.by_id.get_mut(id) else {
            tracing::warn!(request_id = id, "dropping orphaned response: no matching captured request");
            return;
        };
        entry.status_code = update.status_code;
        entry.response_headers = update.response_headers;
        entry.response_body = update.response_body;
        entry.error = update.error;
        entry.latency_us = update.latency_us;
    }

    fn evict(&self, id: &str, tunnel_id: &str) {
        self.by_id.remove(id);
        if let Some(mut ids) = self.by_tunnel.get_mut(tunnel_id) {
            ids.retain(|x| x != id);
        }
    }

    /// Drop exchanges older than the configured retention window. Intended
    /// to run on a periodic timer from `main`, independent of capacity
    /// pressure — a quiet gateway still ages its captures out.
    pub fn sweep(&self, now_ms: u64) {
        let mut order = self.order.lock().expect("inspector order mutex poisoned");
        while let Some(front) = order.front() {
            if now_ms.saturating_sub(front.captured_at_ms) > self.retention_ms {
                let evicted = order.pop_front().unwrap();
                self.evict(&evicted.id, &evicted.tunnel_id);
            } else {
                break;
            }
        }
    }

    pub fn get(&self, id: &str, sanitize: bool) -> Option<Exchange> {
        let e = self.by_id.get(id)?.clone();
        Some(if sanitize { e.sanitized() } else { e })
    }

    /// List captured exchanges, newest first, honoring tunnel/status
    /// filters and limit/offset pagination.
    ///
    /// `now_ms` bounds the result against the retention window directly
    /// (spec §3 invariant 6: "no captured exchange older than the retention
    /// window is ever returned from a query"). The periodic `sweep` only
    /// evicts every 60s, so without this check here a query landing between
    /// two sweeps could still hand back an entry that aged out moments ago;
    /// filtering it out of the query itself makes the invariant hold at
    /// every instant, not just right after a sweep runs.
    pub fn list(&self, filter: &TrafficFilter, now_ms: u64) -> TrafficPage {
        let ids: Vec<String> = match &filter.tunnel_id {
            Some(tid) => self.by_tunnel.get(tid).map(|v| v.clone()).unwrap_or_default(),
            None => self
                .order
                .lock()
                .expect("inspector order mutex poisoned")
                .iter()
                .map(|e| e.id.clone())
                .collect(),
        };

        let mut matched: Vec<Exchange> = ids
            .iter()
            .rev()
            .filter_map(|id| self.by_id.get(id).map(|e| e.clone()))
            .filter(|e| now_ms.saturating_sub(e.captured_at_ms) <= self.retention_ms)
            .filter(|e| filter.status.map(|s| e.status_code == Some(s)).unwrap_or(true))
            .filter(|e| {
                filter
                    .method
                    .as_ref()
                    .map(|m| e.method.eq_ignore_ascii_case(m))
                    .unwrap_or(true)
            })
            .filter(|e| filter.path.as_ref().map(|re| re.is_match(&e.url)).unwrap_or(true))
            .filter(|e| filter.since_ms.map(|since| e.captured_at_ms >= since).unwrap_or(true))
            .collect();

        let total = matched.len();
        let limit = if filter.limit == 0 { total } else { filter.limit };
        matched = matched.into_iter().skip(filter.offset).take(limit).collect();

        if filter.sanitize {
            matched = matched.iter().map(|e| e.sanitized()).collect();
        }

        TrafficPage { entries: matched, total }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}
