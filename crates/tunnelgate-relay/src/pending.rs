//! Pending-request table.
//!
//! One table per tunnel, mapping an in-flight request id to the oneshot
//! completion handle its HTTP handler is blocked on —
//! `DashMap<String, oneshot::Sender<Completion>>`, carrying either a
//! response or a translated error. The deadline lives with the correlator's
//! `tokio::time::timeout` at the awaiting side rather than a second timer
//! stored here.

use dashmap::DashMap;
use tokio::sync::oneshot;
use tunnelgate_protocol::{message::HttpResponsePayload, ErrorCode, GatewayError};

/// What a pending request resolves to: the client's answer, or the reason
/// it never arrived.
pub type Completion = Result<HttpResponsePayload, GatewayError>;

pub struct PendingTable {
    inner: DashMap<String, oneshot::Sender<Completion>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self { inner: DashMap::new() }
    }

    /// Register a new in-flight request, returning the receiver its HTTP
    /// handler awaits (racing it against a deadline with
    /// `tokio::time::timeout`).
    pub fn insert(&self, request_id: String) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(request_id, tx);
        rx
    }

    /// Same as [`Self::insert`], but also returns a [`PendingGuard`] whose
    /// `Drop` removes the registration. The awaiting side's deadline lives
    /// in the caller's `tokio::time::timeout`, which only runs while the
    /// caller's future is being polled — if the inbound HTTP connection
    /// closes first, axum drops that future (and the timeout with it)
    /// without ever reaching the code that would call [`Self::remove`].
    /// Binding the guard alongside the receiver means the entry is cleaned
    /// up either way: on an ordinary return, or on the future being
    /// cancelled mid-await (spec §4.E "Cancellation" / §5).
    pub fn insert_guarded(&self, request_id: String) -> (PendingGuard<'_>, oneshot::Receiver<Completion>) {
        let rx = self.insert(request_id.clone());
        (PendingGuard { table: self, request_id }, rx)
    }

    /// Deliver a completion for `request_id`. Returns `false` if nothing was
    /// waiting — the request already timed out, or the id was never
    /// registered (a late or spoofed reply).
    pub fn complete(&self, request_id: &str, completion: Completion) -> bool {
        match self.inner.remove(request_id) {
            Some((_, tx)) => tx.send(completion).is_ok(),
            None => false,
        }
    }

    /// Drop a registration without completing it — used once a request's
    /// deadline fires, so a late reply from the client is recognized as
    /// late (`complete` returns `false`) instead of silently succeeding.
    pub fn remove(&self, request_id: &str) {
        self.inner.remove(request_id);
    }

    /// Fail every still-pending request with the literal message "Tunnel
    /// closed" (spec §4.C `close`), e.g. because the owning channel just
    /// disconnected or the tunnel was explicitly closed.
    pub fn fail_all(&self) {
        self.fail_all_with("Tunnel closed");
    }

    /// Same as [`Self::fail_all`] but with a caller-chosen reason — used at
    /// process shutdown (spec §5: reason "Server shutdown") where the
    /// failure isn't attributable to the tunnel itself. Completing rather
    /// than dropping each sender means a waiting correlator sees a proper
    /// `REQUEST_FAILED` completion instead of racing a bare `RecvError`.
    pub fn fail_all_with(&self, reason: &str) {
        let keys: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, tx)) = self.inner.remove(&key) {
                let _ = tx.send(Err(GatewayError::new(ErrorCode::RequestFailed, reason)));
            }
        }
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.inner.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// RAII handle for one [`PendingTable::insert_guarded`] registration.
/// Removing the entry on `Drop` is idempotent with every other terminal
/// path (`complete`, `remove`, `fail_all`/`fail_all_with` have already taken
/// the entry out of the map), so it is harmless to let the guard run after
/// any of them — it only matters on the path none of them cover: the
/// caller's future being dropped before it reaches a terminal state at all.
pub struct PendingGuard<'a> {
    table: &'a PendingTable,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(&self.request_id);
    }
}
