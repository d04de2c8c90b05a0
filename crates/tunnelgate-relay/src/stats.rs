//! Derived counters and rates backing `GET /api/stats`.
//!
//! Same fixed-capacity-`Vec<u64>` + write-cursor latency histogram and
//! atomic counters as a Prometheus exporter would keep internally, minus the
//! text-exposition format: there is no `/metrics` surface here, just the
//! plain JSON shape `/api/stats` returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Stats {
    inner: Arc<Inner>,
}

struct Inner {
    total_requests: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    latencies: Mutex<LatencyHistogram>,
}

struct LatencyHistogram {
    values: Vec<u64>,
    pos: usize,
    count: u64,
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum += latency_us;
    }

    fn percentile(&self, p: f64) -> u64 {
        let filled = self.count.min(self.values.len() as u64) as usize;
        if filled == 0 {
            return 0;
        }
        let mut sorted = self.values[..filled].to_vec();
        sorted.sort_unstable();
        let idx = ((filled as f64 * p / 100.0) as usize).min(filled - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum / self.count
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct StatsSummary {
    pub total_requests: u64,
    pub requests_2xx: u64,
    pub requests_3xx: u64,
    pub requests_4xx: u64,
    pub requests_5xx: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub latency_p50_us: u64,
    pub latency_p95_us: u64,
    pub latency_p99_us: u64,
    pub latency_avg_us: u64,
    pub active_tunnels: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                total_requests: AtomicU64::new(0),
                status_2xx: AtomicU64::new(0),
                status_3xx: AtomicU64::new(0),
                status_4xx: AtomicU64::new(0),
                status_5xx: AtomicU64::new(0),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                latencies: Mutex::new(LatencyHistogram::new(10_000)),
            }),
        }
    }

    pub async fn record_request(&self, status: u16, latency_us: u64, bytes_in: u64, bytes_out: u64) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.inner.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
        match status / 100 {
            2 => {
                self.inner.status_2xx.fetch_add(1, Ordering::Relaxed);
            }
            3 => {
                self.inner.status_3xx.fetch_add(1, Ordering::Relaxed);
            }
            4 => {
                self.inner.status_4xx.fetch_add(1, Ordering::Relaxed);
            }
            5 => {
                self.inner.status_5xx.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        self.inner.latencies.lock().await.record(latency_us);
    }

    pub async fn summary(&self, active_tunnels: u64) -> StatsSummary {
        let lat = self.inner.latencies.lock().await;
        StatsSummary {
            total_requests: self.inner.total_requests.load(Ordering::Relaxed),
            requests_2xx: self.inner.status_2xx.load(Ordering::Relaxed),
            requests_3xx: self.inner.status_3xx.load(Ordering::Relaxed),
            requests_4xx: self.inner.status_4xx.load(Ordering::Relaxed),
            requests_5xx: self.inner.status_5xx.load(Ordering::Relaxed),
            bytes_in: self.inner.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.inner.bytes_out.load(Ordering::Relaxed),
            latency_p50_us: lat.percentile(50.0),
            latency_p95_us: lat.percentile(95.0),
            latency_p99_us: lat.percentile(99.0),
            latency_avg_us: lat.average(),
            active_tunnels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn summary_reflects_recorded_requests() {
        let stats = Stats::new();
        stats.record_request(200, 1000, 10, 20).await;
        stats.record_request(500, 3000, 5, 0).await;
        let summary = stats.summary(2).await;
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.requests_2xx, 1);
        assert_eq!(summary.requests_5xx, 1);
        assert_eq!(summary.bytes_in, 15);
        assert_eq!(summary.active_tunnels, 2);
    }

    #[tokio::test]
    async fn percentiles_are_zero_with_no_samples() {
        let stats = Stats::new();
        let summary = stats.summary(0).await;
        assert_eq!(summary.latency_p50_us, 0);
        assert_eq!(summary.latency_avg_us, 0);
    }
}
