use std::sync::atomic::{AtomicU64, Ordering};

/// Balancer-wide counters.
///
/// Updated from the per-worker hot paths, so every field is atomic.
pub struct Metrics {
    queries_accepted: AtomicU64,
    queries_forwarded: AtomicU64,
    replies_sent: AtomicU64,
    probes_sent: AtomicU64,
    recv_errors: AtomicU64,
    parse_errors: AtomicU64,
    send_errors: AtomicU64,
    correlation_misses: AtomicU64,
    duplicate_evictions: AtomicU64,
    expired_evictions: AtomicU64,
    selection_failures: AtomicU64,
    unroutable_replies: AtomicU64,
    forwarders_lost: AtomicU64,
    forwarders_recovered: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            queries_accepted: AtomicU64::new(0),
            queries_forwarded: AtomicU64::new(0),
            replies_sent: AtomicU64::new(0),
            probes_sent: AtomicU64::new(0),
            recv_errors: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
            correlation_misses: AtomicU64::new(0),
            duplicate_evictions: AtomicU64::new(0),
            expired_evictions: AtomicU64::new(0),
            selection_failures: AtomicU64::new(0),
            unroutable_replies: AtomicU64::new(0),
            forwarders_lost: AtomicU64::new(0),
            forwarders_recovered: AtomicU64::new(0),
        }
    }

    pub fn inc_query_accepted(&self) {
        self.queries_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queries_accepted(&self) -> u64 {
        self.queries_accepted.load(Ordering::Relaxed)
    }

    pub fn inc_query_forwarded(&self) {
        self.queries_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queries_forwarded(&self) -> u64 {
        self.queries_forwarded.load(Ordering::Relaxed)
    }

    pub fn inc_reply_sent(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replies_sent(&self) -> u64 {
        self.replies_sent.load(Ordering::Relaxed)
    }

    pub fn inc_probe_sent(&self) {
        self.probes_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn probes_sent(&self) -> u64 {
        self.probes_sent.load(Ordering::Relaxed)
    }

    pub fn inc_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recv_errors(&self) -> u64 {
        self.recv_errors.load(Ordering::Relaxed)
    }

    pub fn inc_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn inc_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    pub fn inc_correlation_miss(&self) {
        self.correlation_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn correlation_misses(&self) -> u64 {
        self.correlation_misses.load(Ordering::Relaxed)
    }

    pub fn inc_duplicate_eviction(&self) {
        self.duplicate_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_evictions(&self) -> u64 {
        self.duplicate_evictions.load(Ordering::Relaxed)
    }

    pub fn inc_expired_eviction(&self) {
        self.expired_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn expired_evictions(&self) -> u64 {
        self.expired_evictions.load(Ordering::Relaxed)
    }

    pub fn inc_selection_failure(&self) {
        self.selection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn selection_failures(&self) -> u64 {
        self.selection_failures.load(Ordering::Relaxed)
    }

    pub fn inc_unroutable_reply(&self) {
        self.unroutable_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unroutable_replies(&self) -> u64 {
        self.unroutable_replies.load(Ordering::Relaxed)
    }

    pub fn inc_forwarder_lost(&self) {
        self.forwarders_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn forwarders_lost(&self) -> u64 {
        self.forwarders_lost.load(Ordering::Relaxed)
    }

    pub fn inc_forwarder_recovered(&self) {
        self.forwarders_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn forwarders_recovered(&self) -> u64 {
        self.forwarders_recovered.load(Ordering::Relaxed)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
