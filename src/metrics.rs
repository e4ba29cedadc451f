//! Atomic counters exposed by stateful operators.
//!
//! `spec.md` §5 requires that "all counters exposed as metrics are updated
//! with atomic operations and read with plain loads." Each stateful operator
//! (tee, join, windowed join, aggregate) owns one of these structs behind an
//! `Arc` so a caller can clone a handle out and poll it from another task
//! while the operator's own worker keeps mutating it lock-free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A single monotonically increasing counter plus a high-water mark.
#[derive(Debug, Default)]
pub struct PeakCounter {
    current: AtomicU64,
    peak: AtomicU64,
}

impl PeakCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        let now = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.current.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: u64) {
        self.current.store(value, Ordering::Relaxed);
        self.peak.fetch_max(value, Ordering::Relaxed);
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Metrics for a join operator: current and peak size of each side's
/// unmatched-waiting table, plus a lifetime match/discard count.
#[derive(Debug, Default)]
pub struct JoinMetrics {
    pub left_waiting: PeakCounter,
    pub right_waiting: PeakCounter,
    matched: AtomicU64,
    discarded: AtomicU64,
}

impl JoinMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_match(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// Metrics for the windowed aggregate operator (`spec.md` §4.9): total
/// windows ever observed, total windows closed, and peak concurrency. All
/// three counters are monotonic within one run except `concurrent`, which
/// tracks a high-water mark via `PeakCounter`.
#[derive(Debug, Default)]
pub struct AggregateMetrics {
    windows_observed: AtomicU64,
    windows_closed: AtomicU64,
    pub concurrent: PeakCounter,
}

impl AggregateMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_window_opened(&self) {
        self.windows_observed.fetch_add(1, Ordering::Relaxed);
        self.concurrent.increment();
    }

    pub fn record_window_closed(&self) {
        self.windows_closed.fetch_add(1, Ordering::Relaxed);
        self.concurrent.decrement();
    }

    pub fn windows_observed(&self) -> u64 {
        self.windows_observed.load(Ordering::Relaxed)
    }

    pub fn windows_closed(&self) -> u64 {
        self.windows_closed.load(Ordering::Relaxed)
    }
}

/// Metrics for a tee's per-subscriber buffers (`spec.md` §4.2/§8).
#[derive(Debug, Default)]
pub struct TeeMetrics {
    pub subscriber_buffered: Vec<PeakCounter>,
}

impl TeeMetrics {
    pub fn new(subscriber_count: usize) -> Arc<Self> {
        Arc::new(Self {
            subscriber_buffered: (0..subscriber_count).map(|_| PeakCounter::new()).collect(),
        })
    }

    pub fn total_buffered(&self) -> u64 {
        self.subscriber_buffered.iter().map(|c| c.current()).sum()
    }

    pub fn peak_total(&self) -> u64 {
        self.subscriber_buffered.iter().map(|c| c.peak()).sum()
    }
}
