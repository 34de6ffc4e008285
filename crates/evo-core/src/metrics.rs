//! Global atomic counters for engine observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a round), or
//! [`Metrics::snapshot`] to serve them.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Atomic counters, no allocation or locking.
pub struct Metrics {
    rounds_started: AtomicU64,
    rounds_completed: AtomicU64,
    rounds_failed: AtomicU64,
    variants_created: AtomicU64,
    variants_deduplicated: AtomicU64,
    evaluations_completed: AtomicU64,
    evaluations_failed: AtomicU64,
    fallbacks_used: AtomicU64,
    capability_retries: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub rounds_started: u64,
    pub rounds_completed: u64,
    pub rounds_failed: u64,
    pub variants_created: u64,
    pub variants_deduplicated: u64,
    pub evaluations_completed: u64,
    pub evaluations_failed: u64,
    pub fallbacks_used: u64,
    pub capability_retries: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            rounds_started: AtomicU64::new(0),
            rounds_completed: AtomicU64::new(0),
            rounds_failed: AtomicU64::new(0),
            variants_created: AtomicU64::new(0),
            variants_deduplicated: AtomicU64::new(0),
            evaluations_completed: AtomicU64::new(0),
            evaluations_failed: AtomicU64::new(0),
            fallbacks_used: AtomicU64::new(0),
            capability_retries: AtomicU64::new(0),
        }
    }

    counter!(inc_rounds_started, rounds_started);
    counter!(inc_rounds_completed, rounds_completed);
    counter!(inc_rounds_failed, rounds_failed);
    counter!(inc_variants_created, variants_created);
    counter!(inc_variants_deduplicated, variants_deduplicated);
    counter!(inc_evaluations_completed, evaluations_completed);
    counter!(inc_evaluations_failed, evaluations_failed);
    counter!(inc_fallbacks_used, fallbacks_used);
    counter!(inc_capability_retries, capability_retries);

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rounds_started: self.rounds_started.load(Ordering::Relaxed),
            rounds_completed: self.rounds_completed.load(Ordering::Relaxed),
            rounds_failed: self.rounds_failed.load(Ordering::Relaxed),
            variants_created: self.variants_created.load(Ordering::Relaxed),
            variants_deduplicated: self.variants_deduplicated.load(Ordering::Relaxed),
            evaluations_completed: self.evaluations_completed.load(Ordering::Relaxed),
            evaluations_failed: self.evaluations_failed.load(Ordering::Relaxed),
            fallbacks_used: self.fallbacks_used.load(Ordering::Relaxed),
            capability_retries: self.capability_retries.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a round, daemon shutdown)
    /// rather than on every increment.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            rounds_started = s.rounds_started,
            rounds_completed = s.rounds_completed,
            rounds_failed = s.rounds_failed,
            variants_created = s.variants_created,
            variants_deduplicated = s.variants_deduplicated,
            evaluations_completed = s.evaluations_completed,
            evaluations_failed = s.evaluations_failed,
            fallbacks_used = s.fallbacks_used,
            capability_retries = s.capability_retries,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.rounds_started,
            &self.rounds_completed,
            &self.rounds_failed,
            &self.variants_created,
            &self.variants_deduplicated,
            &self.evaluations_completed,
            &self.evaluations_failed,
            &self.fallbacks_used,
            &self.capability_retries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
