//! Atomic counters for profiler observability.
//!
//! All counters use relaxed ordering; they are advisory, not synchronization
//! primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Per-session operation counters.
#[derive(Debug)]
pub struct ProfilerMetrics {
    /// Events appended to a store.
    pub events_recorded: AtomicU64,
    /// Events lost because the store could not grow or was already drained.
    pub events_dropped: AtomicU64,
    /// Distinct stacks created in context-local tables.
    pub stacks_interned: AtomicU64,
    /// Captures deeper than the configured limit.
    pub stacks_truncated: AtomicU64,
    /// Execution contexts registered with the session.
    pub contexts_registered: AtomicU64,
    /// Memory headers validated on free/realloc.
    pub header_checks: AtomicU64,
    /// Memory headers that failed validation.
    pub header_failures: AtomicU64,
}

impl ProfilerMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            events_recorded: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            stacks_interned: AtomicU64::new(0),
            stacks_truncated: AtomicU64::new(0),
            contexts_registered: AtomicU64::new(0),
            header_checks: AtomicU64::new(0),
            header_failures: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_recorded: Self::get(&self.events_recorded),
            events_dropped: Self::get(&self.events_dropped),
            stacks_interned: Self::get(&self.stacks_interned),
            stacks_truncated: Self::get(&self.stacks_truncated),
            contexts_registered: Self::get(&self.contexts_registered),
            header_checks: Self::get(&self.header_checks),
            header_failures: Self::get(&self.header_failures),
        }
    }
}

impl Default for ProfilerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_recorded: u64,
    pub events_dropped: u64,
    pub stacks_interned: u64,
    pub stacks_truncated: u64,
    pub contexts_registered: u64,
    pub header_checks: u64,
    pub header_failures: u64,
}
