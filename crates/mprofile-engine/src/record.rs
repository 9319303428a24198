//! Allocation records and the per-context record store.
//!
//! Each execution context appends to its own [`ProfileStore`]; the only state
//! shared with other contexts is the session's atomic id counter, so the
//! recording path never waits on another thread.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::metrics::ProfilerMetrics;
use crate::session::{ContextId, SessionShared};
use crate::stack::{StackId, StackTable};

/// Wall-clock capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl Timestamp {
    #[must_use]
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: since_epoch.as_secs(),
            nanoseconds: since_epoch.subsec_nanos(),
        }
    }
}

/// Which allocator entry point produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    #[serde(rename = "allocated")]
    Allocate,
    #[serde(rename = "free")]
    Free,
    #[serde(rename = "realloc")]
    Reallocate,
}

impl RecordKind {
    /// Report spelling of the kind.
    #[must_use]
    pub const fn state(self) -> &'static str {
        match self {
            Self::Allocate => "allocated",
            Self::Free => "free",
            Self::Reallocate => "realloc",
        }
    }
}

/// One observed allocator event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    /// Session-wide monotonic id; defines the total order of events.
    pub id: u64,
    /// Block affected (the new block for reallocations). 0 is null.
    pub address: usize,
    /// Block being replaced by a reallocation.
    pub reallocated_from: Option<usize>,
    pub kind: RecordKind,
    /// Absolute size requested (allocate/realloc) or released (free).
    pub size: usize,
    /// Bytes gained (positive) or released (negative).
    pub size_delta: i64,
    pub stack_id: Option<StackId>,
    /// Previous record of the same logical block. Set by the chain builder.
    pub prev_id: Option<u64>,
    /// Next record of the same logical block. Set by the chain builder.
    pub next_id: Option<u64>,
    pub timestamp: Timestamp,
}

impl AllocationRecord {
    /// Allocate records with a null address: the allocator returned nothing.
    #[must_use]
    pub fn is_alloc_failure(&self) -> bool {
        self.kind == RecordKind::Allocate && self.address == 0
    }

    /// Reallocate records that asked for bytes and got a null block back.
    #[must_use]
    pub fn is_realloc_failure(&self) -> bool {
        self.kind == RecordKind::Reallocate && self.address == 0 && self.size > 0
    }
}

/// Signed difference `new - old`, saturating at the `i64` range.
#[must_use]
pub fn signed_delta(new: usize, old: usize) -> i64 {
    let new = i128::try_from(new).unwrap_or(i128::MAX);
    let old = i128::try_from(old).unwrap_or(i128::MAX);
    i64::try_from(new - old).unwrap_or(if new > old { i64::MAX } else { i64::MIN })
}

/// Append-only log of records for one execution context, plus its stack table.
#[derive(Debug)]
pub struct ProfileStore {
    context: ContextId,
    records: Vec<AllocationRecord>,
    stacks: StackTable,
    shared: Arc<SessionShared>,
    closed: bool,
}

impl ProfileStore {
    pub(crate) fn new(context: ContextId, shared: Arc<SessionShared>) -> Self {
        let stacks = StackTable::with_depth_limit(context, shared.stack_depth);
        Self {
            context,
            records: Vec::new(),
            stacks,
            shared,
            closed: false,
        }
    }

    #[must_use]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Records in insertion (chronological) order.
    #[must_use]
    pub fn records(&self) -> &[AllocationRecord] {
        &self.records
    }

    #[must_use]
    pub fn stacks(&self) -> &StackTable {
        &self.stacks
    }

    /// Whether the store has been drained by a merge.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Record an allocation of `size` bytes at `address` (0 on failure).
    /// Returns whether the record was stored.
    pub fn record_allocate(&mut self, address: usize, size: usize, frames: Option<&[u64]>) -> bool {
        let delta = if address == 0 { 0 } else { signed_delta(size, 0) };
        self.append(RecordKind::Allocate, address, None, size, delta, frames)
    }

    /// Record the release of a `size`-byte block at `address`.
    pub fn record_free(&mut self, address: usize, size: usize, frames: Option<&[u64]>) -> bool {
        let delta = if address == 0 { 0 } else { signed_delta(0, size) };
        self.append(RecordKind::Free, address, None, size, delta, frames)
    }

    /// Record a reallocation of the `old_size`-byte block at `old_address`
    /// into `new_size` bytes at `address`.
    ///
    /// A null `old_address` means the call behaved as an allocation; a null
    /// `address` with a non-zero `new_size` is a failed reallocation and
    /// carries no delta.
    pub fn record_reallocate(
        &mut self,
        address: usize,
        new_size: usize,
        old_size: usize,
        old_address: usize,
        frames: Option<&[u64]>,
    ) -> bool {
        let from = (old_address != 0).then_some(old_address);
        let old_size = if from.is_some() { old_size } else { 0 };
        let delta = if address == 0 && new_size > 0 {
            0
        } else {
            signed_delta(new_size, old_size)
        };
        self.append(RecordKind::Reallocate, address, from, new_size, delta, frames)
    }

    /// Move the log and stack table out, leaving the store closed.
    pub(crate) fn take_contents(&mut self) -> (Vec<AllocationRecord>, StackTable) {
        self.closed = true;
        let fresh = StackTable::with_depth_limit(self.context, self.stacks.depth_limit());
        (
            std::mem::take(&mut self.records),
            std::mem::replace(&mut self.stacks, fresh),
        )
    }

    fn append(
        &mut self,
        kind: RecordKind,
        address: usize,
        reallocated_from: Option<usize>,
        size: usize,
        size_delta: i64,
        frames: Option<&[u64]>,
    ) -> bool {
        let metrics = &self.shared.metrics;
        if self.closed || self.records.try_reserve(1).is_err() {
            ProfilerMetrics::inc(&metrics.events_dropped);
            return false;
        }

        let stack_id = frames.and_then(|frames| {
            let before = self.stacks.len();
            if frames.len() > self.stacks.depth_limit() {
                ProfilerMetrics::inc(&metrics.stacks_truncated);
            }
            let id = self.stacks.find_or_insert(frames).map(|s| s.id());
            if self.stacks.len() > before {
                ProfilerMetrics::inc(&metrics.stacks_interned);
            }
            id
        });

        // Relaxed is enough: the RMW modification order alone makes ids unique
        // and totally ordered.
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.records.push(AllocationRecord {
            id,
            address,
            reallocated_from,
            kind,
            size,
            size_delta,
            stack_id,
            prev_id: None,
            next_id: None,
            timestamp: Timestamp::now(),
        });
        ProfilerMetrics::inc(&metrics.events_recorded);
        true
    }
}
