//! Profiling session: id counter, store registry and the end-of-life merge.
//!
//! A [`ProfileSession`] hands out one [`ContextHandle`] per execution context.
//! Each handle owns a private [`ProfileStore`]; the session keeps a registry of
//! all stores so they can be drained at shutdown. The registry mutex is taken
//! when a context registers and when the merge runs, never per allocation.
//!
//! [`ProfileSession::merge_all`] is a one-shot operation for the end of the
//! process. Recording contexts must be quiescent when it runs; events that
//! arrive at a drained store afterwards are dropped and counted.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::ProfilerConfig;
use crate::diag::{self, DiagEntry, DiagLevel};
use crate::metrics::{MetricsSnapshot, ProfilerMetrics};
use crate::record::{AllocationRecord, ProfileStore, Timestamp};
use crate::stack::{MAX_STACK_DEPTH, StackMerger, StackTable};

/// Identifier of an execution context within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(u64);

impl ContextId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// State every store of a session shares.
#[derive(Debug)]
pub(crate) struct SessionShared {
    pub(crate) next_id: AtomicU64,
    pub(crate) metrics: ProfilerMetrics,
    pub(crate) stack_depth: usize,
}

type SharedStore = Arc<Mutex<ProfileStore>>;

/// Handle through which one execution context records its events.
///
/// The store behind the handle is only ever locked by its own context until
/// the merge drains it, so the lock is uncontended on the recording path.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    context: ContextId,
    store: SharedStore,
}

impl ContextHandle {
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Returns whether the record was stored; a dropped event leaves a gap
    /// in the log.
    pub fn record_allocate(&self, address: usize, size: usize, frames: Option<&[u64]>) -> bool {
        self.store.lock().record_allocate(address, size, frames)
    }

    pub fn record_free(&self, address: usize, size: usize, frames: Option<&[u64]>) -> bool {
        self.store.lock().record_free(address, size, frames)
    }

    pub fn record_reallocate(
        &self,
        address: usize,
        new_size: usize,
        old_size: usize,
        old_address: usize,
        frames: Option<&[u64]>,
    ) -> bool {
        self.store
            .lock()
            .record_reallocate(address, new_size, old_size, old_address, frames)
    }

    /// Run `f` with exclusive access to the underlying store.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut ProfileStore) -> R) -> R {
        f(&mut self.store.lock())
    }
}

/// The single store produced by merging every context of a session.
#[derive(Debug)]
pub struct MasterStore {
    started: Timestamp,
    records: Vec<AllocationRecord>,
    stacks: StackTable,
    metrics: MetricsSnapshot,
}

impl MasterStore {
    /// Assemble a master store from parts. Records must be in ascending id order.
    #[must_use]
    pub fn from_parts(
        started: Timestamp,
        records: Vec<AllocationRecord>,
        stacks: StackTable,
        metrics: MetricsSnapshot,
    ) -> Self {
        debug_assert!(records.windows(2).all(|w| w[0].id < w[1].id));
        Self {
            started,
            records,
            stacks,
            metrics,
        }
    }

    /// When the session started.
    #[must_use]
    pub fn started(&self) -> Timestamp {
        self.started
    }

    /// Every record of the session in ascending id order.
    #[must_use]
    pub fn records(&self) -> &[AllocationRecord] {
        &self.records
    }

    pub(crate) fn records_mut(&mut self) -> &mut [AllocationRecord] {
        &mut self.records
    }

    /// The global stack table.
    #[must_use]
    pub fn stacks(&self) -> &StackTable {
        &self.stacks
    }

    /// Session counters as they stood when the merge finished.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
    }

    /// Find a record by id.
    #[must_use]
    pub fn record(&self, id: u64) -> Option<&AllocationRecord> {
        self.records
            .binary_search_by_key(&id, |r| r.id)
            .ok()
            .and_then(|idx| self.records.get(idx))
    }
}

/// One collection session: shared id counter plus the store registry.
#[derive(Debug)]
pub struct ProfileSession {
    shared: Arc<SessionShared>,
    registry: Mutex<Vec<SharedStore>>,
    next_context: AtomicU64,
    started: Timestamp,
}

impl ProfileSession {
    /// Create a session keeping up to [`MAX_STACK_DEPTH`] frames per capture.
    #[must_use]
    pub fn new() -> Self {
        Self::with_stack_depth(MAX_STACK_DEPTH)
    }

    /// Create a session from the profiler configuration.
    #[must_use]
    pub fn from_config(config: &ProfilerConfig) -> Self {
        Self::with_stack_depth(config.stack_depth)
    }

    #[must_use]
    pub fn with_stack_depth(stack_depth: usize) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                next_id: AtomicU64::new(1),
                metrics: ProfilerMetrics::new(),
                stack_depth: stack_depth.clamp(1, MAX_STACK_DEPTH),
            }),
            registry: Mutex::new(Vec::new()),
            next_context: AtomicU64::new(1),
            started: Timestamp::now(),
        }
    }

    #[must_use]
    pub fn started(&self) -> Timestamp {
        self.started
    }

    #[must_use]
    pub fn metrics(&self) -> &ProfilerMetrics {
        &self.shared.metrics
    }

    /// Create a store for a new execution context and add it to the registry.
    pub fn register_context(&self) -> ContextHandle {
        let context = ContextId::new(self.next_context.fetch_add(1, Ordering::Relaxed));
        let store = Arc::new(Mutex::new(ProfileStore::new(
            context,
            Arc::clone(&self.shared),
        )));
        self.registry.lock().push(Arc::clone(&store));
        ProfilerMetrics::inc(&self.shared.metrics.contexts_registered);
        diag::emit_with(DiagLevel::Debug, || {
            DiagEntry::new(DiagLevel::Debug, "context_registered").with_context(context)
        });
        ContextHandle { context, store }
    }

    /// Drain every registered store into one id-ordered master store.
    ///
    /// The first registered store keeps its stack table as the global table;
    /// every other table is merged into it and the drained records' stack ids
    /// are rewritten to global ids. The resulting log depends only on record
    /// ids, not on the order stores were drained.
    pub fn merge_all(&self) -> MasterStore {
        let stores = std::mem::take(&mut *self.registry.lock());
        let store_count = stores.len();
        let mut stores = stores.into_iter();

        let Some(first) = stores.next() else {
            return self.empty_master();
        };
        let (master_records, mut global) = first.lock().take_contents();

        let mut by_id: BTreeMap<u64, AllocationRecord> = BTreeMap::new();
        by_id.extend(master_records.into_iter().map(|r| (r.id, r)));

        for store in stores {
            let (records, local) = store.lock().take_contents();
            let mut merger = StackMerger::new(&mut global, &local);
            for mut record in records {
                record.stack_id = record.stack_id.and_then(|id| merger.merge_into(id));
                let previous = by_id.insert(record.id, record);
                debug_assert!(previous.is_none(), "record ids are unique");
            }
        }

        let records: Vec<AllocationRecord> = by_id.into_values().collect();
        diag::emit_with(DiagLevel::Info, || {
            DiagEntry::new(DiagLevel::Info, "merge_complete").with_details(serde_json::json!({
                "contexts": store_count,
                "records": records.len(),
                "stacks": global.len(),
            }))
        });
        MasterStore::from_parts(
            self.started,
            records,
            global,
            self.shared.metrics.snapshot(),
        )
    }

    fn empty_master(&self) -> MasterStore {
        MasterStore::from_parts(
            self.started,
            Vec::new(),
            StackTable::with_depth_limit(ContextId::new(0), self.shared.stack_depth),
            self.shared.metrics.snapshot(),
        )
    }
}

impl Default for ProfileSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackId;

    #[test]
    fn contexts_get_distinct_ids() {
        let session = ProfileSession::new();
        let a = session.register_context();
        let b = session.register_context();
        assert_ne!(a.context(), b.context());
        assert_eq!(session.metrics().snapshot().contexts_registered, 2);
    }

    #[test]
    fn merge_interleaves_by_id() {
        let session = ProfileSession::new();
        let c1 = session.register_context();
        let c2 = session.register_context();
        c1.record_allocate(0x10, 1, None); // 1
        c2.record_allocate(0x20, 1, None); // 2
        c1.record_allocate(0x30, 1, None); // 3
        c2.record_allocate(0x40, 1, None); // 4
        c1.record_allocate(0x50, 1, None); // 5

        let master = session.merge_all();
        let ids: Vec<u64> = master.records().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        let addrs: Vec<usize> = master.records().iter().map(|r| r.address).collect();
        assert_eq!(addrs, vec![0x10, 0x20, 0x30, 0x40, 0x50]);
    }

    #[test]
    fn merge_rewrites_stack_ids_to_global_table() {
        let session = ProfileSession::new();
        let c1 = session.register_context();
        let c2 = session.register_context();
        c1.record_allocate(0x10, 1, Some(&[1, 2, 3]));
        c2.record_allocate(0x20, 1, Some(&[7, 8]));
        c2.record_allocate(0x30, 1, Some(&[1, 2, 3]));

        let master = session.merge_all();
        let stacks = master.stacks();
        assert_eq!(stacks.len(), 2);

        let r = master.records();
        assert_eq!(r[0].stack_id, r[2].stack_id);
        let shared = stacks.get(r[0].stack_id.unwrap()).unwrap();
        assert_eq!(shared.frames(), &[1, 2, 3]);
        assert_eq!(shared.occurrence_count(), 2);
        let other = stacks.get(r[1].stack_id.unwrap()).unwrap();
        assert_eq!(other.frames(), &[7, 8]);
        assert_eq!(other.owning_context(), c2.context());
    }

    #[test]
    fn drained_store_drops_late_events() {
        let session = ProfileSession::new();
        let ctx = session.register_context();
        ctx.record_allocate(0x10, 1, None);
        let master = session.merge_all();
        assert_eq!(master.records().len(), 1);

        ctx.record_allocate(0x20, 1, None);
        assert!(ctx.with_store(|s| s.is_closed()));
        assert_eq!(session.metrics().snapshot().events_dropped, 1);
    }

    #[test]
    fn merging_an_empty_session() {
        let session = ProfileSession::new();
        let master = session.merge_all();
        assert!(master.records().is_empty());
        assert!(master.stacks().is_empty());
    }

    #[test]
    fn record_lookup_by_id() {
        let session = ProfileSession::new();
        let ctx = session.register_context();
        ctx.record_allocate(0x10, 16, Some(&[5]));
        ctx.record_free(0x10, 16, None);
        let master = session.merge_all();
        assert_eq!(master.record(2).map(|r| r.address), Some(0x10));
        assert!(master.record(3).is_none());
        assert_eq!(
            master.record(1).and_then(|r| r.stack_id),
            StackId::new(1)
        );
    }
}
