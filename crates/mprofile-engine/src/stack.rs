//! Call-stack interning.
//!
//! A [`StackTable`] canonicalizes captured frame sequences: two captures with
//! the same frames (same depth, same addresses, same order) share one
//! [`Stack`] entry and one table-scoped [`StackId`]. Entries are ordered
//! depth-first (shorter stacks sort before longer ones), then frame by frame.
//!
//! Ids are assigned sequentially from 1 in insertion order. Id 0 is never
//! handed out; it means "no stack captured" wherever ids are serialized.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::session::ContextId;

/// Maximum number of frames kept per capture. Deeper captures are truncated.
pub const MAX_STACK_DEPTH: usize = 64;

/// Table-scoped identifier of an interned stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackId(NonZeroU32);

impl StackId {
    /// Build an id from its raw value; 0 yields `None`.
    #[must_use]
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// The raw numeric id (never 0).
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }

    /// Raw value for an optional id, 0 when absent.
    #[must_use]
    pub fn raw(id: Option<Self>) -> u32 {
        id.map_or(0, Self::get)
    }
}

/// An immutable frame sequence with the interner's ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Frames(Arc<[u64]>);

impl Frames {
    /// The return addresses, outermost capture order preserved.
    #[must_use]
    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    /// Number of frames.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl Ord for Frames {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.iter().cmp(other.0.iter()))
    }
}

impl PartialOrd for Frames {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Canonical interned call stack.
#[derive(Debug, Clone)]
pub struct Stack {
    id: StackId,
    frames: Frames,
    occurrence_count: u64,
    owning_context: ContextId,
}

impl Stack {
    #[must_use]
    pub fn id(&self) -> StackId {
        self.id
    }

    #[must_use]
    pub fn frames(&self) -> &[u64] {
        self.frames.as_slice()
    }

    /// Number of records that referenced this exact frame sequence.
    #[must_use]
    pub fn occurrence_count(&self) -> u64 {
        self.occurrence_count
    }

    /// Context that first captured this stack. Informational only.
    #[must_use]
    pub fn owning_context(&self) -> ContextId {
        self.owning_context
    }
}

/// Ordered set of interned stacks keyed by structural frame comparison.
#[derive(Debug)]
pub struct StackTable {
    by_frames: BTreeMap<Frames, Stack>,
    by_id: Vec<Frames>,
    owner: ContextId,
    depth_limit: usize,
}

impl StackTable {
    /// Create an empty table owned by `owner`, keeping at most
    /// [`MAX_STACK_DEPTH`] frames per capture.
    #[must_use]
    pub fn new(owner: ContextId) -> Self {
        Self::with_depth_limit(owner, MAX_STACK_DEPTH)
    }

    /// Create an empty table with a custom depth limit (clamped to
    /// `1..=MAX_STACK_DEPTH`).
    #[must_use]
    pub fn with_depth_limit(owner: ContextId, depth_limit: usize) -> Self {
        Self {
            by_frames: BTreeMap::new(),
            by_id: Vec::new(),
            owner,
            depth_limit: depth_limit.clamp(1, MAX_STACK_DEPTH),
        }
    }

    /// Frames kept per capture.
    #[must_use]
    pub fn depth_limit(&self) -> usize {
        self.depth_limit
    }

    /// Number of distinct stacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Return the canonical stack for `frames`, bumping its occurrence count,
    /// or create it with the next free id.
    ///
    /// Frames past the depth limit are dropped silently. Returns `None` when
    /// the capture is empty or the table cannot grow.
    pub fn find_or_insert(&mut self, frames: &[u64]) -> Option<&Stack> {
        let owner = self.owner;
        self.intern(frames, 1, owner)
    }

    /// Look up a stack by its id in this table.
    #[must_use]
    pub fn get(&self, id: StackId) -> Option<&Stack> {
        let key = self.by_id.get(usize::try_from(id.get()).ok()?.checked_sub(1)?)?;
        self.by_frames.get(key)
    }

    /// Stacks in table order (depth, then frames). Each call starts over.
    pub fn iter(&self) -> impl Iterator<Item = &Stack> + '_ {
        self.by_frames.values()
    }

    fn intern(&mut self, frames: &[u64], count: u64, owner: ContextId) -> Option<&Stack> {
        let frames = &frames[..frames.len().min(self.depth_limit)];
        if frames.is_empty() {
            return None;
        }

        let key = Frames(Arc::from(frames));
        if self.by_frames.contains_key(&key) {
            let stack = self.by_frames.get_mut(&key)?;
            stack.occurrence_count = stack.occurrence_count.saturating_add(count);
            return Some(stack);
        }

        self.by_id.try_reserve(1).ok()?;
        let raw = u32::try_from(self.by_id.len().checked_add(1)?).ok()?;
        let id = StackId::new(raw)?;
        self.by_id.push(key.clone());
        let stack = Stack {
            id,
            frames: key.clone(),
            occurrence_count: count,
            owning_context: owner,
        };
        Some(self.by_frames.entry(key).or_insert(stack))
    }
}

/// One merge pass of a context-local table into the global table.
///
/// Results are cached by local id, so records that share a stack cost one
/// structural lookup in the global table.
#[derive(Debug)]
pub struct StackMerger<'a> {
    global: &'a mut StackTable,
    local: &'a StackTable,
    cache: HashMap<StackId, Option<StackId>>,
}

impl<'a> StackMerger<'a> {
    #[must_use]
    pub fn new(global: &'a mut StackTable, local: &'a StackTable) -> Self {
        Self {
            global,
            local,
            cache: HashMap::new(),
        }
    }

    /// Map a local stack id to its id in the global table.
    ///
    /// The first call for a given local id folds the local occurrence count
    /// into the global entry; repeated calls return the cached id.
    pub fn merge_into(&mut self, local_id: StackId) -> Option<StackId> {
        if let Some(&cached) = self.cache.get(&local_id) {
            return cached;
        }
        let merged = self.local.get(local_id).and_then(|stack| {
            self.global
                .intern(
                    stack.frames(),
                    stack.occurrence_count,
                    stack.owning_context,
                )
                .map(Stack::id)
        });
        self.cache.insert(local_id, merged);
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StackTable {
        StackTable::new(ContextId::new(1))
    }

    #[test]
    fn interning_same_frames_is_idempotent() {
        let mut t = table();
        let frames = [0x10, 0x20, 0x30];
        let first = t.find_or_insert(&frames).expect("insert").id();
        for _ in 0..9 {
            let again = t.find_or_insert(&frames).expect("hit").id();
            assert_eq!(again, first);
        }
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(first).unwrap().occurrence_count(), 10);
    }

    #[test]
    fn ids_start_at_one_and_are_sequential() {
        let mut t = table();
        let a = t.find_or_insert(&[1, 2]).unwrap().id();
        let b = t.find_or_insert(&[3]).unwrap().id();
        let c = t.find_or_insert(&[1, 2, 3]).unwrap().id();
        assert_eq!((a.get(), b.get(), c.get()), (1, 2, 3));
    }

    #[test]
    fn iteration_is_depth_first_then_lexicographic() {
        let mut t = table();
        t.find_or_insert(&[9, 9, 9]);
        t.find_or_insert(&[5, 1]);
        t.find_or_insert(&[7]);
        t.find_or_insert(&[5, 0]);
        let order: Vec<Vec<u64>> = t.iter().map(|s| s.frames().to_vec()).collect();
        assert_eq!(order, vec![vec![7], vec![5, 0], vec![5, 1], vec![9, 9, 9]]);
        // Restartable.
        assert_eq!(t.iter().count(), 4);
    }

    #[test]
    fn prefix_is_a_distinct_stack() {
        let mut t = table();
        let short = t.find_or_insert(&[1, 2]).unwrap().id();
        let long = t.find_or_insert(&[1, 2, 3]).unwrap().id();
        assert_ne!(short, long);
    }

    #[test]
    fn deep_captures_are_truncated() {
        let mut t = StackTable::with_depth_limit(ContextId::new(1), 4);
        let deep: Vec<u64> = (0..10).collect();
        let id = t.find_or_insert(&deep).unwrap().id();
        assert_eq!(t.get(id).unwrap().frames(), &[0, 1, 2, 3]);
        // Same prefix, different tail: same canonical entry after truncation.
        let other: Vec<u64> = (0..4).chain(100..110).collect();
        assert_eq!(t.find_or_insert(&other).unwrap().id(), id);
    }

    #[test]
    fn empty_capture_is_not_interned() {
        let mut t = table();
        assert!(t.find_or_insert(&[]).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn unknown_and_zero_ids() {
        let t = table();
        assert!(StackId::new(0).is_none());
        assert!(t.get(StackId::new(7).unwrap()).is_none());
        assert_eq!(StackId::raw(None), 0);
    }

    #[test]
    fn merge_folds_counts_and_caches() {
        let mut global = table();
        global.find_or_insert(&[1, 2, 3]);

        let mut local = StackTable::new(ContextId::new(2));
        local.find_or_insert(&[4, 5]);
        local.find_or_insert(&[4, 5]);
        let shared = local.find_or_insert(&[1, 2, 3]).unwrap().id();
        let fresh = local.find_or_insert(&[4, 5]).unwrap().id();

        let mut merger = StackMerger::new(&mut global, &local);
        let g_fresh = merger.merge_into(fresh).unwrap();
        assert_eq!(merger.merge_into(fresh), Some(g_fresh));
        let g_shared = merger.merge_into(shared).unwrap();

        assert_eq!(g_shared.get(), 1);
        assert_eq!(g_fresh.get(), 2);
        assert_eq!(global.get(g_shared).unwrap().occurrence_count(), 2);
        assert_eq!(global.get(g_fresh).unwrap().occurrence_count(), 3);
        assert_eq!(global.get(g_fresh).unwrap().owning_context(), ContextId::new(2));
        assert_eq!(global.len(), 2);
    }
}
