//! Allocation chain reconstruction.
//!
//! Walks the merged log in id order and links every record to the record
//! that later frees or reallocates the same block, filling in `prev_id` and
//! `next_id`. Blocks still open at the end of the walk are leaks; their last
//! record keeps `next_id == None`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{AllocationRecord, RecordKind};
use crate::session::MasterStore;

/// Data-consistency violations found while linking. Each one means the log
/// cannot describe a real heap, so callers treat them as fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error(
        "double allocation of {address:#x} by record {record_id} (block still open from record {open_id})"
    )]
    DoubleAllocation {
        address: usize,
        record_id: u64,
        open_id: u64,
    },
    #[error("{} of unknown address {address:#x} by record {record_id}", .operation.state())]
    UnknownAddress {
        address: usize,
        record_id: u64,
        operation: RecordKind,
    },
}

impl ChainError {
    /// Address the violation is about.
    #[must_use]
    pub fn address(&self) -> usize {
        match self {
            Self::DoubleAllocation { address, .. } | Self::UnknownAddress { address, .. } => {
                *address
            }
        }
    }

    /// Record at which the walk stopped.
    #[must_use]
    pub fn record_id(&self) -> u64 {
        match self {
            Self::DoubleAllocation { record_id, .. } | Self::UnknownAddress { record_id, .. } => {
                *record_id
            }
        }
    }
}

/// Outcome of a successful linking pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSummary {
    /// Number of prev/next links created.
    pub links: u64,
    /// Ids of the last record of every block never closed, ascending.
    pub leaked: Vec<u64>,
    /// Bytes still held by leaked blocks.
    pub leaked_bytes: u64,
    pub alloc_failures: u64,
    pub realloc_failures: u64,
    /// `free(NULL)` calls.
    pub null_frees: u64,
    /// Inconsistencies skipped because the log is known to miss events.
    #[serde(default)]
    pub gaps: u64,
}

/// Link the records of a merged master store.
///
/// When the session dropped events, a missing allocation or release is an
/// expected gap rather than a violation, and the walk tolerates it.
pub fn build_chains(master: &mut MasterStore) -> Result<ChainSummary, ChainError> {
    if master.metrics().events_dropped > 0 {
        return Ok(link_records_with_gaps(master.records_mut()));
    }
    link_records(master.records_mut())
}

/// Link `records`, which must be sorted by ascending id.
pub fn link_records(records: &mut [AllocationRecord]) -> Result<ChainSummary, ChainError> {
    Linker::new(false).run(records)
}

/// Link `records` from a log with dropped events. Inconsistencies are
/// counted in [`ChainSummary::gaps`] instead of failing the walk: a block
/// whose release is missing is forgotten when its address is handed out
/// again, and a release of a block whose allocation is missing stays
/// unlinked.
pub fn link_records_with_gaps(records: &mut [AllocationRecord]) -> ChainSummary {
    let mut linker = Linker::new(true);
    // A lenient walk has no failure path.
    let _ = linker.walk(records);
    linker.finish(records)
}

struct Linker {
    lenient: bool,
    summary: ChainSummary,
    // address -> index of the record that currently owns the block
    open: BTreeMap<usize, usize>,
}

impl Linker {
    fn new(lenient: bool) -> Self {
        Self {
            lenient,
            summary: ChainSummary::default(),
            open: BTreeMap::new(),
        }
    }

    fn run(mut self, records: &mut [AllocationRecord]) -> Result<ChainSummary, ChainError> {
        self.walk(records)?;
        Ok(self.finish(records))
    }

    fn walk(&mut self, records: &mut [AllocationRecord]) -> Result<(), ChainError> {
        debug_assert!(records.windows(2).all(|w| w[0].id < w[1].id));

        for idx in 0..records.len() {
            let record = &records[idx];
            match record.kind {
                RecordKind::Allocate => {
                    if record.address == 0 {
                        self.summary.alloc_failures += 1;
                        continue;
                    }
                    self.open_block(records, idx)?;
                }
                RecordKind::Free => {
                    if record.address == 0 {
                        self.summary.null_frees += 1;
                        continue;
                    }
                    let address = record.address;
                    if let Some(prev) = self.close_block(records, address, idx)? {
                        self.link(records, prev, idx);
                    }
                }
                RecordKind::Reallocate => {
                    if record.is_realloc_failure() {
                        // The source block is untouched by a failed reallocation.
                        self.summary.realloc_failures += 1;
                        continue;
                    }
                    let opens_block = record.address != 0 && record.size > 0;
                    if let Some(from) = record.reallocated_from {
                        if let Some(prev) = self.close_block(records, from, idx)? {
                            self.link(records, prev, idx);
                        }
                    }
                    if opens_block {
                        self.open_block(records, idx)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self, records: &[AllocationRecord]) -> ChainSummary {
        let mut leaked: Vec<usize> = std::mem::take(&mut self.open).into_values().collect();
        leaked.sort_unstable();
        let mut summary = std::mem::take(&mut self.summary);
        summary.leaked_bytes = leaked
            .iter()
            .map(|&idx| records[idx].size as u64)
            .fold(0u64, u64::saturating_add);
        summary.leaked = leaked.into_iter().map(|idx| records[idx].id).collect();
        summary
    }

    fn open_block(&mut self, records: &[AllocationRecord], idx: usize) -> Result<(), ChainError> {
        let record = &records[idx];
        if let Some(&owner) = self.open.get(&record.address) {
            if !self.lenient {
                return Err(ChainError::DoubleAllocation {
                    address: record.address,
                    record_id: record.id,
                    open_id: records[owner].id,
                });
            }
            self.summary.gaps += 1;
        }
        self.open.insert(record.address, idx);
        Ok(())
    }

    fn close_block(
        &mut self,
        records: &[AllocationRecord],
        address: usize,
        idx: usize,
    ) -> Result<Option<usize>, ChainError> {
        match self.open.remove(&address) {
            Some(prev) => Ok(Some(prev)),
            None if self.lenient => {
                self.summary.gaps += 1;
                Ok(None)
            }
            None => Err(ChainError::UnknownAddress {
                address,
                record_id: records[idx].id,
                operation: records[idx].kind,
            }),
        }
    }

    fn link(&mut self, records: &mut [AllocationRecord], prev: usize, next: usize) {
        link(records, prev, next);
        self.summary.links += 1;
    }
}

fn link(records: &mut [AllocationRecord], prev: usize, next: usize) {
    let (prev_id, next_id) = (records[prev].id, records[next].id);
    debug_assert!(records[prev].next_id.is_none());
    debug_assert!(records[next].prev_id.is_none());
    records[prev].next_id = Some(next_id);
    records[next].prev_id = Some(prev_id);
}
