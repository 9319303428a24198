//! Deterministic alloc/free/realloc sequences spread over several contexts,
//! checking the chain invariants on the merged log.

use std::collections::{BTreeMap, BTreeSet};

use mprofile_engine::{AllocationRecord, ProfileSession, RecordKind, build_chains};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    address: usize,
    size: usize,
    generation: usize,
}

fn slot_address(idx: usize, generation: usize) -> usize {
    0x1000_0000 + idx * 0x1_0000 + (generation % 16) * 0x100
}

fn check_links(records: &[AllocationRecord]) {
    let by_id: BTreeMap<u64, &AllocationRecord> = records.iter().map(|r| (r.id, r)).collect();
    for r in records {
        if let Some(next) = r.next_id {
            assert!(next > r.id, "record {}: next {next} must come later", r.id);
            assert_eq!(by_id[&next].prev_id, Some(r.id), "link symmetry at {}", r.id);
        }
        if let Some(prev) = r.prev_id {
            assert!(prev < r.id, "record {}: prev {prev} must come earlier", r.id);
            assert_eq!(by_id[&prev].next_id, Some(r.id), "link symmetry at {}", r.id);
        }
        if r.kind == RecordKind::Free {
            assert_eq!(r.next_id, None, "a free ends its chain");
            if r.address != 0 {
                assert!(r.prev_id.is_some(), "free {} must close a block", r.id);
            }
        }
        if r.kind == RecordKind::Allocate {
            assert_eq!(r.prev_id, None, "an allocation starts its chain");
        }
    }
}

#[test]
fn deterministic_sequences_hold_chain_invariants() {
    const SEEDS: [u64; 4] = [1, 2, 3, 4];
    const STEPS: usize = 3_000;
    const SLOTS: usize = 48;
    const CONTEXTS: usize = 4;

    for seed in SEEDS {
        let session = ProfileSession::new();
        let contexts: Vec<_> = (0..CONTEXTS).map(|_| session.register_context()).collect();
        let mut rng = XorShift64::new(seed);
        let mut slots: [Option<Slot>; SLOTS] = [None; SLOTS];
        let mut generations = [0usize; SLOTS];
        let mut expected_failures = 0u64;

        for _ in 0..STEPS {
            let op = rng.gen_range_usize(0, 99);
            let idx = rng.gen_range_usize(0, SLOTS - 1);
            let ctx = &contexts[rng.gen_range_usize(0, CONTEXTS - 1)];
            let frames = [0x400_000 + rng.gen_range_usize(0, 7) as u64, 0x400_100];

            match (op, slots[idx]) {
                (0..=39, None) => {
                    generations[idx] += 1;
                    let address = slot_address(idx, generations[idx]);
                    let size = rng.gen_range_usize(1, 4096);
                    ctx.record_allocate(address, size, Some(&frames));
                    slots[idx] = Some(Slot {
                        address,
                        size,
                        generation: generations[idx],
                    });
                }
                (0..=39, Some(_)) | (40..=64, None) => {}
                (40..=64, Some(slot)) => {
                    ctx.record_free(slot.address, slot.size, Some(&frames));
                    slots[idx] = None;
                }
                (65..=94, Some(slot)) => {
                    let moves = rng.gen_range_usize(0, 1) == 1;
                    let generation = if moves { slot.generation + 1 } else { slot.generation };
                    generations[idx] = generations[idx].max(generation);
                    let address = slot_address(idx, generation);
                    let size = rng.gen_range_usize(1, 8192);
                    ctx.record_reallocate(address, size, slot.size, slot.address, None);
                    slots[idx] = Some(Slot {
                        address,
                        size,
                        generation,
                    });
                }
                (65..=94, None) => {
                    // Failed allocation: no block opens.
                    ctx.record_allocate(0, usize::MAX / 2, None);
                    expected_failures += 1;
                }
                _ => {
                    ctx.record_free(0, 0, None);
                }
            }
        }

        let mut master = session.merge_all();
        let summary = build_chains(&mut master)
            .unwrap_or_else(|e| panic!("seed={seed}: chain violation {e}"));
        check_links(master.records());

        assert_eq!(summary.alloc_failures, expected_failures, "seed={seed}");

        let live: BTreeSet<usize> = slots.iter().flatten().map(|s| s.address).collect();
        let leaked: BTreeSet<usize> = summary
            .leaked
            .iter()
            .map(|&id| master.record(id).unwrap().address)
            .collect();
        assert_eq!(leaked, live, "seed={seed}: leak set must match live slots");

        let live_bytes: u64 = slots.iter().flatten().map(|s| s.size as u64).sum();
        assert_eq!(summary.leaked_bytes, live_bytes, "seed={seed}");

        let net: i64 = master.records().iter().map(|r| r.size_delta).sum();
        assert_eq!(net, live_bytes as i64, "seed={seed}: deltas must sum to live bytes");
    }
}

#[test]
fn reallocation_chain_reports_growth() {
    let session = ProfileSession::new();
    let ctx = session.register_context();
    ctx.record_allocate(0xA000, 256, None);
    ctx.record_reallocate(0xB000, 1024, 256, 0xA000, None);
    ctx.record_free(0xB000, 1024, None);

    let mut master = session.merge_all();
    let summary = build_chains(&mut master).unwrap();
    let r = master.records();
    assert_eq!(r[1].size_delta, 768);
    assert_eq!(r[1].reallocated_from, Some(0xA000));
    assert_eq!((r[0].next_id, r[1].prev_id), (Some(2), Some(1)));
    assert_eq!((r[1].next_id, r[2].prev_id), (Some(3), Some(2)));
    assert!(summary.leaked.is_empty());
}

#[test]
fn unmatched_free_is_reported_not_panicked() {
    let session = ProfileSession::new();
    let ctx = session.register_context();
    ctx.record_allocate(0xA000, 16, None);
    ctx.record_free(0xC000, 16, None);

    let mut master = session.merge_all();
    let err = build_chains(&mut master).unwrap_err();
    assert_eq!(err.address(), 0xC000);
    assert_eq!(err.record_id(), 2);
}
