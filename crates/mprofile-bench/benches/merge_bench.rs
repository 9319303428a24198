//! Shutdown-path benchmarks: merging context stores and linking chains.

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use mprofile_engine::{ProfileSession, build_chains};

const BLOCKS_PER_CONTEXT: usize = 2_000;

/// Each context allocates, grows and frees its own blocks, leaving one in
/// eight open.
fn recorded_session(contexts: usize) -> ProfileSession {
    let session = ProfileSession::new();
    let handles: Vec<_> = (0..contexts).map(|_| session.register_context()).collect();
    for (ctx, handle) in handles.iter().enumerate() {
        let base = 0x1000_0000 * (ctx + 1);
        let frames = [0x4000 + ctx as u64, 0x5000, 0x6000];
        for i in 0..BLOCKS_PER_CONTEXT {
            let address = base + i * 0x100;
            handle.record_allocate(address, 32, Some(&frames));
            if i % 8 == 7 {
                continue;
            }
            let moved = address + 0x80;
            handle.record_reallocate(moved, 96, 32, address, Some(&frames[1..]));
            handle.record_free(moved, 96, None);
        }
    }
    session
}

fn bench_merge_and_link(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_and_link");
    for contexts in [1usize, 4, 16] {
        group.bench_with_input(
            BenchmarkId::from_parameter(contexts),
            &contexts,
            |b, &contexts| {
                b.iter_batched(
                    || recorded_session(contexts),
                    |session| {
                        let mut master = session.merge_all();
                        let summary = build_chains(&mut master).expect("consistent log");
                        criterion::black_box(summary.leaked.len());
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_merge_and_link);
criterion_main!(benches);
