//! Per-thread recording state.
//!
//! Each thread lazily registers one context with the session and keeps the
//! handle in a thread-local slot. A thread-local reentrancy flag is raised
//! while the profiler runs on a thread, so allocations made by the profiler
//! itself (stack capture, store growth, diagnostics) pass through unrecorded.
//! Threads past their thread-local teardown record into the collector's
//! shared orphan context.

use std::cell::{Cell, RefCell};

use mprofile_engine::{ContextHandle, MAX_STACK_DEPTH};

use crate::state::{Collector, try_collector};

/// Frames belonging to the profiler itself at the top of every capture.
const SKIPPED_FRAMES: usize = 3;

thread_local! {
    static IN_PROFILER: Cell<bool> = const { Cell::new(false) };
    static HANDLE: RefCell<Option<ContextHandle>> = const { RefCell::new(None) };
}

/// Raised reentrancy flag; lowered on drop.
#[derive(Debug)]
pub(crate) struct ReentrancyGuard {
    _private: (),
}

impl ReentrancyGuard {
    /// Raise the flag, or `None` if this thread is already inside the profiler.
    pub(crate) fn enter() -> Option<Self> {
        IN_PROFILER
            .try_with(|flag| (!flag.replace(true)).then_some(Self { _private: () }))
            .ok()
            .flatten()
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = IN_PROFILER.try_with(|flag| flag.set(false));
    }
}

/// Whether the calling thread is currently inside the profiler.
#[must_use]
pub fn in_profiler() -> bool {
    IN_PROFILER.try_with(Cell::get).unwrap_or(true)
}

/// Permission to record one event on the calling thread.
///
/// Holding a recorder keeps the reentrancy flag raised, so everything the
/// entry point does until it drops the recorder is invisible to the profiler.
#[derive(Debug)]
pub(crate) struct Recorder {
    _guard: ReentrancyGuard,
    collector: &'static Collector,
}

impl Recorder {
    /// `None` when the thread is already inside the profiler or the collector
    /// is not up (or stopped).
    pub(crate) fn enter() -> Option<Self> {
        let guard = ReentrancyGuard::enter()?;
        let collector = try_collector()?;
        if !collector.is_collecting() {
            return None;
        }
        Some(Self {
            _guard: guard,
            collector,
        })
    }

    /// Each `record_*` call returns whether the event reached the log.
    pub(crate) fn allocate(&self, address: usize, size: usize) -> bool {
        self.with_handle(|handle, frames| handle.record_allocate(address, size, frames))
    }

    pub(crate) fn free(&self, address: usize, size: usize) -> bool {
        self.with_handle(|handle, frames| handle.record_free(address, size, frames))
    }

    pub(crate) fn reallocate(
        &self,
        address: usize,
        new_size: usize,
        old_size: usize,
        old_address: usize,
    ) -> bool {
        self.with_handle(|handle, frames| {
            handle.record_reallocate(address, new_size, old_size, old_address, frames)
        })
    }

    fn with_handle(&self, f: impl FnOnce(&ContextHandle, Option<&[u64]>) -> bool) -> bool {
        let config = self.collector.config();
        let mut frames = [0u64; MAX_STACK_DEPTH];
        let depth = if config.capture_stacks {
            capture_frames(&mut frames, config.stack_depth)
        } else {
            0
        };
        let captured = config.capture_stacks.then(|| &frames[..depth]);

        let mut f = Some(f);
        let stored = HANDLE.try_with(|slot| {
            let mut slot = slot.borrow_mut();
            let handle =
                slot.get_or_insert_with(|| self.collector.session().register_context());
            f.take().is_some_and(|f| f(handle, captured))
        });
        match stored {
            Ok(stored) => stored,
            // Thread-local teardown: the event still has to reach the log, or
            // the block's chain would stay open while its address gets reused.
            Err(_) => f.take().is_some_and(|f| f(self.collector.orphans(), captured)),
        }
    }
}

/// Fill `frames` with up to `depth` return addresses of the caller, skipping
/// the profiler's own frames. Returns the number written.
fn capture_frames(frames: &mut [u64; MAX_STACK_DEPTH], depth: usize) -> usize {
    let depth = depth.min(MAX_STACK_DEPTH);
    let mut skipped = 0;
    let mut written = 0;
    backtrace::trace(|frame| {
        if skipped < SKIPPED_FRAMES {
            skipped += 1;
            return true;
        }
        frames[written] = frame.ip() as usize as u64;
        written += 1;
        written < depth
    });
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_blocks_nested_entry() {
        assert!(!in_profiler());
        let outer = ReentrancyGuard::enter().expect("first entry");
        assert!(in_profiler());
        assert!(ReentrancyGuard::enter().is_none());
        drop(outer);
        assert!(!in_profiler());
        assert!(ReentrancyGuard::enter().is_some());
    }

    #[test]
    fn capture_respects_depth() {
        let mut frames = [0u64; MAX_STACK_DEPTH];
        let n = capture_frames(&mut frames, 2);
        assert!(n <= 2);
        assert!(frames[..n].iter().all(|&ip| ip != 0));
    }
}
