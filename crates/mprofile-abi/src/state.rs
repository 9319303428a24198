//! Process-wide collector.
//!
//! Holds the profiling session and the configuration every entry point
//! consults. Uses manual atomic init instead of OnceLock: the collector is
//! built from inside the allocator, and OnceLock's futex wait would deadlock
//! on a same-thread reentrant init.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};

use mprofile_engine::config::{ProfilerConfig, config};
use mprofile_engine::diag::{self, DiagEntry, DiagLevel};
use mprofile_engine::{ContextHandle, GuardMode, ProfileSession};

const STATE_UNINIT: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;

static COLLECTOR_STATE: AtomicU8 = AtomicU8::new(STATE_UNINIT);
static COLLECTOR_PTR: AtomicPtr<Collector> = AtomicPtr::new(std::ptr::null_mut());

/// The session plus the settings read at startup.
#[derive(Debug)]
pub struct Collector {
    session: ProfileSession,
    config: &'static ProfilerConfig,
    /// Shared context for threads whose own slot has been torn down.
    orphans: ContextHandle,
    finished: AtomicBool,
}

impl Collector {
    fn new() -> Self {
        let config = config();
        let session = ProfileSession::from_config(config);
        let orphans = session.register_context();
        diag::emit_with(DiagLevel::Info, || {
            DiagEntry::new(DiagLevel::Info, "session_start").with_details(serde_json::json!({
                "output": config.output_path.as_ref().map(|p| p.display().to_string()),
                "stacks": config.capture_stacks,
                "stack_depth": config.stack_depth,
                "guard": config.guard.validates(),
            }))
        });
        Self {
            session,
            config,
            orphans,
            finished: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn session(&self) -> &ProfileSession {
        &self.session
    }

    #[must_use]
    pub fn config(&self) -> &'static ProfilerConfig {
        self.config
    }

    /// Context for events on threads past their thread-local teardown.
    pub(crate) fn orphans(&self) -> &ContextHandle {
        &self.orphans
    }

    /// Whether events are still being collected.
    #[must_use]
    pub fn is_collecting(&self) -> bool {
        !self.finished.load(Ordering::Acquire)
    }

    /// Stop collecting. Returns `false` if collection had already stopped.
    pub(crate) fn stop(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }
}

/// Global collector instance, created on first call.
///
/// Returns `None` while another call is initializing it, so allocations made
/// during init pass through unrecorded.
pub(crate) fn try_collector() -> Option<&'static Collector> {
    if let Some(ready) = collector() {
        return Some(ready);
    }

    if COLLECTOR_STATE
        .compare_exchange(
            STATE_UNINIT,
            STATE_INITIALIZING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        // Initializing elsewhere, or it finished since the first check.
        return collector();
    }

    let ptr = Box::into_raw(Box::new(Collector::new()));
    COLLECTOR_PTR.store(ptr, Ordering::Release);
    COLLECTOR_STATE.store(STATE_READY, Ordering::Release);

    // SAFETY: just leaked; lives for the rest of the process.
    Some(unsafe { &*ptr })
}

/// The collector if it is already up, without triggering init.
pub fn collector() -> Option<&'static Collector> {
    if COLLECTOR_STATE.load(Ordering::Acquire) != STATE_READY {
        return None;
    }
    let ptr = COLLECTOR_PTR.load(Ordering::Acquire);
    // SAFETY: state is READY, so the pointer is published and never freed.
    Some(unsafe { &*ptr })
}

/// Guard mode in force; strict until the collector is up.
pub(crate) fn guard_mode() -> GuardMode {
    collector().map_or(GuardMode::Strict, |c| c.config.guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_publishes_a_single_collector() {
        // Another test thread may be mid-init; wait it out.
        let first = std::iter::repeat_with(try_collector)
            .find_map(|c| c)
            .expect("collector is ready");
        let again = try_collector().expect("collector is ready");
        let peeked = collector().expect("collector is ready");
        assert!(std::ptr::eq(first, again));
        assert!(std::ptr::eq(first, peeked));
        assert_eq!(COLLECTOR_STATE.load(Ordering::Acquire), STATE_READY);
    }
}
