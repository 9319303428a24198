//! Header-installing, event-recording allocator wrapper.
//!
//! [`ProfilingAllocator`] puts a [`MemoryHeader`](mprofile_engine::MemoryHeader)
//! in front of every block it hands out and records each operation with the
//! calling thread's context. Headers are written even when an operation is
//! not recorded; the tracked bit is set only once the allocation is stored
//! in the log, so releases know whether a matching record exists.
//!
//! Reallocation always moves: allocate, copy, release. The new block is
//! recorded before the old one goes back to the backing allocator, so no
//! other thread can be handed the old address while the log still shows it
//! open.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::{self, NonNull};

use mprofile_engine::diag::{self, DiagEntry, DiagLevel};
use mprofile_engine::header::ReleasedBlock;
use mprofile_engine::{HeaderError, HeaderLayout, ProfilerMetrics, RecordKind};

use crate::context::{Recorder, ReentrancyGuard};
use crate::state::{collector, guard_mode};

/// Profiling wrapper around a backing allocator.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: ProfilingAllocator = ProfilingAllocator::system();
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct ProfilingAllocator<A = System> {
    inner: A,
}

impl ProfilingAllocator<System> {
    #[must_use]
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> ProfilingAllocator<A> {
    #[must_use]
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

impl<A: GlobalAlloc> ProfilingAllocator<A> {
    /// Allocate `size` bytes aligned to `align`. A zero `size` still yields a
    /// unique block. Returns null on failure, which is recorded as well.
    ///
    /// # Safety
    ///
    /// `align` must be a power of two.
    pub unsafe fn allocate(&self, size: usize, align: usize, zeroed: bool) -> *mut u8 {
        let recorder = Recorder::enter();
        // SAFETY: forwarded contract.
        let Some(user) = (unsafe { self.raw_allocate(size, align, zeroed) }) else {
            if let Some(recorder) = &recorder {
                recorder.allocate(0, size);
            }
            return ptr::null_mut();
        };
        if recorder.is_some_and(|r| r.allocate(user.as_ptr() as usize, size)) {
            // SAFETY: user was just produced by raw_allocate with this alignment.
            unsafe { HeaderLayout::for_align(align).mark_tracked(user) };
        }
        user.as_ptr()
    }

    /// Release a block from [`ProfilingAllocator::allocate`]. Null is
    /// recorded as a no-op free.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block from this allocator allocated with
    /// the same `align`.
    pub unsafe fn deallocate(&self, ptr: *mut u8, align: usize) {
        let Some(user) = NonNull::new(ptr) else {
            if let Some(recorder) = Recorder::enter() {
                recorder.free(0, 0);
            }
            return;
        };
        let layout = HeaderLayout::for_align(align);
        // SAFETY: forwarded contract.
        let block = unsafe { self.take_block(layout, user, RecordKind::Free) };
        if let Some(recorder) = block.tracked.then(Recorder::enter).flatten() {
            recorder.free(user.as_ptr() as usize, block.size);
        }
        // SAFETY: block.raw came from raw_allocate with this layout.
        unsafe { self.raw_release(layout, block) };
    }

    /// Resize a block to `new_size` bytes.
    ///
    /// A null `ptr` behaves as an allocation and a zero `new_size` as a
    /// release (returning null); both are recorded as reallocations. On
    /// failure the original block is untouched and null is returned.
    ///
    /// # Safety
    ///
    /// Same contract as [`ProfilingAllocator::deallocate`].
    pub unsafe fn reallocate(&self, ptr: *mut u8, align: usize, new_size: usize) -> *mut u8 {
        let layout = HeaderLayout::for_align(align);
        let Some(old) = NonNull::new(ptr) else {
            let recorder = Recorder::enter();
            // SAFETY: forwarded contract.
            let fresh = unsafe { self.raw_allocate(new_size, align, false) };
            let address = fresh.map_or(0, |p| p.as_ptr() as usize);
            let stored = recorder.is_some_and(|r| r.reallocate(address, new_size, 0, 0));
            if let Some(fresh) = fresh.filter(|_| stored) {
                // SAFETY: fresh was just produced by raw_allocate with this layout.
                unsafe { layout.mark_tracked(fresh) };
            }
            return fresh.map_or(ptr::null_mut(), NonNull::as_ptr);
        };

        // SAFETY: forwarded contract.
        let header = unsafe { self.check_header(layout, old, RecordKind::Reallocate) };
        let old_size = header.size();
        let old_address = old.as_ptr() as usize;
        let recorder = Recorder::enter();
        // A block allocated while unrecorded has no chain to continue; its
        // reallocation starts a fresh one.
        let (from, from_size) = if header.is_tracked() {
            (old_address, old_size)
        } else {
            (0, 0)
        };

        if new_size == 0 {
            if let Some(recorder) = recorder.as_ref().filter(|_| header.is_tracked()) {
                recorder.reallocate(0, 0, old_size, old_address);
            }
            drop(recorder);
            // SAFETY: forwarded contract.
            let block = unsafe { self.take_block(layout, old, RecordKind::Reallocate) };
            // SAFETY: block.raw came from raw_allocate with this layout.
            unsafe { self.raw_release(layout, block) };
            return ptr::null_mut();
        }

        // SAFETY: forwarded contract.
        let Some(fresh) = (unsafe { self.raw_allocate(new_size, align, false) }) else {
            if let Some(recorder) = &recorder {
                recorder.reallocate(0, new_size, from_size, from);
            }
            return ptr::null_mut();
        };
        // SAFETY: both blocks are live, distinct and at least this long.
        unsafe { ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), old_size.min(new_size)) };
        let stored = recorder
            .as_ref()
            .is_some_and(|r| r.reallocate(fresh.as_ptr() as usize, new_size, from_size, from));
        if stored {
            // SAFETY: fresh was just produced by raw_allocate with this layout.
            unsafe { layout.mark_tracked(fresh) };
        }
        drop(recorder);

        // SAFETY: forwarded contract.
        let block = unsafe { self.take_block(layout, old, RecordKind::Reallocate) };
        // SAFETY: block.raw came from raw_allocate with this layout.
        unsafe { self.raw_release(layout, block) };
        fresh.as_ptr()
    }

    /// Get a block from the backing allocator and install an untracked header.
    unsafe fn raw_allocate(&self, size: usize, align: usize, zeroed: bool) -> Option<NonNull<u8>> {
        let layout = HeaderLayout::for_align(align);
        let raw_layout = raw_layout(layout, size)?;
        // SAFETY: raw_layout has a non-zero size (it includes the header).
        let raw = unsafe {
            if zeroed {
                self.inner.alloc_zeroed(raw_layout)
            } else {
                self.inner.alloc(raw_layout)
            }
        };
        let raw = NonNull::new(raw)?;
        // SAFETY: raw is valid for total_size(size) bytes at layout.align().
        Some(unsafe { layout.acquire(raw, size, false) })
    }

    /// Return a released block to the backing allocator.
    unsafe fn raw_release(&self, layout: HeaderLayout, block: ReleasedBlock) {
        if let Some(raw_layout) = raw_layout(layout, block.size) {
            // SAFETY: same layout the block was allocated with.
            unsafe { self.inner.dealloc(block.raw.as_ptr(), raw_layout) };
        }
    }

    /// Read the header of a live block, validating it unless the guard is off.
    unsafe fn check_header(
        &self,
        layout: HeaderLayout,
        user: NonNull<u8>,
        operation: RecordKind,
    ) -> mprofile_engine::MemoryHeader {
        if !guard_mode().validates() {
            // SAFETY: forwarded contract.
            return unsafe { layout.read(user) };
        }
        count_check();
        // SAFETY: forwarded contract.
        match unsafe { layout.inspect(user) } {
            Ok(header) => header,
            Err(err) => header_corrupted(&err, user.as_ptr() as usize, operation),
        }
    }

    /// Validate (unless the guard is off) and poison the header of a block
    /// about to be released.
    unsafe fn take_block(
        &self,
        layout: HeaderLayout,
        user: NonNull<u8>,
        operation: RecordKind,
    ) -> ReleasedBlock {
        if !guard_mode().validates() {
            // SAFETY: forwarded contract.
            let header = unsafe { layout.read(user) };
            return ReleasedBlock {
                // SAFETY: forwarded contract.
                raw: unsafe { layout.raw_of(user) },
                size: header.size(),
                tracked: header.is_tracked(),
            };
        }
        count_check();
        // SAFETY: forwarded contract.
        match unsafe { layout.release(user) } {
            Ok(block) => block,
            Err(err) => header_corrupted(&err, user.as_ptr() as usize, operation),
        }
    }
}

fn raw_layout(layout: HeaderLayout, size: usize) -> Option<Layout> {
    let total = layout.total_size(size)?;
    Layout::from_size_align(total, layout.align()).ok()
}

fn count_check() {
    if let Some(collector) = collector() {
        ProfilerMetrics::inc(&collector.session().metrics().header_checks);
    }
}

/// Log a fatal diagnostic for a corrupted header and abort.
fn header_corrupted(err: &HeaderError, address: usize, operation: RecordKind) -> ! {
    if let Some(collector) = collector() {
        ProfilerMetrics::inc(&collector.session().metrics().header_failures);
    }
    // Diagnostics allocate; keep those allocations out of the log.
    let _guard = ReentrancyGuard::enter();
    diag::emit(
        &DiagEntry::new(DiagLevel::Fatal, "header_corruption")
            .with_address(address)
            .with_operation(operation)
            .with_details(serde_json::json!({ "error": err.to_string() })),
    );
    diag::flush();
    std::process::abort();
}

// SAFETY: every method upholds the GlobalAlloc contract by delegating to the
// backing allocator with a layout that covers header and payload.
unsafe impl<A: GlobalAlloc> GlobalAlloc for ProfilingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Layout guarantees a power-of-two alignment.
        unsafe { self.allocate(layout.size(), layout.align(), false) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // SAFETY: Layout guarantees a power-of-two alignment.
        unsafe { self.allocate(layout.size(), layout.align(), true) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: ptr was allocated by this allocator with `layout`.
        unsafe { self.deallocate(ptr, layout.align()) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // SAFETY: ptr was allocated by this allocator with `layout`; new_size
        // is non-zero per the GlobalAlloc contract.
        unsafe { self.reallocate(ptr, layout.align(), new_size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static ALLOC: ProfilingAllocator = ProfilingAllocator::system();

    #[test]
    fn blocks_are_aligned_and_usable() {
        for align in [1, 8, 16, 64, 4096] {
            // SAFETY: power-of-two alignment; block released below.
            unsafe {
                let p = ALLOC.allocate(100, align, false);
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0);
                ptr::write_bytes(p, 0xAB, 100);
                ALLOC.deallocate(p, align);
            }
        }
    }

    #[test]
    fn zeroed_blocks_are_zero() {
        // SAFETY: block released below.
        unsafe {
            let p = ALLOC.allocate(256, 16, true);
            assert!(std::slice::from_raw_parts(p, 256).iter().all(|&b| b == 0));
            ALLOC.deallocate(p, 16);
        }
    }

    #[test]
    fn reallocate_preserves_contents() {
        // SAFETY: every block is released exactly once.
        unsafe {
            let p = ALLOC.allocate(8, 16, false);
            ptr::copy_nonoverlapping(b"mprofile".as_ptr(), p, 8);
            let q = ALLOC.reallocate(p, 16, 4096);
            assert_eq!(std::slice::from_raw_parts(q, 8), b"mprofile");
            let r = ALLOC.reallocate(q, 16, 4);
            assert_eq!(std::slice::from_raw_parts(r, 4), b"mpro");
            assert!(ALLOC.reallocate(r, 16, 0).is_null());
        }
    }

    #[test]
    fn null_edge_cases() {
        // SAFETY: null is accepted by both entry points.
        unsafe {
            ALLOC.deallocate(ptr::null_mut(), 16);
            let p = ALLOC.reallocate(ptr::null_mut(), 16, 32);
            assert!(!p.is_null());
            ALLOC.deallocate(p, 16);
        }
    }

    fn header_of(ptr: *mut u8) -> mprofile_engine::MemoryHeader {
        // SAFETY: ptr is a live block from ALLOC with 16-byte alignment.
        unsafe { HeaderLayout::for_align(16).inspect(NonNull::new(ptr).unwrap()) }.unwrap()
    }

    #[test]
    fn dropped_allocation_leaves_block_untracked() {
        // SAFETY: every block is released exactly once.
        unsafe {
            let before = ALLOC.allocate(24, 16, false);
            let collector = collector().expect("collector is up after a recorded allocation");
            assert!(header_of(before).is_tracked());

            // Draining the session closes this thread's store: later events
            // are dropped.
            let _ = collector.session().merge_all();
            let metrics = collector.session().metrics();
            let dropped = ProfilerMetrics::get(&metrics.events_dropped);

            let after = ALLOC.allocate(24, 16, false);
            assert!(!header_of(after).is_tracked());
            let grown = ALLOC.reallocate(after, 16, 256);
            assert!(!header_of(grown).is_tracked());
            assert!(ProfilerMetrics::get(&metrics.events_dropped) >= dropped + 2);

            ALLOC.deallocate(grown, 16);
            ALLOC.deallocate(before, 16);
        }
    }

    #[test]
    fn impossible_sizes_fail_cleanly() {
        // SAFETY: failure returns null and allocates nothing.
        unsafe {
            assert!(ALLOC.allocate(usize::MAX - 8, 16, false).is_null());
        }
    }
}
