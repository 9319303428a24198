//! C entry points: `mprof_malloc`, `mprof_calloc`, `mprof_realloc`,
//! `mprof_free` and `mprof_shutdown`.
//!
//! Blocks come from the C library's allocator with the same header scheme as
//! [`ProfilingAllocator`], at the alignment `malloc` guarantees. Symbols are
//! prefixed so loading the library never shadows the process allocator; a
//! preload shim or the application maps `malloc` and friends onto them.

use std::alloc::{GlobalAlloc, Layout};
use std::ffi::c_void;

use crate::alloc::ProfilingAllocator;

/// Alignment of every block handed out through the C entry points.
pub const C_ALIGN: usize = 16;

/// Backing allocator over `malloc`/`calloc`/`free`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcAllocator;

// SAFETY: malloc, calloc and posix_memalign return blocks of at least the
// requested size and alignment or null; free accepts any of them.
unsafe impl GlobalAlloc for LibcAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= C_ALIGN {
            // SAFETY: plain C allocation.
            return unsafe { libc::malloc(layout.size()) }.cast();
        }
        let mut out: *mut c_void = std::ptr::null_mut();
        // SAFETY: align is a power of two and a multiple of the pointer size.
        let rc = unsafe { libc::posix_memalign(&mut out, layout.align(), layout.size()) };
        if rc == 0 { out.cast() } else { std::ptr::null_mut() }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= C_ALIGN {
            // SAFETY: plain C allocation.
            return unsafe { libc::calloc(1, layout.size()) }.cast();
        }
        // SAFETY: forwarded contract.
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            // SAFETY: p is valid for layout.size() bytes.
            unsafe { std::ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: ptr came from malloc/calloc/posix_memalign.
        unsafe { libc::free(ptr.cast()) }
    }
}

static C_ALLOCATOR: ProfilingAllocator<LibcAllocator> = ProfilingAllocator::new(LibcAllocator);

/// `malloc` replacement. A zero `size` yields a unique block.
///
/// # Safety
///
/// The returned block must be released through [`mprof_free`] or
/// [`mprof_realloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mprof_malloc(size: usize) -> *mut c_void {
    // SAFETY: C_ALIGN is a power of two.
    unsafe { C_ALLOCATOR.allocate(size, C_ALIGN, false) }.cast()
}

/// `calloc` replacement. Returns null (recorded as a failed allocation) if
/// `nmemb * size` overflows.
///
/// # Safety
///
/// Same contract as [`mprof_malloc`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mprof_calloc(nmemb: usize, size: usize) -> *mut c_void {
    // An overflowing request cannot be satisfied; usize::MAX fails the same way.
    let total = nmemb.checked_mul(size).unwrap_or(usize::MAX);
    // SAFETY: C_ALIGN is a power of two.
    unsafe { C_ALLOCATOR.allocate(total, C_ALIGN, true) }.cast()
}

/// `realloc` replacement. A null `ptr` allocates; a zero `size` frees and
/// returns null. On failure the original block is left intact.
///
/// # Safety
///
/// `ptr` must be null or a live block from these entry points.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mprof_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: forwarded contract.
    unsafe { C_ALLOCATOR.reallocate(ptr.cast(), C_ALIGN, size) }.cast()
}

/// `free` replacement. Null is accepted.
///
/// # Safety
///
/// `ptr` must be null or a live block from these entry points.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mprof_free(ptr: *mut c_void) {
    // SAFETY: forwarded contract.
    unsafe { C_ALLOCATOR.deallocate(ptr.cast(), C_ALIGN) }
}

/// Stop collecting, link the log and write the report. Returns 0 when the
/// run was finalized (report written or none requested), 1 when the report
/// could not be written, and -1 if the profiler had already shut down.
#[unsafe(no_mangle)]
pub extern "C" fn mprof_shutdown() -> i32 {
    match crate::finish() {
        None => -1,
        Some(outcome) if outcome.report_error.is_some() => 1,
        Some(_) => 0,
    }
}
