//! # mprofile-abi
//!
//! Allocation interception for the mprofile engine.
//!
//! Two front doors feed the same collector:
//! - [`ProfilingAllocator`], a `GlobalAlloc` wrapper for Rust programs;
//! - `extern "C"` entry points (`mprof_malloc`, `mprof_calloc`,
//!   `mprof_realloc`, `mprof_free`) for C callers, built into the `cdylib`.
//!
//! Every block carries a checksummed header. Each thread records into its own
//! context; [`finish`] (or `mprof_shutdown`) merges the contexts, links
//! allocation chains and writes the report named by `MPROFILE_OUTF`.
//!
//! # Architecture
//!
//! ```text
//! caller -> entry point (this crate) -> header + thread context -> engine store
//!                                                      ... finish -> merge -> chains -> report
//! ```

pub mod alloc;
pub mod context;
pub mod malloc_abi;
pub mod shutdown;
pub mod state;

pub use alloc::ProfilingAllocator;
pub use context::in_profiler;
pub use malloc_abi::LibcAllocator;
pub use shutdown::{FinishOutcome, finish};
pub use state::{Collector, collector};
