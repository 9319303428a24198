//! Allocation profiling engine.
//!
//! Records allocator events per execution context, merges them at shutdown
//! into one id-ordered log, links each block's records into a lifetime chain
//! and writes the result as a JSON report.
//!
//! # Architecture
//!
//! - **Stack interner** (`stack`): canonical call stacks with table-scoped ids
//! - **Record store** (`record`): append-only per-context event log
//! - **Session** (`session`): id counter, store registry, end-of-life merge
//! - **Chain builder** (`chain`): prev/next links, leak and failure detection
//! - **Header guard** (`header`): size + checksum prefix on every block
//! - **Report** (`report`): summary statistics and the JSON document
//! - **Symbols** (`symbols`): frame address resolution at emission time
//! - **Configuration** (`config`): environment-driven settings
//! - **Diagnostics** (`diag`): structured JSONL log lines
//! - **Metrics** (`metrics`): atomic counters for observability

#![deny(unsafe_code)]

pub mod chain;
pub mod config;
pub mod diag;
pub mod header;
pub mod metrics;
pub mod record;
pub mod report;
pub mod session;
pub mod size_class;
pub mod stack;
pub mod symbols;

pub use chain::{ChainError, ChainSummary, build_chains};
pub use config::{GuardMode, ProfilerConfig};
pub use diag::{DiagEntry, DiagLevel, DiagSink};
pub use header::{HeaderError, HeaderLayout, MemoryHeader};
pub use metrics::{MetricsSnapshot, ProfilerMetrics};
pub use record::{AllocationRecord, ProfileStore, RecordKind, Timestamp};
pub use report::{Report, ReportError, ReportRecord, ReportStack, ReportSummary};
pub use session::{ContextHandle, ContextId, MasterStore, ProfileSession};
pub use stack::{MAX_STACK_DEPTH, Stack, StackId, StackTable};
pub use symbols::{RawSymbolizer, Symbolizer};
