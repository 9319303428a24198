//! Offline walks over a saved report.
//!
//! Every analysis works on the `prev_id`/`next_id` links already present in
//! the report; nothing is re-linked here. [`verify`] checks that those links
//! are consistent before the other walks are trusted.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use mprofile_engine::{RecordKind, Report, ReportError, ReportRecord, ReportStack};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("report: {0}")]
    Report(#[from] ReportError),
    #[error("record {from} links to missing record {to}")]
    MissingRecord { from: u64, to: u64 },
    #[error("chain from record {start} does not advance at record {at}")]
    NonAdvancingLink { start: u64, at: u64 },
}

/// A report together with the digest of the bytes it was parsed from.
#[derive(Debug, Clone)]
pub struct LoadedReport {
    pub path: PathBuf,
    pub sha256: String,
    pub report: Report,
}

impl LoadedReport {
    pub fn load(path: &Path) -> Result<Self, AnalysisError> {
        let bytes = std::fs::read(path)?;
        let sha256 = sha256_hex(&bytes);
        let report = Report::read_from(bytes.as_slice())?;
        Ok(Self {
            path: path.to_path_buf(),
            sha256,
            report,
        })
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::Digest;
    hex_lower(&sha2::Sha256::digest(bytes))
}

/// Whether a record leaves a live block behind it. A zero-size allocation
/// is still a unique block; a zero-size reallocation is a release.
fn opens_block(record: &ReportRecord) -> bool {
    match record.state {
        RecordKind::Allocate => record.address != 0,
        RecordKind::Reallocate => record.address != 0 && record.size > 0,
        RecordKind::Free => false,
    }
}

/// One record along a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainStep {
    pub id: u64,
    pub state: RecordKind,
    pub size: usize,
    pub delta: i64,
}

/// Lifetime of one logical block, from its first allocation onward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chain {
    pub steps: Vec<ChainStep>,
    /// The last step released the block.
    pub closed: bool,
}

impl Chain {
    /// `allocated <size> -> <state> <delta> -> ...`
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, step) in self.steps.iter().enumerate() {
            if i == 0 {
                let _ = write!(&mut out, "{} {}", step.state.state(), step.size);
            } else {
                let _ = write!(&mut out, " -> {} {}", step.state.state(), step.delta);
            }
        }
        out
    }

    /// Sum of deltas along the chain: bytes the block still holds.
    #[must_use]
    pub fn net_bytes(&self) -> i64 {
        self.steps.iter().map(|s| s.delta).sum()
    }
}

/// Every chain that starts with a successful allocation, in id order.
pub fn chains(report: &Report) -> Result<Vec<Chain>, AnalysisError> {
    report
        .allocations
        .iter()
        .filter(|r| r.prev_id.is_none() && opens_block(r))
        .map(|start| walk(report, start))
        .collect()
}

fn walk(report: &Report, start: &ReportRecord) -> Result<Chain, AnalysisError> {
    let mut steps = Vec::new();
    let mut current = start;
    loop {
        steps.push(ChainStep {
            id: current.id,
            state: current.state,
            size: current.size,
            delta: current.delta_size,
        });
        let Some(next_id) = current.next_id else {
            break;
        };
        if next_id <= current.id {
            return Err(AnalysisError::NonAdvancingLink {
                start: start.id,
                at: current.id,
            });
        }
        current = report.record(next_id).ok_or(AnalysisError::MissingRecord {
            from: current.id,
            to: next_id,
        })?;
    }
    Ok(Chain {
        steps,
        closed: !opens_block(current),
    })
}

/// A block still open at the end of the run.
#[derive(Debug, Clone, Serialize)]
pub struct Leak<'a> {
    pub record: &'a ReportRecord,
    pub stack: Option<&'a ReportStack>,
}

/// Last records of chains that never close, in id order.
#[must_use]
pub fn leaks(report: &Report) -> Vec<Leak<'_>> {
    report
        .allocations
        .iter()
        .filter(|r| r.next_id.is_none() && opens_block(r))
        .map(|record| Leak {
            record,
            stack: report.stack(record.stack_id),
        })
        .collect()
}

/// Allocations that returned null and reallocations that could not grow.
#[must_use]
pub fn failures(report: &Report) -> Vec<&ReportRecord> {
    report
        .allocations
        .iter()
        .filter(|r| r.is_alloc_failure() || r.is_realloc_failure())
        .collect()
}

/// Headline numbers of a loaded report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Overview {
    pub path: PathBuf,
    pub sha256: String,
    pub annotation: String,
    pub records: u64,
    pub allocations: u64,
    pub frees: u64,
    pub reallocations: u64,
    pub bytes_allocated: u64,
    pub bytes_freed: u64,
    pub peak_live_bytes: u64,
    pub leaked_blocks: u64,
    pub leaked_bytes: u64,
    pub failures: u64,
    pub stacks: u64,
}

/// Counts recomputed from the records, so reports without a stored
/// summary still get one.
#[must_use]
pub fn summary(loaded: &LoadedReport) -> Overview {
    let report = &loaded.report;
    let mut overview = Overview {
        path: loaded.path.clone(),
        sha256: loaded.sha256.clone(),
        annotation: report.annotation.clone(),
        records: report.allocations.len() as u64,
        allocations: 0,
        frees: 0,
        reallocations: 0,
        bytes_allocated: 0,
        bytes_freed: 0,
        peak_live_bytes: 0,
        leaked_blocks: 0,
        leaked_bytes: 0,
        failures: failures(report).len() as u64,
        stacks: report.stacks.len() as u64,
    };

    let mut live: i128 = 0;
    let mut peak: i128 = 0;
    for record in &report.allocations {
        match record.state {
            RecordKind::Allocate => overview.allocations += 1,
            RecordKind::Free => overview.frees += 1,
            RecordKind::Reallocate => overview.reallocations += 1,
        }
        if record.delta_size >= 0 {
            overview.bytes_allocated += record.delta_size as u64;
        } else {
            overview.bytes_freed += record.delta_size.unsigned_abs();
        }
        live += i128::from(record.delta_size);
        peak = peak.max(live);
    }
    overview.peak_live_bytes = u64::try_from(peak).unwrap_or(u64::MAX);

    for leak in leaks(report) {
        overview.leaked_blocks += 1;
        overview.leaked_bytes += leak.record.size as u64;
    }
    overview
}

/// Inconsistency found by [`verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Record ids are not strictly ascending.
    Unordered { previous: u64, id: u64 },
    /// A link points at a record the report does not contain.
    DanglingLink { from: u64, to: u64 },
    /// `a.next == b` without `b.prev == a`, or the reverse.
    AsymmetricLink { from: u64, to: u64 },
    /// A link that does not move forward in id order.
    BackwardLink { from: u64, to: u64 },
    /// A record references a stack id missing from the stack list.
    UnknownStack { id: u64, stack_id: u32 },
    /// The stored summary disagrees with the records.
    SummaryMismatch {
        field: &'static str,
        stored: u64,
        computed: u64,
    },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unordered { previous, id } => {
                write!(f, "record {id} follows record {previous}")
            }
            Self::DanglingLink { from, to } => {
                write!(f, "record {from} links to missing record {to}")
            }
            Self::AsymmetricLink { from, to } => {
                write!(f, "link {from} -> {to} has no matching back link")
            }
            Self::BackwardLink { from, to } => {
                write!(f, "link {from} -> {to} goes backwards")
            }
            Self::UnknownStack { id, stack_id } => {
                write!(f, "record {id} references unknown stack {stack_id}")
            }
            Self::SummaryMismatch {
                field,
                stored,
                computed,
            } => write!(f, "summary {field}: stored {stored}, computed {computed}"),
        }
    }
}

/// Check ordering, link symmetry and stack references. An empty result
/// means the report is consistent.
#[must_use]
pub fn verify(report: &Report) -> Vec<Violation> {
    let mut violations = Vec::new();

    for pair in report.allocations.windows(2) {
        if pair[1].id <= pair[0].id {
            violations.push(Violation::Unordered {
                previous: pair[0].id,
                id: pair[1].id,
            });
        }
    }
    // Lookups below binary search by id.
    let ordered = violations.is_empty();
    let find = |id: u64| {
        if ordered {
            report.record(id)
        } else {
            report.allocations.iter().find(|r| r.id == id)
        }
    };

    let stack_ids: HashSet<u32> = report.stacks.iter().map(|s| s.id).collect();

    for record in &report.allocations {
        if let Some(next) = record.next_id {
            if next <= record.id {
                violations.push(Violation::BackwardLink {
                    from: record.id,
                    to: next,
                });
            }
            match find(next) {
                None => violations.push(Violation::DanglingLink {
                    from: record.id,
                    to: next,
                }),
                Some(target) if target.prev_id != Some(record.id) => {
                    violations.push(Violation::AsymmetricLink {
                        from: record.id,
                        to: next,
                    });
                }
                Some(_) => {}
            }
        }
        if let Some(prev) = record.prev_id {
            match find(prev) {
                None => violations.push(Violation::DanglingLink {
                    from: record.id,
                    to: prev,
                }),
                Some(source) if source.next_id != Some(record.id) => {
                    violations.push(Violation::AsymmetricLink {
                        from: prev,
                        to: record.id,
                    });
                }
                Some(_) => {}
            }
        }
        if record.stack_id != 0 && !stack_ids.contains(&record.stack_id) {
            violations.push(Violation::UnknownStack {
                id: record.id,
                stack_id: record.stack_id,
            });
        }
    }

    // A report without a stored summary deserializes to all zeros.
    let stored = &report.summary;
    if stored.records != 0 {
        let computed_records = report.allocations.len() as u64;
        if stored.records != computed_records {
            violations.push(Violation::SummaryMismatch {
                field: "records",
                stored: stored.records,
                computed: computed_records,
            });
        }
        // Owners forgotten across a gap stay open in the links but are not
        // counted as leaks.
        let computed_leaks = leaks(report).len() as u64;
        if stored.chain_gaps == 0 && stored.leaked_blocks != computed_leaks {
            violations.push(Violation::SummaryMismatch {
                field: "leaked_blocks",
                stored: stored.leaked_blocks,
                computed: computed_leaks,
            });
        }
    }

    violations
}
