//! Report model and emitter.
//!
//! A [`Report`] is built from a linked [`MasterStore`] and written as one JSON
//! document. The same types deserialize a saved report for offline analysis.
//!
//! Addresses are written as `0x`-prefixed hex strings. Stack id 0 means no
//! stack was captured; `next_id`/`prev_id` are `null` when a record has no
//! neighbour in its chain.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::ChainSummary;
use crate::diag::{self, DiagEntry, DiagLevel};
use crate::metrics::MetricsSnapshot;
use crate::record::{AllocationRecord, RecordKind, Timestamp};
use crate::session::MasterStore;
use crate::size_class::{SizeClassBucket, SizeClassHistogram};
use crate::stack::{Stack, StackId};
use crate::symbols::Symbolizer;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed report: {0}")]
    Json(#[from] serde_json::Error),
}

/// One allocation record as it appears in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub id: u64,
    #[serde(with = "hex_address")]
    pub address: usize,
    #[serde(with = "hex_address::option", default)]
    pub reallocated_address: Option<usize>,
    /// Absolute size requested or released.
    pub size: usize,
    pub delta_size: i64,
    pub state: RecordKind,
    pub next_id: Option<u64>,
    pub prev_id: Option<u64>,
    /// 0 when no stack was captured.
    pub stack_id: u32,
    pub timestamp: Timestamp,
}

impl From<&AllocationRecord> for ReportRecord {
    fn from(record: &AllocationRecord) -> Self {
        Self {
            id: record.id,
            address: record.address,
            reallocated_address: record.reallocated_from,
            size: record.size,
            delta_size: record.size_delta,
            state: record.kind,
            next_id: record.next_id,
            prev_id: record.prev_id,
            stack_id: StackId::raw(record.stack_id),
            timestamp: record.timestamp,
        }
    }
}

impl ReportRecord {
    #[must_use]
    pub fn is_alloc_failure(&self) -> bool {
        self.state == RecordKind::Allocate && self.address == 0
    }

    #[must_use]
    pub fn is_realloc_failure(&self) -> bool {
        self.state == RecordKind::Reallocate && self.address == 0 && self.size > 0
    }
}

/// One interned stack with resolved frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportStack {
    pub id: u32,
    pub occurrence_count: u64,
    /// Execution context that first captured the stack.
    pub thread_id: u64,
    pub frames: Vec<String>,
}

impl ReportStack {
    fn resolve(stack: &Stack, symbolizer: &dyn Symbolizer) -> Self {
        Self {
            id: stack.id().get(),
            occurrence_count: stack.occurrence_count(),
            thread_id: stack.owning_context().get(),
            frames: stack
                .frames()
                .iter()
                .map(|&frame| symbolizer.display(frame))
                .collect(),
        }
    }
}

/// Aggregate statistics over the whole log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub records: u64,
    pub allocations: u64,
    pub frees: u64,
    pub reallocations: u64,
    /// Sum of positive deltas.
    pub bytes_allocated: u64,
    /// Sum of negative deltas, as a positive number.
    pub bytes_freed: u64,
    /// Largest running sum of deltas over the id-ordered log.
    pub peak_live_bytes: u64,
    pub leaked_blocks: u64,
    pub leaked_bytes: u64,
    pub alloc_failures: u64,
    pub realloc_failures: u64,
    pub null_frees: u64,
    pub links: u64,
    /// Inconsistencies left by dropped events; non-zero only for lossy logs.
    #[serde(default)]
    pub chain_gaps: u64,
    pub size_classes: Vec<SizeClassBucket>,
    pub metrics: MetricsSnapshot,
}

impl ReportSummary {
    /// Compute the statistics for an id-ordered, linked log.
    #[must_use]
    pub fn compute(
        records: &[AllocationRecord],
        chains: &ChainSummary,
        metrics: MetricsSnapshot,
    ) -> Self {
        let mut summary = Self {
            records: records.len() as u64,
            leaked_blocks: chains.leaked.len() as u64,
            leaked_bytes: chains.leaked_bytes,
            alloc_failures: chains.alloc_failures,
            realloc_failures: chains.realloc_failures,
            null_frees: chains.null_frees,
            links: chains.links,
            chain_gaps: chains.gaps,
            metrics,
            ..Self::default()
        };
        let mut histogram = SizeClassHistogram::new();
        let mut live: i128 = 0;
        let mut peak: i128 = 0;

        for record in records {
            match record.kind {
                RecordKind::Allocate => summary.allocations += 1,
                RecordKind::Free => summary.frees += 1,
                RecordKind::Reallocate => summary.reallocations += 1,
            }
            let opens = record.kind != RecordKind::Free && record.address != 0 && record.size > 0;
            if opens {
                histogram.add(record.size);
            }
            let delta = record.size_delta;
            if delta >= 0 {
                summary.bytes_allocated = summary.bytes_allocated.saturating_add(delta as u64);
            } else {
                summary.bytes_freed = summary.bytes_freed.saturating_add(delta.unsigned_abs());
            }
            live += i128::from(delta);
            peak = peak.max(live);
        }

        summary.peak_live_bytes = u64::try_from(peak).unwrap_or(u64::MAX);
        summary.size_classes = histogram.buckets();
        summary
    }
}

/// A complete profiling report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub start: Timestamp,
    pub annotation: String,
    #[serde(default)]
    pub summary: ReportSummary,
    pub allocations: Vec<ReportRecord>,
    pub stacks: Vec<ReportStack>,
}

impl Report {
    /// Build a report from a master store already linked by the chain builder.
    #[must_use]
    pub fn build(
        master: &MasterStore,
        chains: &ChainSummary,
        annotation: &str,
        symbolizer: &dyn Symbolizer,
    ) -> Self {
        Self {
            start: master.started(),
            annotation: annotation.to_string(),
            summary: ReportSummary::compute(master.records(), chains, master.metrics()),
            allocations: master.records().iter().map(ReportRecord::from).collect(),
            stacks: master
                .stacks()
                .iter()
                .map(|stack| ReportStack::resolve(stack, symbolizer))
                .collect(),
        }
    }

    /// Serialize as pretty-printed JSON followed by a newline.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), ReportError> {
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Write the report to `path`, replacing any existing file.
    pub fn save(&self, path: &Path) -> Result<(), ReportError> {
        let file = File::create(path)?;
        self.write_to(BufWriter::new(file))?;
        diag::emit_with(DiagLevel::Info, || {
            DiagEntry::new(DiagLevel::Info, "report_written").with_details(serde_json::json!({
                "path": path.display().to_string(),
                "records": self.allocations.len(),
                "stacks": self.stacks.len(),
            }))
        });
        Ok(())
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self, ReportError> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn load(path: &Path) -> Result<Self, ReportError> {
        let file = File::open(path)?;
        Self::read_from(BufReader::new(file))
    }

    /// Record with the given id.
    #[must_use]
    pub fn record(&self, id: u64) -> Option<&ReportRecord> {
        self.allocations
            .binary_search_by_key(&id, |r| r.id)
            .ok()
            .map(|idx| &self.allocations[idx])
    }

    /// Stack with the given id; `None` for 0 or unknown ids.
    #[must_use]
    pub fn stack(&self, id: u32) -> Option<&ReportStack> {
        if id == 0 {
            return None;
        }
        self.stacks.iter().find(|s| s.id == id)
    }
}

/// Hex-string (de)serialization for addresses. Plain integers are accepted
/// on input.
mod hex_address {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(address: &usize, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{address:#x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
        deserializer.deserialize_any(AddressVisitor)
    }

    struct AddressVisitor;

    impl Visitor<'_> for AddressVisitor {
        type Value = usize;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an address as a hex string or an integer")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<usize, E> {
            usize::try_from(v).map_err(|_| E::custom(format!("address {v:#x} out of range")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<usize, E> {
            let digits = v
                .strip_prefix("0x")
                .or_else(|| v.strip_prefix("0X"))
                .unwrap_or(v);
            usize::from_str_radix(digits, 16)
                .map_err(|_| E::custom(format!("invalid hex address {v:?}")))
        }
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            address: &Option<usize>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match address {
                Some(address) => super::serialize(address, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<usize>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapped(#[serde(with = "super")] usize);

            Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(a)| a))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::build_chains;
    use crate::session::ProfileSession;
    use crate::symbols::{RawSymbolizer, TableSymbolizer};

    fn linked_session() -> (MasterStore, ChainSummary) {
        let session = ProfileSession::new();
        let ctx = session.register_context();
        ctx.record_allocate(0x1000, 256, Some(&[0x10, 0x20]));
        ctx.record_reallocate(0x2000, 1024, 256, 0x1000, Some(&[0x10, 0x30]));
        ctx.record_allocate(0x3000, 64, Some(&[0x10, 0x20]));
        ctx.record_free(0x2000, 1024, None);
        ctx.record_allocate(0, 1 << 30, None);
        let mut master = session.merge_all();
        let chains = build_chains(&mut master).unwrap();
        (master, chains)
    }

    #[test]
    fn report_fields() {
        let (master, chains) = linked_session();
        let symbols = TableSymbolizer::new().with(0x10, "main+0x10");
        let report = Report::build(&master, &chains, "nightly \"A\"", &symbols);

        assert_eq!(report.annotation, "nightly \"A\"");
        assert_eq!(report.allocations.len(), 5);
        let realloc = &report.allocations[1];
        assert_eq!(realloc.state, RecordKind::Reallocate);
        assert_eq!(realloc.delta_size, 768);
        assert_eq!(realloc.reallocated_address, Some(0x1000));
        assert_eq!(realloc.prev_id, Some(1));
        assert_eq!(realloc.next_id, Some(4));
        assert_eq!(report.allocations[3].stack_id, 0);

        assert_eq!(report.stacks.len(), 2);
        let first = report.stack(1).unwrap();
        assert_eq!(first.occurrence_count, 2);
        assert_eq!(first.frames, vec!["main+0x10".to_string(), "??".to_string()]);
    }

    #[test]
    fn summary_statistics() {
        let (master, chains) = linked_session();
        let report = Report::build(&master, &chains, "", &RawSymbolizer);
        let s = &report.summary;
        assert_eq!((s.allocations, s.frees, s.reallocations), (3, 1, 1));
        assert_eq!(s.bytes_allocated, 256 + 768 + 64);
        assert_eq!(s.bytes_freed, 1024);
        assert_eq!(s.peak_live_bytes, 1024 + 64);
        assert_eq!(s.leaked_blocks, 1);
        assert_eq!(s.leaked_bytes, 64);
        assert_eq!(s.alloc_failures, 1);
        let counted: u64 = s.size_classes.iter().map(|b| b.count).sum();
        assert_eq!(counted, 3);
    }

    #[test]
    fn json_shape() {
        let (master, chains) = linked_session();
        let report = Report::build(&master, &chains, "x", &RawSymbolizer);
        let mut out = Vec::new();
        report.write_to(&mut out).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert!(json["start"]["seconds"].is_u64());
        assert_eq!(json["allocations"][0]["address"], "0x1000");
        assert_eq!(json["allocations"][0]["state"], "allocated");
        assert!(json["allocations"][0]["reallocated_address"].is_null());
        assert!(json["allocations"][0]["prev_id"].is_null());
        assert_eq!(json["allocations"][1]["state"], "realloc");
        assert_eq!(json["allocations"][3]["state"], "free");
        assert_eq!(json["stacks"][0]["frames"][0], "0x10");

        let back = Report::read_from(out.as_slice()).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn numeric_addresses_are_accepted() {
        let json = r#"{
            "id": 1, "address": 4096, "reallocated_address": "0X20", "size": 8,
            "delta_size": 8, "state": "realloc", "next_id": null, "prev_id": null,
            "stack_id": 0, "timestamp": {"seconds": 1, "nanoseconds": 2}
        }"#;
        let record: ReportRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.address, 0x1000);
        assert_eq!(record.reallocated_address, Some(0x20));
    }

    #[test]
    fn bad_address_is_rejected() {
        let json = r#"{"id": 1, "address": "zz", "size": 8, "delta_size": 8,
            "state": "allocated", "next_id": null, "prev_id": null, "stack_id": 0,
            "timestamp": {"seconds": 1, "nanoseconds": 2}}"#;
        assert!(serde_json::from_str::<ReportRecord>(json).is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Report::load(Path::new("/nonexistent/mprofile/report.json")).unwrap_err();
        assert!(matches!(err, ReportError::Io(_)));
    }
}
