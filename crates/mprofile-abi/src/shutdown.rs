//! End-of-run processing: merge, link, report.

use std::path::PathBuf;

use mprofile_engine::diag::{self, DiagEntry, DiagLevel};
use mprofile_engine::{ChainError, Report, ReportError, build_chains, symbols};

use crate::context::ReentrancyGuard;
use crate::state::try_collector;

/// What [`finish`] did.
#[derive(Debug)]
pub struct FinishOutcome {
    /// Records in the merged log.
    pub records: usize,
    /// Blocks never released.
    pub leaked_blocks: usize,
    /// Where the report went, if one was requested.
    pub report_path: Option<PathBuf>,
    /// Set when the report could not be written; the run's results are lost.
    pub report_error: Option<ReportError>,
}

/// Stop collecting, merge every context, link chains and write the report
/// to the configured path.
///
/// Returns `None` if collection already stopped. A chain violation means the
/// log cannot describe a real heap: it is logged as fatal and the process
/// aborts.
pub fn finish() -> Option<FinishOutcome> {
    // Everything below allocates; none of it belongs in the log. A caller
    // already inside the profiler still gets to finish.
    let _guard = ReentrancyGuard::enter();
    let collector = try_collector()?;
    if !collector.stop() {
        return None;
    }

    let mut master = collector.session().merge_all();
    let chains = match build_chains(&mut master) {
        Ok(chains) => chains,
        Err(err) => chain_violation(&err),
    };
    diag::emit_with(DiagLevel::Info, || {
        DiagEntry::new(DiagLevel::Info, "chain_complete").with_details(serde_json::json!({
            "links": chains.links,
            "leaked": chains.leaked.len(),
            "alloc_failures": chains.alloc_failures,
            "realloc_failures": chains.realloc_failures,
        }))
    });

    let config = collector.config();
    let mut outcome = FinishOutcome {
        records: master.records().len(),
        leaked_blocks: chains.leaked.len(),
        report_path: config.output_path.clone(),
        report_error: None,
    };

    if let Some(path) = &config.output_path {
        let symbolizer = symbols::for_config(config.resolve_symbols);
        let report = Report::build(&master, &chains, &config.annotation, symbolizer.as_ref());
        if let Err(err) = report.save(path) {
            diag::emit(
                &DiagEntry::new(DiagLevel::Error, "report_failed").with_details(
                    serde_json::json!({
                        "path": path.display().to_string(),
                        "error": err.to_string(),
                    }),
                ),
            );
            outcome.report_error = Some(err);
        }
    }
    diag::flush();
    Some(outcome)
}

fn chain_violation(err: &ChainError) -> ! {
    diag::emit(
        &DiagEntry::new(DiagLevel::Fatal, "chain_violation")
            .with_address(err.address())
            .with_record(err.record_id())
            .with_details(serde_json::json!({ "error": err.to_string() })),
    );
    diag::flush();
    std::process::abort();
}
