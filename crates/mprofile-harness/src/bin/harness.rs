//! CLI entrypoint for mprofile report analysis.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mprofile_harness::{LoadedReport, analysis};

/// Analysis tooling for mprofile reports.
#[derive(Debug, Parser)]
#[command(name = "mprofile-harness")]
#[command(about = "Inspect allocation reports written by mprofile")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print every allocation chain.
    Chains {
        /// Report JSON written at shutdown.
        #[arg(long)]
        report: PathBuf,
        /// Stop after this many chains.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List blocks never released, with their stacks.
    Leaks {
        #[arg(long)]
        report: PathBuf,
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// List failed allocations and reallocations.
    Failures {
        #[arg(long)]
        report: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print counts, byte totals and the report digest.
    Summary {
        #[arg(long)]
        report: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Check link symmetry, id ordering and stack references.
    Verify {
        #[arg(long)]
        report: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Chains { report, limit } => {
            let loaded = LoadedReport::load(&report)?;
            let chains = analysis::chains(&loaded.report)?;
            for chain in chains.iter().take(limit.unwrap_or(usize::MAX)) {
                println!("{}", chain.render());
            }
        }
        Command::Leaks { report, json } => {
            let loaded = LoadedReport::load(&report)?;
            let leaks = analysis::leaks(&loaded.report);
            if json {
                println!("{}", serde_json::to_string_pretty(&leaks)?);
            } else {
                for leak in &leaks {
                    let record = leak.record;
                    println!(
                        "record {} at {:#x}: {} bytes ({})",
                        record.id,
                        record.address,
                        record.size,
                        record.state.state()
                    );
                    if let Some(stack) = leak.stack {
                        for frame in &stack.frames {
                            println!("    {frame}");
                        }
                    }
                }
                eprintln!("{} leaked block(s)", leaks.len());
            }
        }
        Command::Failures { report, json } => {
            let loaded = LoadedReport::load(&report)?;
            let failures = analysis::failures(&loaded.report);
            if json {
                println!("{}", serde_json::to_string_pretty(&failures)?);
            } else {
                for record in &failures {
                    println!(
                        "record {}: {} of {} bytes failed",
                        record.id,
                        record.state.state(),
                        record.size
                    );
                }
                eprintln!("{} failure(s)", failures.len());
            }
        }
        Command::Summary { report, json } => {
            let loaded = LoadedReport::load(&report)?;
            let overview = analysis::summary(&loaded);
            if json {
                println!("{}", serde_json::to_string_pretty(&overview)?);
            } else {
                println!("report:          {}", overview.path.display());
                println!("sha256:          {}", overview.sha256);
                println!("annotation:      {}", overview.annotation);
                println!("records:         {}", overview.records);
                println!(
                    "  allocated/free/realloc: {}/{}/{}",
                    overview.allocations, overview.frees, overview.reallocations
                );
                println!("bytes allocated: {}", overview.bytes_allocated);
                println!("bytes freed:     {}", overview.bytes_freed);
                println!("peak live:       {}", overview.peak_live_bytes);
                println!(
                    "leaked:          {} block(s), {} bytes",
                    overview.leaked_blocks, overview.leaked_bytes
                );
                println!("failures:        {}", overview.failures);
                println!("stacks:          {}", overview.stacks);
            }
        }
        Command::Verify { report, json } => {
            let loaded = LoadedReport::load(&report)?;
            let violations = analysis::verify(&loaded.report);
            if json {
                println!("{}", serde_json::to_string_pretty(&violations)?);
            } else {
                for violation in &violations {
                    println!("{violation}");
                }
            }
            if !violations.is_empty() {
                return Err(
                    format!("{} violation(s) in {}", violations.len(), report.display()).into(),
                );
            }
            eprintln!("{}: consistent", report.display());
        }
    }

    Ok(())
}
