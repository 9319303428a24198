//! Offline analysis of mprofile reports.
//!
//! This crate provides:
//! - Chain walks: each block's lifetime rendered from its `next_id` links
//! - Leak and failure listings with the originating stacks
//! - Summaries with the report file's SHA-256
//! - Link verification: ordering, symmetry and stack references

#![forbid(unsafe_code)]

pub mod analysis;

pub use analysis::{
    AnalysisError, Chain, ChainStep, Leak, LoadedReport, Overview, Violation, chains, failures,
    leaks, sha256_hex, summary, verify,
};
