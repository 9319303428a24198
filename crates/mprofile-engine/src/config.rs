//! Runtime configuration.
//!
//! Read once from the environment and cached:
//! - `MPROFILE_OUTF`: report output path. Unset means no report is written.
//! - `MPROFILE_ANNOTATION`: free-form text embedded in the report.
//! - `MPROFILE_STACKS`: `on` (default) or `off` to skip stack capture.
//! - `MPROFILE_STACK_DEPTH`: frames kept per capture, 1 to 64 (default 64).
//! - `MPROFILE_GUARD`: `strict` (default) aborts on a corrupted memory header,
//!   `off` skips validation.
//! - `MPROFILE_SYMBOLS`: `on` (default) resolves frame addresses when the
//!   report is written, `off` prints raw addresses.
//! - `MPROFILE_LOG`: diagnostics file (stderr when unset).
//! - `MPROFILE_LOG_LEVEL`: minimum diagnostics level (default `warn`).

use std::path::PathBuf;
use std::sync::OnceLock;

use crate::diag::DiagLevel;
use crate::stack::MAX_STACK_DEPTH;

/// What to do with memory headers on free/realloc.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardMode {
    /// Validate every header; a mismatch aborts the process.
    #[default]
    Strict,
    /// Headers are still written (sizes come from them) but never validated.
    Off,
}

impl GuardMode {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" | "0" => Self::Off,
            _ => Self::Strict,
        }
    }

    #[must_use]
    pub const fn validates(self) -> bool {
        matches!(self, Self::Strict)
    }
}

/// Everything the profiler reads from its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerConfig {
    pub output_path: Option<PathBuf>,
    pub annotation: String,
    pub capture_stacks: bool,
    pub stack_depth: usize,
    pub guard: GuardMode,
    pub resolve_symbols: bool,
    pub log_path: Option<PathBuf>,
    pub log_level: DiagLevel,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            output_path: None,
            annotation: String::new(),
            capture_stacks: true,
            stack_depth: MAX_STACK_DEPTH,
            guard: GuardMode::Strict,
            resolve_symbols: true,
            log_path: None,
            log_level: DiagLevel::Warn,
        }
    }
}

impl ProfilerConfig {
    /// Read the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            output_path: non_empty("MPROFILE_OUTF").map(PathBuf::from),
            annotation: lookup("MPROFILE_ANNOTATION").unwrap_or_default(),
            capture_stacks: non_empty("MPROFILE_STACKS")
                .and_then(|v| parse_switch(&v))
                .unwrap_or(defaults.capture_stacks),
            stack_depth: non_empty("MPROFILE_STACK_DEPTH")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .map_or(defaults.stack_depth, |d| d.clamp(1, MAX_STACK_DEPTH)),
            guard: non_empty("MPROFILE_GUARD")
                .map_or(defaults.guard, |v| GuardMode::from_str_loose(&v)),
            resolve_symbols: non_empty("MPROFILE_SYMBOLS")
                .and_then(|v| parse_switch(&v))
                .unwrap_or(defaults.resolve_symbols),
            log_path: non_empty("MPROFILE_LOG").map(PathBuf::from),
            log_level: non_empty("MPROFILE_LOG_LEVEL")
                .map_or(defaults.log_level, |v| DiagLevel::from_str_loose(&v)),
        }
    }
}

/// Parse an on/off switch; `None` for anything unrecognized.
#[must_use]
pub fn parse_switch(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "on" | "1" | "yes" | "true" | "enabled" => Some(true),
        "off" | "0" | "no" | "false" | "disabled" => Some(false),
        _ => None,
    }
}

static GLOBAL_CONFIG: OnceLock<ProfilerConfig> = OnceLock::new();

/// The process configuration (reads the environment on first call).
#[must_use]
pub fn config() -> &'static ProfilerConfig {
    GLOBAL_CONFIG.get_or_init(ProfilerConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(ProfilerConfig::from_lookup(|_| None), ProfilerConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let cfg = ProfilerConfig::from_lookup(lookup(&[
            ("MPROFILE_OUTF", "/tmp/out.json"),
            ("MPROFILE_ANNOTATION", "run \"7\""),
            ("MPROFILE_STACKS", "OFF"),
            ("MPROFILE_STACK_DEPTH", "12"),
            ("MPROFILE_GUARD", "off"),
            ("MPROFILE_SYMBOLS", "no"),
            ("MPROFILE_LOG", "/tmp/mprofile.log"),
            ("MPROFILE_LOG_LEVEL", "debug"),
        ]));
        assert_eq!(cfg.output_path, Some(PathBuf::from("/tmp/out.json")));
        assert_eq!(cfg.annotation, "run \"7\"");
        assert!(!cfg.capture_stacks);
        assert_eq!(cfg.stack_depth, 12);
        assert_eq!(cfg.guard, GuardMode::Off);
        assert!(!cfg.resolve_symbols);
        assert_eq!(cfg.log_path, Some(PathBuf::from("/tmp/mprofile.log")));
        assert_eq!(cfg.log_level, DiagLevel::Debug);
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let cfg = ProfilerConfig::from_lookup(lookup(&[
            ("MPROFILE_OUTF", "   "),
            ("MPROFILE_STACKS", "maybe"),
            ("MPROFILE_STACK_DEPTH", "lots"),
            ("MPROFILE_GUARD", "bogus"),
        ]));
        assert_eq!(cfg.output_path, None);
        assert!(cfg.capture_stacks);
        assert_eq!(cfg.stack_depth, MAX_STACK_DEPTH);
        assert_eq!(cfg.guard, GuardMode::Strict);
    }

    #[test]
    fn stack_depth_is_clamped() {
        let deep = ProfilerConfig::from_lookup(lookup(&[("MPROFILE_STACK_DEPTH", "4096")]));
        assert_eq!(deep.stack_depth, MAX_STACK_DEPTH);
        let zero = ProfilerConfig::from_lookup(lookup(&[("MPROFILE_STACK_DEPTH", "0")]));
        assert_eq!(zero.stack_depth, 1);
    }

    #[test]
    fn switches() {
        assert_eq!(parse_switch(" On "), Some(true));
        assert_eq!(parse_switch("0"), Some(false));
        assert_eq!(parse_switch("?"), None);
        assert!(GuardMode::Strict.validates());
        assert!(!GuardMode::from_str_loose("NONE").validates());
    }
}
