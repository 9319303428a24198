//! Frame address resolution for report emission.
//!
//! A [`Symbolizer`] is created right before the report is written and dropped
//! afterwards; nothing in the engine holds one across the session.

use std::collections::HashMap;

#[cfg(feature = "symbols")]
use parking_lot::Mutex;

/// Printed for frames that cannot be resolved.
pub const UNRESOLVED: &str = "??";

/// Translates raw frame addresses into display strings.
pub trait Symbolizer {
    /// Best-effort resolution of `address`; `None` when nothing is known.
    fn resolve(&self, address: u64) -> Option<String>;

    /// Display string for `address`, never failing.
    fn display(&self, address: u64) -> String {
        self.resolve(address)
            .unwrap_or_else(|| UNRESOLVED.to_string())
    }
}

/// Prints every frame as a hex address.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSymbolizer;

impl Symbolizer for RawSymbolizer {
    fn resolve(&self, address: u64) -> Option<String> {
        Some(format!("{address:#x}"))
    }
}

/// Resolves through the process's own debug info, caching each address.
#[cfg(feature = "symbols")]
#[derive(Debug, Default)]
pub struct BacktraceSymbolizer {
    cache: Mutex<HashMap<u64, Option<String>>>,
}

#[cfg(feature = "symbols")]
impl BacktraceSymbolizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(address: u64) -> Option<String> {
        let ip = usize::try_from(address).ok()? as *mut std::ffi::c_void;
        let mut resolved = None;
        backtrace::resolve(ip, |symbol| {
            if resolved.is_some() {
                return;
            }
            let Some(name) = symbol.name() else {
                return;
            };
            let mut text = match symbol.addr() {
                Some(start) => {
                    let offset = address.saturating_sub(start as usize as u64);
                    format!("{name:#}+{offset:#x}")
                }
                None => format!("{name:#}"),
            };
            if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                text.push_str(&format!(" ({}:{line})", file.display()));
            }
            resolved = Some(text);
        });
        resolved
    }
}

#[cfg(feature = "symbols")]
impl Symbolizer for BacktraceSymbolizer {
    fn resolve(&self, address: u64) -> Option<String> {
        if let Some(hit) = self.cache.lock().get(&address) {
            return hit.clone();
        }
        let resolved = Self::lookup(address);
        self.cache.lock().insert(address, resolved.clone());
        resolved
    }
}

/// Symbolizer matching the `resolve_symbols` switch.
#[must_use]
pub fn for_config(resolve_symbols: bool) -> Box<dyn Symbolizer> {
    #[cfg(feature = "symbols")]
    {
        if resolve_symbols {
            return Box::new(BacktraceSymbolizer::new());
        }
    }
    let _ = resolve_symbols;
    Box::new(RawSymbolizer)
}

/// Fixed answers, for tests and offline tooling.
#[derive(Debug, Default)]
pub struct TableSymbolizer {
    names: HashMap<u64, String>,
}

impl TableSymbolizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, address: u64, name: impl Into<String>) -> Self {
        self.names.insert(address, name.into());
        self
    }
}

impl Symbolizer for TableSymbolizer {
    fn resolve(&self, address: u64) -> Option<String> {
        self.names.get(&address).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_prints_hex() {
        assert_eq!(RawSymbolizer.display(0x4010ab), "0x4010ab");
    }

    #[test]
    fn unknown_frames_get_placeholder() {
        let table = TableSymbolizer::new().with(0x10, "main+0x4");
        assert_eq!(table.display(0x10), "main+0x4");
        assert_eq!(table.display(0x20), UNRESOLVED);
    }

    #[test]
    fn disabled_symbols_fall_back_to_raw() {
        assert_eq!(for_config(false).display(0xabc), "0xabc");
    }

    #[cfg(feature = "symbols")]
    #[test]
    fn backtrace_symbolizer_never_fails() {
        let symbolizer = BacktraceSymbolizer::new();
        // Address 1 is never mapped to code.
        assert_eq!(symbolizer.display(1), UNRESOLVED);
        assert_eq!(symbolizer.display(1), UNRESOLVED);
        assert_eq!(symbolizer.cache.lock().len(), 1);
    }
}
