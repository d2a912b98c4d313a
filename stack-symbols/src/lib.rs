//! Resolves the stack of a captured fault, or of the calling thread, into a
//! list of [`CallStackEntry`], innermost frame first.
//!
//! Walking uses the frame pointer chain, so code should be built with frame
//! pointers for complete traces. Every part of a frame's resolution (symbol,
//! source line, module) is optional, a frame that can't be resolved is still
//! reported with its address.

mod debug_info;
mod error;
mod memory;
mod search_path;
mod session;
mod unwind;

pub use debug_info::{
    DebugInfo, LineInfo, ModuleRecord, NativeDebugInfo, Resolution, SymbolInfo,
};
pub use error::{Error, UnwindError};
pub use memory::{ProcessMemory, ReadMemory, SnapshotMemory};
pub use search_path::{ALT_SEARCH_PATH_VAR, SEARCH_PATH_VAR, SYSTEM_DEBUG_DIR, SearchPath};
pub use session::{SymbolSession, WalkOptions};
pub use unwind::{FramePointerUnwinder, RecordedUnwinder, StackFrame, Unwind};

use std::fmt;

/// Placeholder for anything that could not be resolved
pub const NOT_AVAILABLE: &str = "not available";

/// One resolved stack frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallStackEntry {
    /// The code address of the frame
    pub address: u64,
    pub symbol: Option<SymbolInfo>,
    pub line: Option<LineInfo>,
    pub module: Option<ModuleRecord>,
}

impl CallStackEntry {
    /// The demangled symbol name
    #[inline]
    pub fn symbol_name(&self) -> Option<&str> {
        self.symbol.as_ref().map(|sym| sym.demangled.as_str())
    }

    #[inline]
    pub fn module_name(&self) -> Option<&str> {
        self.module.as_ref().map(|module| module.name.as_str())
    }
}

/// Renders `<symbol-or-address> [File=<path>:<line>] [in <module>]`
impl fmt::Display for CallStackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.symbol_name() {
            Some(name) => f.write_str(name)?,
            None => write!(f, "{:#x}", self.address)?,
        }

        match &self.line {
            Some(LineInfo {
                file,
                line: Some(line),
            }) => write!(f, " [File={}:{line}]", file.display())?,
            Some(LineInfo { file, line: None }) => write!(f, " [File={}]", file.display())?,
            None => write!(f, " [File={NOT_AVAILABLE}]")?,
        }

        write!(f, " [in {}]", self.module_name().unwrap_or(NOT_AVAILABLE))
    }
}

/// Formats a trace, one line per frame
pub fn format_trace(entries: &[CallStackEntry]) -> String {
    use std::fmt::Write;

    let mut trace = String::new();
    for entry in entries {
        let _ = writeln!(trace, "{entry}");
    }
    trace
}
