use crate::{
    CallStackEntry,
    debug_info::{self, DebugInfo, ModuleRecord, NativeDebugInfo},
    error::Error,
    memory::{ProcessMemory, SnapshotMemory},
    search_path::SearchPath,
    unwind::{FramePointerUnwinder, RecordedUnwinder, StackFrame, Unwind},
};
use fault_bridge::{CapturedException, Registers};
use parking_lot::Mutex;
use std::path::PathBuf;

/// Limits that guarantee a walk over a corrupt stack terminates
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WalkOptions {
    /// How many consecutive frames may return to their own address before the
    /// walk is aborted
    pub max_recursion: usize,
    /// The maximum number of frames collected
    pub max_frames: usize,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            max_recursion: 1000,
            max_frames: 1024,
        }
    }
}

impl WalkOptions {
    pub fn with_max_recursion(mut self, max_recursion: usize) -> Self {
        self.max_recursion = max_recursion;
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }
}

struct SessionState {
    provider: Box<dyn DebugInfo>,
    explicit_path: Option<PathBuf>,
    search_path: SearchPath,
    modules: Vec<ModuleRecord>,
    loaded: bool,
}

impl SessionState {
    fn load_modules(&mut self) -> Result<usize, Error> {
        if self.loaded {
            return Ok(self.modules.len());
        }

        let search_path = SearchPath::from_env(self.explicit_path.as_deref());
        log::debug!("symbol search path: {search_path}");

        let mut modules = self.provider.enumerate_modules()?;
        for module in &mut modules {
            module.debug_file = debug_info::find_debug_file(module, search_path.dirs());
        }

        log::debug!("loaded {} modules", modules.len());

        self.search_path = search_path;
        self.modules = modules;
        self.loaded = true;

        Ok(self.modules.len())
    }

    fn entry(&mut self, frame: &StackFrame, index: usize) -> CallStackEntry {
        // Return addresses point at the instruction after the call, which may
        // already belong to the next line or even function
        let lookup = if index == 0 {
            frame.pc
        } else {
            frame.pc.saturating_sub(1)
        };

        let module = self
            .modules
            .iter()
            .find(|module| module.contains(lookup))
            .cloned();
        let resolution = self.provider.resolve(lookup, module.as_ref());

        CallStackEntry {
            address: frame.pc,
            symbol: resolution.symbol,
            line: resolution.line,
            module,
        }
    }
}

/// The process wide debug information state.
///
/// Everything is behind one lock, so walks from different threads are
/// serialized.
pub struct SymbolSession {
    state: Mutex<SessionState>,
    options: WalkOptions,
}

impl SymbolSession {
    /// Creates a session that resolves addresses of the calling process
    pub fn new(explicit_path: Option<PathBuf>, options: WalkOptions) -> Self {
        Self::with_provider(Box::new(NativeDebugInfo::new()), explicit_path, options)
    }

    pub fn with_provider(
        provider: Box<dyn DebugInfo>,
        explicit_path: Option<PathBuf>,
        options: WalkOptions,
    ) -> Self {
        Self {
            state: Mutex::new(SessionState {
                provider,
                explicit_path,
                search_path: SearchPath::default(),
                modules: Vec::new(),
                loaded: false,
            }),
            options,
        }
    }

    #[inline]
    pub fn options(&self) -> WalkOptions {
        self.options
    }

    /// Builds the search path and enumerates modules, only the first
    /// successful call does anything. Returns the number of modules.
    pub fn load_modules(&self) -> Result<usize, Error> {
        self.state.lock().load_modules()
    }

    /// The search path built by [`Self::load_modules`], empty before then
    pub fn search_path(&self) -> SearchPath {
        self.state.lock().search_path.clone()
    }

    pub fn modules(&self) -> Vec<ModuleRecord> {
        self.state.lock().modules.clone()
    }

    /// Walks the stack from `start`, innermost frame first.
    ///
    /// This never fails, a walk that can't continue returns the frames that
    /// were collected so far.
    pub fn walk(&self, unwinder: &mut dyn Unwind, start: StackFrame) -> Vec<CallStackEntry> {
        let mut state = self.state.lock();

        if let Err(err) = state.load_modules() {
            log::warn!("failed to load modules, module information will be missing: {err}");
        }

        let mut entries = Vec::new();
        let mut frame = start;
        let mut repeats = 0;

        while entries.len() < self.options.max_frames {
            if let Err(err) = unwinder.step(&mut frame) {
                log::debug!("stack walk ended after {} frames: {err}", entries.len());
                break;
            }

            if frame.pc == frame.return_address {
                repeats += 1;
                if repeats > self.options.max_recursion {
                    log::warn!(
                        "aborting stack walk, frame {:#x} returned to itself {repeats} times",
                        frame.pc
                    );
                    break;
                }
            } else {
                repeats = 0;
            }

            let entry = state.entry(&frame, entries.len());
            entries.push(entry);

            if frame.return_address == 0 {
                break;
            }
        }

        entries
    }

    /// Walks the stack of a captured exception, or of the calling thread if
    /// there is none
    pub fn walk_exception(&self, exception: Option<&CapturedException>) -> Vec<CallStackEntry> {
        self.walk_process(exception, std::process::id())
    }

    /// Walks the stack of a captured exception, reading memory from `pid`, or
    /// the stack of the calling thread if there is no exception.
    #[inline(never)]
    pub fn walk_process(
        &self,
        exception: Option<&CapturedException>,
        pid: u32,
    ) -> Vec<CallStackEntry> {
        let process = ProcessMemory::new(pid);

        match exception {
            Some(exc) if !exc.call_chain().is_empty() => {
                let mut unwinder = RecordedUnwinder::new(exc.call_chain());
                let start = unwinder.start();
                self.walk(&mut unwinder, start)
            }
            Some(exc) => {
                let Some(regs) = exc.registers() else {
                    log::debug!("no machine context to walk for {exc}");
                    return Vec::new();
                };

                let mut unwinder = FramePointerUnwinder::new(SnapshotMemory::new(exc.stack(), process));
                self.walk(&mut unwinder, regs.into())
            }
            None => {
                if pid != std::process::id() {
                    log::warn!("unable to walk the live stack of another process ({pid})");
                    return Vec::new();
                }

                // The context has to be captured in this frame, the frame of
                // any function that captured it on our behalf would already be
                // gone by the time we walk it
                // SAFETY: plain old data, filled in by getcontext
                let context = unsafe {
                    let mut context: Box<crash_context::CrashContext> = Box::new(std::mem::zeroed());
                    crash_context::crash_context_getcontext(&mut context.context);
                    context
                };

                let start = StackFrame::from(Registers::from_context(&context));
                let mut unwinder = FramePointerUnwinder::new(process);
                self.walk(&mut unwinder, start)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        debug_info::{LineInfo, Resolution, SymbolInfo},
        error::UnwindError,
    };

    /// Replays a fixed list of frames
    struct ScriptedUnwinder {
        frames: Vec<StackFrame>,
        next: usize,
        steps: usize,
    }

    impl ScriptedUnwinder {
        fn new(frames: Vec<StackFrame>) -> Self {
            Self {
                frames,
                next: 0,
                steps: 0,
            }
        }
    }

    impl Unwind for ScriptedUnwinder {
        fn step(&mut self, frame: &mut StackFrame) -> Result<(), UnwindError> {
            self.steps += 1;
            let next = self.frames.get(self.next).ok_or(UnwindError::Read(0))?;
            *frame = *next;
            self.next += 1;
            Ok(())
        }
    }

    /// Always hands out the same self referential frame
    struct LoopingUnwinder {
        steps: usize,
    }

    impl Unwind for LoopingUnwinder {
        fn step(&mut self, frame: &mut StackFrame) -> Result<(), UnwindError> {
            self.steps += 1;
            frame.pc = 0x4000;
            frame.return_address = 0x4000;
            Ok(())
        }
    }

    /// Knows one module, and a symbol only for one address
    struct FakeDebugInfo;

    impl DebugInfo for FakeDebugInfo {
        fn enumerate_modules(&mut self) -> Result<Vec<ModuleRecord>, Error> {
            Ok(vec![ModuleRecord::new("/opt/host/plugin.so", 0x1000, 0x1000)])
        }

        fn resolve(&mut self, addr: u64, module: Option<&ModuleRecord>) -> Resolution {
            assert!(module.is_none_or(|module| module.contains(addr)));

            if addr == 0x1100 {
                Resolution {
                    symbol: Some(SymbolInfo::new("plugin_entry", 0x10)),
                    line: Some(LineInfo {
                        file: "src/plugin.rs".into(),
                        line: Some(42),
                    }),
                }
            } else {
                Resolution::default()
            }
        }
    }

    struct BrokenDebugInfo;

    impl DebugInfo for BrokenDebugInfo {
        fn enumerate_modules(&mut self) -> Result<Vec<ModuleRecord>, Error> {
            Err(Error::NoModules)
        }

        fn resolve(&mut self, _addr: u64, _module: Option<&ModuleRecord>) -> Resolution {
            Resolution::default()
        }
    }

    fn fake_session(options: WalkOptions) -> SymbolSession {
        SymbolSession::with_provider(Box::new(FakeDebugInfo), None, options)
    }

    fn frame(pc: u64, return_address: u64) -> StackFrame {
        StackFrame {
            pc,
            return_address,
            ..Default::default()
        }
    }

    #[test]
    fn self_referential_frames_terminate() {
        let session = fake_session(WalkOptions::default().with_max_recursion(10));
        let mut unwinder = LoopingUnwinder { steps: 0 };

        let entries = session.walk(&mut unwinder, StackFrame::default());
        assert_eq!(entries.len(), 10);
        assert_eq!(unwinder.steps, 11);

        // The default limit is also honored, and below the frame limit
        let session = fake_session(WalkOptions::default().with_max_frames(usize::MAX));
        let mut unwinder = LoopingUnwinder { steps: 0 };

        let entries = session.walk(&mut unwinder, StackFrame::default());
        assert_eq!(entries.len(), 1000);
        assert_eq!(unwinder.steps, 1001);
    }

    #[test]
    fn repeats_must_be_consecutive() {
        let session = fake_session(WalkOptions::default().with_max_recursion(1));
        let mut unwinder = ScriptedUnwinder::new(vec![
            frame(0x1100, 0x1100),
            frame(0x1100, 0x1200),
            frame(0x1200, 0x1200),
            frame(0x1200, 0x1300),
            frame(0x1300, 0),
        ]);

        let entries = session.walk(&mut unwinder, StackFrame::default());
        assert_eq!(entries.len(), 5);
    }

    #[test]
    fn frame_limit() {
        let session = fake_session(WalkOptions::default().with_max_frames(3));
        let mut unwinder = LoopingUnwinder { steps: 0 };

        assert_eq!(session.walk(&mut unwinder, StackFrame::default()).len(), 3);
    }

    #[test]
    fn clean_end_of_stack() {
        let session = fake_session(WalkOptions::default());
        let mut unwinder = ScriptedUnwinder::new(vec![
            frame(0x1100, 0x1201),
            frame(0x1201, 0x1301),
            frame(0x1301, 0),
            frame(0x9999, 0x9999),
        ]);

        let entries = session.walk(&mut unwinder, StackFrame::default());
        assert_eq!(entries.len(), 3);
        assert_eq!(unwinder.steps, 3);
        assert_eq!(entries[2].address, 0x1301);
    }

    #[test]
    fn failing_first_step() {
        let session = fake_session(WalkOptions::default());
        let mut unwinder = ScriptedUnwinder::new(Vec::new());

        assert!(session.walk(&mut unwinder, StackFrame::default()).is_empty());
    }

    #[test]
    fn partial_resolution() {
        let session = fake_session(WalkOptions::default());
        let mut unwinder =
            ScriptedUnwinder::new(vec![frame(0x1100, 0x1801), frame(0x1801, 0x5001), frame(0x5001, 0)]);

        let entries = session.walk(&mut unwinder, StackFrame::default());
        assert_eq!(entries.len(), 3);

        let known = &entries[0];
        assert_eq!(known.symbol_name(), Some("plugin_entry"));
        assert_eq!(known.module_name(), Some("plugin.so"));
        assert_eq!(
            known.to_string(),
            "plugin_entry [File=src/plugin.rs:42] [in plugin.so]"
        );

        // Known module, unknown symbol
        let unknown_symbol = &entries[1];
        assert!(unknown_symbol.symbol.is_none());
        assert!(unknown_symbol.line.is_none());
        assert_eq!(unknown_symbol.module_name(), Some("plugin.so"));
        assert_eq!(
            unknown_symbol.to_string(),
            "0x1801 [File=not available] [in plugin.so]"
        );

        // Nothing known at all
        assert_eq!(
            entries[2].to_string(),
            "0x5001 [File=not available] [in not available]"
        );
    }

    #[test]
    fn loads_once() {
        let session = fake_session(WalkOptions::default());
        assert!(session.modules().is_empty());

        assert_eq!(session.load_modules().unwrap(), 1);
        assert_eq!(session.load_modules().unwrap(), 1);
        assert_eq!(session.modules()[0].name, "plugin.so");
        assert!(!session.search_path().dirs().is_empty());
    }

    #[test]
    fn walks_without_modules() {
        let session =
            SymbolSession::with_provider(Box::new(BrokenDebugInfo), None, WalkOptions::default());
        assert!(session.load_modules().is_err());

        let mut unwinder = ScriptedUnwinder::new(vec![frame(0x1100, 0)]);
        let entries = session.walk(&mut unwinder, StackFrame::default());
        assert_eq!(entries.len(), 1);
        assert!(entries[0].module.is_none());

        // Still not loaded, the next walk tries again
        assert!(session.load_modules().is_err());
    }
}
