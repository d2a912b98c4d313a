use crash_context::CrashContext;
use std::{any::Any, fmt};

/// Classification of a captured fault
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FaultCode {
    /// Invalid memory reference (`SIGSEGV`)
    AccessViolation,
    /// Access to the guard region at the bottom of the thread's stack
    StackOverflow,
    /// Integer division by zero (`SIGFPE`, `FPE_INTDIV`)
    DivideByZero,
    /// Any other arithmetic fault (`SIGFPE`)
    FloatingPoint,
    /// `SIGILL`
    IllegalInstruction,
    /// `SIGBUS`
    BusError,
    /// `SIGTRAP`, a breakpoint or debugger trap
    Breakpoint,
    /// `SIGABRT`, the process asked to be terminated
    NonContinuable,
    /// A fault signal that was sent by another thread or process rather than
    /// raised by the CPU
    ExternalBreak,
    /// A Rust panic unwound out of the guarded body
    Panic,
    /// A signal we don't know how to classify
    Unclassified,
}

impl FaultCode {
    /// Faults after which recovery is not meaningful, either because the stack
    /// is already gone, a debugger wants to see the fault, or someone outside
    /// asked for the process to stop.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::StackOverflow | Self::Breakpoint | Self::NonContinuable | Self::ExternalBreak
        )
    }

    /// The signal used when this code is simulated or re-raised
    pub fn signal(self) -> i32 {
        match self {
            Self::AccessViolation | Self::StackOverflow => libc::SIGSEGV,
            Self::DivideByZero | Self::FloatingPoint => libc::SIGFPE,
            Self::IllegalInstruction => libc::SIGILL,
            Self::BusError => libc::SIGBUS,
            Self::Breakpoint | Self::ExternalBreak => libc::SIGTRAP,
            Self::NonContinuable | Self::Panic | Self::Unclassified => libc::SIGABRT,
        }
    }

    /// Generic human readable description of the code
    pub fn description(self) -> &'static str {
        match self {
            Self::AccessViolation => "access violation",
            Self::StackOverflow => "stack overflow",
            Self::DivideByZero => "integer divide by zero",
            Self::FloatingPoint => "floating point exception",
            Self::IllegalInstruction => "illegal instruction",
            Self::BusError => "bus error",
            Self::Breakpoint => "breakpoint",
            Self::NonContinuable => "non-continuable exception (abort)",
            Self::ExternalBreak => "fault signal sent by another thread or process",
            Self::Panic => "panic",
            Self::Unclassified => "unclassified fault",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// The instruction pointer, stack pointer and frame pointer of a thread
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub ip: u64,
    pub sp: u64,
    pub fp: u64,
}

/// A copy of the faulting thread's stack, starting at the stack pointer at the
/// time of the fault.
///
/// The frames between the fault and the guarded scope are overwritten as soon
/// as the scope returns, so they are copied while still intact.
#[derive(Clone)]
pub struct StackSnapshot {
    /// Address of the first byte in `bytes`
    pub base: u64,
    pub bytes: Vec<u8>,
}

impl StackSnapshot {
    /// Reads a native endian `u64` at `addr`, if it lies entirely inside the
    /// snapshot
    pub fn read_u64(&self, addr: u64) -> Option<u64> {
        let offset = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        let bytes = self.bytes.get(offset..offset.checked_add(8)?)?;
        Some(u64::from_ne_bytes(bytes.try_into().ok()?))
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.bytes.len() as u64
    }
}

impl fmt::Debug for StackSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackSnapshot")
            .field("base", &format_args!("{:#x}", self.base))
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A fault that was intercepted inside a guarded scope.
///
/// Created by the bridge at the moment the fault is intercepted and never
/// modified afterwards.
pub struct CapturedException {
    code: FaultCode,
    signal: i32,
    si_code: i32,
    address: usize,
    pid: u32,
    tid: i32,
    context: Option<Box<CrashContext>>,
    stack: Option<StackSnapshot>,
    call_chain: Vec<u64>,
    message: Option<String>,
}

impl CapturedException {
    /// Creates an exception with no machine context, as if `code` was raised
    /// by the calling thread
    pub fn new(code: FaultCode) -> Self {
        Self {
            code,
            signal: code.signal(),
            si_code: 0,
            address: 0,
            pid: std::process::id(),
            tid: current_tid(),
            context: None,
            stack: None,
            call_chain: Vec::new(),
            message: None,
        }
    }

    /// Creates an exception with no machine context but a known message
    pub fn from_message(code: FaultCode, message: impl Into<String>) -> Self {
        let mut exception = Self::new(code);
        exception.message = Some(message.into()).filter(|m| !m.is_empty());
        exception
    }

    /// Converts a panic payload caught at the scope boundary
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let mut exception = Self::new(FaultCode::Panic);
        exception.message = drain_panic_message(payload.as_ref());
        exception
    }

    pub(crate) fn from_signal(
        code: FaultCode,
        signal: i32,
        si_code: i32,
        address: usize,
        context: Box<CrashContext>,
        stack: Option<StackSnapshot>,
    ) -> Self {
        Self {
            code,
            signal,
            si_code,
            address,
            pid: context.pid as u32,
            tid: context.tid,
            context: Some(context),
            stack,
            call_chain: Vec::new(),
            message: None,
        }
    }

    /// Adds what was recorded at the point of a panic, before the stack was
    /// unwound
    pub(crate) fn with_panic_site(
        mut self,
        context: Box<CrashContext>,
        stack: Option<StackSnapshot>,
        call_chain: Vec<u64>,
    ) -> Self {
        self.pid = context.pid as u32;
        self.tid = context.tid;
        self.context = Some(context);
        self.stack = stack;
        self.call_chain = call_chain;
        self
    }

    #[inline]
    pub fn code(&self) -> FaultCode {
        self.code
    }

    /// The raw signal number
    #[inline]
    pub fn signal(&self) -> i32 {
        self.signal
    }

    /// The raw `si_code` of the signal
    #[inline]
    pub fn si_code(&self) -> i32 {
        self.si_code
    }

    /// The faulting address, if the signal carries one
    #[inline]
    pub fn fault_address(&self) -> usize {
        self.address
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The kernel id of the faulting thread
    #[inline]
    pub fn tid(&self) -> i32 {
        self.tid
    }

    /// The machine context and signal record at the time of the fault. For a
    /// panic this is the state of the panicking thread before unwinding
    /// started, if the bridge's panic hook got to run.
    #[inline]
    pub fn context(&self) -> Option<&CrashContext> {
        self.context.as_deref()
    }

    #[inline]
    pub fn stack(&self) -> Option<&StackSnapshot> {
        self.stack.as_ref()
    }

    /// The return addresses of the frames that were live when a panic was
    /// raised, innermost first, starting at the frame that panicked.
    ///
    /// Only panics have one. It is recorded with the unwinder rather than by
    /// following frame pointers, so it stays complete through code built
    /// without them.
    #[inline]
    pub fn call_chain(&self) -> &[u64] {
        &self.call_chain
    }

    /// The registers of the faulting frame, if a machine context was captured
    pub fn registers(&self) -> Option<Registers> {
        self.context().map(Registers::from_context)
    }

    /// The message drained from the panic payload, if there was one
    #[inline]
    pub fn panic_message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.code.is_terminal()
    }

    /// The best description of the fault that is available
    pub fn message(&self) -> String {
        if let Some(msg) = &self.message {
            return msg.clone();
        }

        match self.code {
            FaultCode::AccessViolation | FaultCode::BusError | FaultCode::StackOverflow
                if self.address != 0 =>
            {
                format!("{} at address {:#x}", self.code, self.address)
            }
            code => code.description().to_owned(),
        }
    }
}

impl fmt::Debug for CapturedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedException")
            .field("code", &self.code)
            .field("signal", &self.signal)
            .field("si_code", &self.si_code)
            .field("address", &format_args!("{:#x}", self.address))
            .field("tid", &self.tid)
            .field("has_context", &self.context.is_some())
            .field("stack", &self.stack)
            .field("call_chain_len", &self.call_chain.len())
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for CapturedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (signal {}): {}", self.code, self.signal, self.message())
    }
}

impl std::error::Error for CapturedException {}

/// Attempts to get a textual message out of a panic payload. `panic!` only
/// ever produces a `&'static str` or a `String`, `Box<str>` shows up when a
/// payload is passed to `resume_unwind` by hand.
fn drain_panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<Box<str>>() {
        s.to_string()
    } else {
        return None;
    };

    (!msg.is_empty()).then_some(msg)
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        #[inline]
        fn current_tid() -> i32 {
            crate::linux::current_tid()
        }
    } else {
        #[inline]
        fn current_tid() -> i32 {
            0
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drains_known_payloads() {
        let caught = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(
            CapturedException::from_panic(caught).message(),
            "static message"
        );

        let caught = std::panic::catch_unwind(|| panic!("formatted {}", 42)).unwrap_err();
        assert_eq!(CapturedException::from_panic(caught).message(), "formatted 42");

        let boxed: Box<str> = "boxed".into();
        let exc = CapturedException::from_panic(Box::new(boxed));
        assert_eq!(exc.panic_message(), Some("boxed"));
    }

    #[test]
    fn falls_back_to_description() {
        let exc = CapturedException::from_panic(Box::new(12u32));
        assert_eq!(exc.code(), FaultCode::Panic);
        assert!(exc.panic_message().is_none());
        assert_eq!(exc.message(), "panic");

        let exc = CapturedException::from_panic(Box::new(String::new()));
        assert!(exc.panic_message().is_none());
    }

    #[test]
    fn terminal_codes() {
        for code in [
            FaultCode::StackOverflow,
            FaultCode::Breakpoint,
            FaultCode::NonContinuable,
            FaultCode::ExternalBreak,
        ] {
            assert!(code.is_terminal(), "{code:?}");
        }

        for code in [
            FaultCode::AccessViolation,
            FaultCode::DivideByZero,
            FaultCode::FloatingPoint,
            FaultCode::IllegalInstruction,
            FaultCode::BusError,
            FaultCode::Panic,
            FaultCode::Unclassified,
        ] {
            assert!(!code.is_terminal(), "{code:?}");
        }
    }

    #[test]
    fn snapshot_reads() {
        let mut bytes = vec![0u8; 32];
        bytes[8..16].copy_from_slice(&0xdead_beefu64.to_ne_bytes());
        let snapshot = StackSnapshot {
            base: 0x1000,
            bytes,
        };

        assert_eq!(snapshot.read_u64(0x1008), Some(0xdead_beef));
        assert_eq!(snapshot.read_u64(0x1000), Some(0));
        assert!(snapshot.read_u64(0x1019).is_none());
        assert!(snapshot.read_u64(0xff8).is_none());
        assert!(snapshot.contains(0x101f));
        assert!(!snapshot.contains(0x1020));
    }
}
