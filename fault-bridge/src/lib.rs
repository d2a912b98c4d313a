//! [`ExceptionBridge`] turns hardware faults raised while running a piece of
//! code into ordinary Rust errors, so that the caller can inspect, report and
//! survive them instead of taking the whole host process down.
//!
//! # Linux
//!
//! Faults are delivered as [signals](https://man7.org/linux/man-pages/man7/signal.7.html).
//! While attached, the bridge handles the following
//!
//! ## `SIGABRT`
//!
//! Sent when the process calls `abort`, or by another process. Recovery is not
//! meaningful, the resulting [`CapturedException`] is classified as
//! [`FaultCode::NonContinuable`].
//!
//! ## `SIGBUS`
//!
//! A [bus error](https://en.wikipedia.org/wiki/Bus_error).
//!
//! ## `SIGFPE`
//!
//! An erroneous arithmetic operation, integer division by zero included.
//!
//! ## `SIGILL`
//!
//! An attempt to execute an illegal, malformed, unknown, or privileged,
//! instruction.
//!
//! ## `SIGSEGV`
//!
//! An invalid virtual memory reference. A fault inside the guard region at the
//! bottom of the thread stack is reported as [`FaultCode::StackOverflow`].
//!
//! ## `SIGTRAP`
//!
//! A trap, eg. a breakpoint. Reported as [`FaultCode::Breakpoint`] so that an
//! attached debugger gets to see it again.
//!
//! Signals are handled process wide, but only faults raised on a thread that is
//! currently inside a scope installed via [`FaultInterceptor`] are converted.
//! Anything else is forwarded to whatever handler was installed before the
//! bridge was attached, or to the default disposition.
//!
//! Converting a fault works by saving a jump point with `sigsetjmp` when the
//! scope is entered and jumping back to it with `siglongjmp` from the signal
//! handler. Destructors of the frames that are jumped over do not run, so any
//! resource they owned is leaked, and locks they held stay locked.

#![allow(unsafe_code)]

mod error;
mod exception;

pub use error::Error;
pub use exception::{CapturedException, FaultCode, Registers, StackSnapshot};

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within the signal handler.
#[inline]
pub fn write_stderr(s: &'static str) {
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

/// Identity of a translator installed on the current thread, see
/// [`active_translator`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TranslatorId(pub usize);

/// Puts back the translator that was active before a scoped installation.
///
/// Tokens are thread bound and must be dropped in the reverse order they were
/// created, which is what happens naturally when they are kept on the stack.
#[must_use = "the translator is removed as soon as the token is dropped"]
pub struct RestoreToken {
    id: TranslatorId,
    restore: Option<Box<dyn FnOnce()>>,
}

impl RestoreToken {
    /// Creates a token that runs `restore` when dropped.
    ///
    /// This is meant for [`FaultInterceptor`] implementations other than
    /// [`ExceptionBridge`].
    pub fn new(id: TranslatorId, restore: impl FnOnce() + 'static) -> Self {
        Self {
            id,
            restore: Some(Box::new(restore)),
        }
    }

    /// The identity of the translator this token installed
    #[inline]
    pub fn id(&self) -> TranslatorId {
        self.id
    }
}

impl Drop for RestoreToken {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            restore();
        }
    }
}

/// The capability of intercepting faults raised while running some code.
///
/// The guarded call wrapper only talks to this trait, which keeps it
/// independent of how faults are actually intercepted on a given platform.
pub trait FaultInterceptor: Send + Sync {
    /// Installs a translator for the calling thread. The translator that was
    /// active before is restored when the returned token is dropped, whether
    /// the scope is left normally or by unwinding.
    fn install_scoped(&self) -> RestoreToken;

    /// Runs `body` with a translator installed, returning the fault it raised,
    /// if any. Panics are converted as well, see [`FaultCode::Panic`].
    fn capture_on_fault(&self, body: &mut dyn FnMut()) -> Result<(), CapturedException>;
}

/// Runs `body` via [`FaultInterceptor::capture_on_fault`], passing its return
/// value through.
pub fn capture<R>(
    interceptor: &dyn FaultInterceptor,
    body: impl FnOnce() -> R,
) -> Result<R, CapturedException> {
    let mut body = Some(body);
    let mut output = None;

    interceptor.capture_on_fault(&mut || {
        if let Some(body) = body.take() {
            output = Some(body());
        }
    })?;

    match output {
        Some(output) => Ok(output),
        // Only reachable if the interceptor returned success without running
        // the body, which is a broken interceptor
        None => Err(CapturedException::from_message(
            FaultCode::Unclassified,
            "the interceptor did not run the guarded body",
        )),
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;

        pub use linux::{ExceptionBridge, active_translator, jmp, live_context, simulate_fault};
    }
}
