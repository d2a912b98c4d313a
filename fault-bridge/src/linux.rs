pub mod jmp;
mod panic_hook;
mod state;

use crate::{
    CapturedException, Error, FaultCode, FaultInterceptor, Registers, RestoreToken, TranslatorId,
};
use crash_context::CrashContext;
use std::{
    mem,
    panic::{self, AssertUnwindSafe},
    ptr,
};

/// Indices into `mcontext_t::gregs`
#[cfg(target_arch = "x86_64")]
const REG_RBP: usize = 10;
#[cfg(target_arch = "x86_64")]
const REG_RSP: usize = 15;
#[cfg(target_arch = "x86_64")]
const REG_RIP: usize = 16;

/// Process wide registration of the fault signal handlers.
///
/// Attaching is reference counted, the handlers that were installed before
/// the first attach are put back when the last [`ExceptionBridge`] is dropped.
pub struct ExceptionBridge {
    _priv: (),
}

impl ExceptionBridge {
    /// Installs the signal handlers, if they aren't already, and prepares the
    /// calling thread.
    ///
    /// Other threads are prepared the first time they enter a guarded scope.
    pub fn attach() -> Result<Self, Error> {
        state::attach()?;
        Ok(Self { _priv: () })
    }

    /// Detaches the bridge.
    ///
    /// This is done automatically when this [`ExceptionBridge`] is dropped.
    #[inline]
    pub fn detach(self) {}
}

impl Drop for ExceptionBridge {
    fn drop(&mut self) {
        state::detach();
    }
}

impl FaultInterceptor for ExceptionBridge {
    fn install_scoped(&self) -> RestoreToken {
        let (_translator, token) = state::push_translator();
        token
    }

    fn capture_on_fault(&self, body: &mut dyn FnMut()) -> Result<(), CapturedException> {
        let (translator, _token) = state::push_translator();

        let completed = panic::catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: the translator stays alive until `_token` is dropped at
            // the end of this function
            unsafe { state::call_with_jump_point(translator, body) }
        }));

        match completed {
            Ok(true) => Ok(()),
            // SAFETY: we jumped back from the signal handler, or from
            // `simulate_fault`, both of which filled in the capture area
            Ok(false) => Err(unsafe { state::take_exception(translator) }),
            // SAFETY: as above, and the panic hook only ever writes into the
            // area of the innermost armed translator, which was ours
            Err(payload) => Err(unsafe { state::take_panic(translator, payload) }),
        }
    }
}

/// The identity of the translator that is currently installed on the calling
/// thread, if any
#[inline]
pub fn active_translator() -> Option<TranslatorId> {
    state::active_translator()
}

/// Raises `code` on the calling thread as if the matching fault happened here.
///
/// The innermost armed translator on this thread receives a
/// [`CapturedException`] with the live register state of this call. Returns
/// `false`, without doing anything, if there is no armed translator, otherwise
/// it does not return.
pub fn simulate_fault(code: FaultCode) -> bool {
    // Normally this would be an unsafe function, but the jump only ever targets
    // a scope that is still executing on this thread
    unsafe { state::simulate(code) }
}

/// Captures the register state of the calling thread
#[inline(never)]
pub fn live_context() -> Box<CrashContext> {
    unsafe {
        let mut cc: Box<CrashContext> = Box::new(mem::zeroed());
        crash_context::crash_context_getcontext(&mut cc.context);
        state::detach_float_state(&mut cc);
        cc.pid = std::process::id() as i32;
        cc.tid = current_tid();
        cc
    }
}

#[inline]
pub(crate) fn current_tid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

impl Registers {
    /// Extracts the registers needed to walk the stack from a crash context
    pub fn from_context(cc: &CrashContext) -> Self {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                let gregs = &cc.context.uc_mcontext.gregs;
                Self {
                    ip: gregs[REG_RIP] as u64,
                    sp: gregs[REG_RSP] as u64,
                    fp: gregs[REG_RBP] as u64,
                }
            } else if #[cfg(target_arch = "aarch64")] {
                let mc = &cc.context.uc_mcontext;
                Self {
                    ip: mc.pc,
                    sp: mc.sp,
                    // x29 is the frame pointer
                    fp: mc.regs[29],
                }
            }
        }
    }
}

impl CapturedException {
    /// Delivers the fault again with the default disposition, which for every
    /// signal the bridge handles terminates the process, or stops in the
    /// debugger if one is attached.
    ///
    /// A panic is resumed instead.
    pub fn reraise(self) -> ! {
        if self.code() == FaultCode::Panic {
            panic::resume_unwind(Box::new(self.message()));
        }

        let signal = self.signal();
        log::error!("re-raising signal {signal}: {self}");

        unsafe {
            libc::signal(signal, libc::SIG_DFL);

            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, signal);
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut());

            libc::raise(signal);

            // Only reachable if something else has the signal ignored
            libc::_exit(128 + signal)
        }
    }
}
