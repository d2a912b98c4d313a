use super::jmp::{self, JmpBuf};
use crate::{CapturedException, Error, FaultCode, Registers, RestoreToken, StackSnapshot, TranslatorId};
use crash_context::CrashContext;
use std::{
    any::Any,
    cell::{Cell, RefCell},
    io, mem, ptr,
};

// std::cmp::max is not const :(
const fn get_stack_size() -> usize {
    if libc::SIGSTKSZ > 16 * 1024 {
        libc::SIGSTKSZ
    } else {
        16 * 1024
    }
}

/// The size of the alternate stack that is mapped for every thread that enters
/// a guarded scope.
///
/// This memory is only committed if a signal is actually handled on it
const SIG_STACK_SIZE: usize = get_stack_size();

/// How much of the faulting thread's stack, starting at the stack pointer, is
/// copied when a fault is captured
const SNAPSHOT_SIZE: usize = 64 * 1024;

/// How far below the lowest address of a thread's stack a fault is still
/// considered to have hit the stack guard
const GUARD_REACH: usize = 64 * 1024;

/// kill
const SI_USER: i32 = 0;

/// We define these ourselves rather than use libc as they are missing from
/// eg. Android
const FPE_INTDIV: i32 = 1;

/// The signals that are intercepted
const FAULT_SIGNALS: [i32; 6] = [
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGSEGV,
    libc::SIGTRAP,
];

struct Installed {
    /// The handlers that were installed before ours, in the same order as
    /// [`FAULT_SIGNALS`]
    previous: [libc::sigaction; 6],
    /// The number of live [`super::ExceptionBridge`]s
    attached: usize,
}

static INSTALLED: parking_lot::Mutex<Option<Installed>> = parking_lot::const_mutex(None);

/// What the signal handler learned about the fault, besides the context
#[derive(Copy, Clone, Default)]
struct FaultRecord {
    signal: i32,
    si_code: i32,
    address: usize,
    overflow: bool,
    /// Set when the fault was raised by [`simulate`]
    simulated: Option<FaultCode>,
    snapshot_base: usize,
    snapshot_len: usize,
}

/// Per thread storage the signal handler writes into, allocated before any
/// fault can happen since nothing may be allocated in the handler
struct CaptureArea {
    context: CrashContext,
    record: FaultRecord,
    snapshot: Box<[u8]>,
    /// Filled in by the panic hook, never touched by the signal handler
    call_chain: Vec<u64>,
    stack_low: usize,
    stack_high: usize,
    page_size: usize,
}

impl CaptureArea {
    fn is_stack_overflow(&self, address: usize, sp: usize) -> bool {
        if self.stack_low == 0 {
            return false;
        }

        let guard = self.stack_low.saturating_sub(GUARD_REACH)..self.stack_low + self.page_size;
        guard.contains(&address) || guard.contains(&sp)
    }

    /// Copies the thread's stack, starting at `sp`. Nothing is copied if `sp`
    /// is outside the thread's stack.
    fn snapshot_stack(&mut self, sp: usize) {
        self.record.snapshot_base = 0;
        self.record.snapshot_len = 0;

        if sp < self.stack_low || sp >= self.stack_high {
            return;
        }

        let len = (self.stack_high - sp).min(self.snapshot.len());

        // SAFETY: everything between the stack pointer and the top of the
        // thread's stack is mapped
        unsafe {
            ptr::copy_nonoverlapping(sp as *const u8, self.snapshot.as_mut_ptr(), len);
        }

        self.record.snapshot_base = sp;
        self.record.snapshot_len = len;
    }

    fn stack_snapshot(&self) -> Option<StackSnapshot> {
        (self.record.snapshot_len > 0).then(|| StackSnapshot {
            base: self.record.snapshot_base as u64,
            bytes: self.snapshot[..self.record.snapshot_len].to_vec(),
        })
    }

    /// Fills in the context and stack snapshot from the calling thread, as if
    /// `code` was raised right here
    #[inline(always)]
    unsafe fn capture_live(&mut self, code: FaultCode) {
        unsafe {
            let cc = &mut self.context;
            ptr::write_bytes(cc as *mut CrashContext, 0, 1);
            crash_context::crash_context_getcontext(&mut cc.context);
            detach_float_state(cc);

            cc.pid = std::process::id() as i32;
            cc.tid = super::current_tid();
            cc.siginfo.ssi_signo = code.signal() as u32;
            cc.siginfo.ssi_code = SI_USER;
            cc.siginfo.ssi_pid = std::process::id();

            let sp = Registers::from_context(cc).sp as usize;

            self.record = FaultRecord {
                signal: code.signal(),
                si_code: SI_USER,
                address: 0,
                overflow: false,
                simulated: Some(code),
                snapshot_base: 0,
                snapshot_len: 0,
            };
            self.snapshot_stack(sp);
        }
    }
}

/// An alternate signal stack, so that the handler can run even when the
/// fault was caused by a stack overflow
struct AltStack {
    old: Option<libc::stack_t>,
    new: libc::stack_t,
    mapping: *mut libc::c_void,
    mapping_len: usize,
}

impl AltStack {
    /// Maps and registers an alternate stack for the calling thread, unless
    /// one that is big enough is already registered
    unsafe fn install() -> Result<Option<Self>, Error> {
        unsafe {
            let mut old_stack: libc::stack_t = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut old_stack) == -1 {
                return Err(io::Error::last_os_error().into());
            }

            if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= SIG_STACK_SIZE {
                return Ok(None);
            }

            let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let mapping_len = guard_size + SIG_STACK_SIZE;

            let mapping = libc::mmap(
                ptr::null_mut(),
                mapping_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if mapping == libc::MAP_FAILED {
                return Err(Error::OutOfMemory);
            }

            // Leave the lowest page inaccessible as a guard
            let stack_ptr = (mapping as usize + guard_size) as *mut libc::c_void;
            if libc::mprotect(stack_ptr, SIG_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE) == -1 {
                let err = io::Error::last_os_error();
                libc::munmap(mapping, mapping_len);
                return Err(err.into());
            }

            let new = libc::stack_t {
                ss_sp: stack_ptr,
                ss_flags: 0,
                ss_size: SIG_STACK_SIZE,
            };
            if libc::sigaltstack(&new, ptr::null_mut()) == -1 {
                let err = io::Error::last_os_error();
                libc::munmap(mapping, mapping_len);
                return Err(err.into());
            }

            Ok(Some(Self {
                old: (old_stack.ss_flags & libc::SS_DISABLE == 0).then_some(old_stack),
                new,
                mapping,
                mapping_len,
            }))
        }
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        unsafe {
            let mut current: libc::stack_t = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut current) == -1 {
                return;
            }

            // Only put back the old stack if ours is still the one registered
            if current.ss_sp == self.new.ss_sp {
                let restore = self.old.unwrap_or_else(|| {
                    let mut disable: libc::stack_t = mem::zeroed();
                    disable.ss_flags = libc::SS_DISABLE;
                    disable
                });

                if libc::sigaltstack(&restore, ptr::null_mut()) == -1 {
                    // Still registered, leak the mapping rather than leave a
                    // dangling signal stack
                    return;
                }
            }

            let r = libc::munmap(self.mapping, self.mapping_len);
            debug_assert_eq!(r, 0, "munmap failed during thread shutdown");
        }
    }
}

struct ThreadState {
    area: Box<CaptureArea>,
    _alt_stack: Option<AltStack>,
}

impl ThreadState {
    fn new() -> Self {
        let alt_stack = match unsafe { AltStack::install() } {
            Ok(alt_stack) => alt_stack,
            Err(err) => {
                log::warn!(
                    "unable to install an alternate signal stack, stack overflows on this thread will not be intercepted: {err}"
                );
                None
            }
        };

        let (stack_low, stack_high) = current_stack_bounds().unwrap_or_else(|| {
            log::warn!("unable to determine the stack bounds of the current thread");
            (0, 0)
        });

        let area = Box::new(CaptureArea {
            // SAFETY: a zeroed context is what the handler resets it to anyways
            context: unsafe { mem::zeroed() },
            record: FaultRecord::default(),
            snapshot: vec![0u8; SNAPSHOT_SIZE].into_boxed_slice(),
            call_chain: Vec::new(),
            stack_low,
            stack_high,
            page_size: unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize },
        });

        Self {
            area,
            _alt_stack: alt_stack,
        }
    }

    /// The capture area of the calling thread, created on first use
    fn area() -> *mut CaptureArea {
        THREAD.with(|ts| {
            let mut ts = ts.borrow_mut();
            let state = ts.get_or_insert_with(Self::new);
            &mut *state.area as *mut CaptureArea
        })
    }
}

/// A jump target for faults raised on the thread that installed it
pub(super) struct Translator {
    jmp_buf: mem::MaybeUninit<JmpBuf>,
    /// Only set while the body is running, `jmp_buf` is garbage otherwise
    armed: bool,
    area: *mut CaptureArea,
    previous: *mut Translator,
}

thread_local! {
    /// The innermost translator of this thread. Const initialized and without
    /// a destructor so that it is safe to read from the signal handler.
    static ACTIVE: Cell<*mut Translator> = const { Cell::new(ptr::null_mut()) };
    static THREAD: RefCell<Option<ThreadState>> = const { RefCell::new(None) };
}

pub(super) fn attach() -> Result<(), Error> {
    {
        let mut lock = INSTALLED.lock();

        if let Some(installed) = &mut *lock {
            installed.attached += 1;
        } else {
            // SAFETY: syscalls
            let previous = unsafe { install_handlers()? };
            *lock = Some(Installed {
                previous,
                attached: 1,
            });
            log::debug!("installed fault signal handlers");
        }
    }

    super::panic_hook::install();

    // Get the alternate stack in place for the attaching thread right away
    ThreadState::area();
    Ok(())
}

/// Drops one reference, restoring the previous handlers when it was the last
pub(super) fn detach() {
    let mut lock = INSTALLED.lock();

    let last = match &mut *lock {
        Some(installed) => {
            installed.attached -= 1;
            installed.attached == 0
        }
        None => false,
    };

    if last {
        if let Some(installed) = lock.take() {
            // SAFETY: syscalls
            unsafe { restore_handlers(&installed.previous) };
            log::debug!("restored previous fault signal handlers");
        }
    }
}

unsafe fn install_handlers() -> Result<[libc::sigaction; 6], Error> {
    unsafe {
        let mut previous: [libc::sigaction; 6] = mem::zeroed();

        for (sig, old) in FAULT_SIGNALS.iter().zip(previous.iter_mut()) {
            if libc::sigaction(*sig, ptr::null(), old) == -1 {
                return Err(Error::HandlerInstall {
                    signal: *sig,
                    source: io::Error::last_os_error(),
                });
            }
        }

        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);

        // Mask all fault signals while we're handling one of them
        for sig in FAULT_SIGNALS {
            libc::sigaddset(&mut sa.sa_mask, sig);
        }

        sa.sa_sigaction = signal_handler as usize;
        sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

        for (i, sig) in FAULT_SIGNALS.iter().enumerate() {
            if libc::sigaction(*sig, &sa, ptr::null_mut()) == -1 {
                let source = io::Error::last_os_error();
                restore_handlers(&previous[..i]);
                return Err(Error::HandlerInstall {
                    signal: *sig,
                    source,
                });
            }
        }

        Ok(previous)
    }
}

/// Restores the handlers in `previous`, or the default handler if one can't be
/// restored. `previous` may be shorter than [`FAULT_SIGNALS`].
unsafe fn restore_handlers(previous: &[libc::sigaction]) {
    unsafe {
        for (sig, action) in FAULT_SIGNALS.iter().zip(previous.iter()) {
            if libc::sigaction(*sig, action, ptr::null_mut()) == -1 {
                install_default_handler(*sig);
            }
        }
    }
}

#[inline]
unsafe fn install_default_handler(sig: i32) {
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
    }
}

pub(super) fn active_translator() -> Option<TranslatorId> {
    let current = ACTIVE.with(Cell::get);
    (!current.is_null()).then(|| TranslatorId(current as usize))
}

/// Installs a new, unarmed, translator for the calling thread
pub(super) fn push_translator() -> (*mut Translator, RestoreToken) {
    let area = ThreadState::area();
    let previous = ACTIVE.with(Cell::get);

    let translator = Box::into_raw(Box::new(Translator {
        jmp_buf: mem::MaybeUninit::uninit(),
        armed: false,
        area,
        previous,
    }));
    ACTIVE.with(|active| active.set(translator));

    let token = RestoreToken::new(TranslatorId(translator as usize), move || {
        // SAFETY: the token is the sole owner of the translator
        unsafe { pop_translator(translator) }
    });

    (translator, token)
}

unsafe fn pop_translator(translator: *mut Translator) {
    unsafe {
        debug_assert_eq!(
            ACTIVE.with(Cell::get),
            translator,
            "translators must be restored in the reverse order they were installed"
        );

        ACTIVE.with(|active| active.set((*translator).previous));
        drop(Box::from_raw(translator));
    }
}

/// The innermost translator on this thread that is currently running a body
fn armed_translator() -> *mut Translator {
    let mut current = ACTIVE.try_with(Cell::get).unwrap_or(ptr::null_mut());

    while !current.is_null() {
        // SAFETY: translators are only freed after being unlinked
        unsafe {
            if ptr::read_volatile(ptr::addr_of!((*current).armed)) {
                return current;
            }
            current = (*current).previous;
        }
    }

    ptr::null_mut()
}

/// Runs `body` after saving a jump point in `translator`.
///
/// Returns `true` if the body completed and `false` if a fault jumped back.
#[inline(never)]
pub(super) unsafe fn call_with_jump_point(
    translator: *mut Translator,
    body: &mut dyn FnMut(),
) -> bool {
    /// Disarms on normal completion and while unwinding from a panic. A jump
    /// skips this, but then the handler has already disarmed.
    struct Disarm(*mut Translator);

    impl Drop for Disarm {
        fn drop(&mut self) {
            unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.0).armed), false) };
        }
    }

    unsafe {
        let jmp_buf = ptr::addr_of_mut!((*translator).jmp_buf).cast::<JmpBuf>();

        if jmp::sigsetjmp(jmp_buf, 1 /* save signal mask */) != 0 {
            return false;
        }

        // Nothing captured for an earlier scope may be mistaken for ours
        let area = &mut *(*translator).area;
        area.record = FaultRecord::default();
        area.call_chain.clear();

        ptr::write_volatile(ptr::addr_of_mut!((*translator).armed), true);
        let _disarm = Disarm(translator);

        body();
        true
    }
}

/// Builds the exception from what the handler left in the capture area
pub(super) unsafe fn take_exception(translator: *mut Translator) -> CapturedException {
    unsafe {
        let area = &*(*translator).area;
        let record = area.record;

        let code = record
            .simulated
            .unwrap_or_else(|| classify(record.signal, record.si_code, record.overflow));

        CapturedException::from_signal(
            code,
            record.signal,
            record.si_code,
            record.address,
            Box::new(area.context.clone()),
            area.stack_snapshot(),
        )
    }
}

/// Builds the exception for a panic that unwound out of the body, with the
/// state the panic hook recorded, if it ran
pub(super) unsafe fn take_panic(
    translator: *mut Translator,
    payload: Box<dyn Any + Send>,
) -> CapturedException {
    let exception = CapturedException::from_panic(payload);

    unsafe {
        let area = &mut *(*translator).area;
        if area.record.simulated != Some(FaultCode::Panic) {
            return exception;
        }

        area.record.simulated = None;
        exception.with_panic_site(
            Box::new(area.context.clone()),
            area.stack_snapshot(),
            mem::take(&mut area.call_chain),
        )
    }
}

fn classify(signal: i32, si_code: i32, overflow: bool) -> FaultCode {
    // A signal sent with kill/tgkill/sigqueue rather than raised by the CPU.
    // abort() sends itself a SIGABRT, which is still just an abort.
    if si_code <= SI_USER && signal != libc::SIGABRT {
        return FaultCode::ExternalBreak;
    }

    match signal {
        libc::SIGSEGV if overflow => FaultCode::StackOverflow,
        libc::SIGSEGV => FaultCode::AccessViolation,
        libc::SIGBUS => FaultCode::BusError,
        libc::SIGFPE if si_code == FPE_INTDIV => FaultCode::DivideByZero,
        libc::SIGFPE => FaultCode::FloatingPoint,
        libc::SIGILL => FaultCode::IllegalInstruction,
        libc::SIGTRAP => FaultCode::Breakpoint,
        libc::SIGABRT => FaultCode::NonContinuable,
        _ => FaultCode::Unclassified,
    }
}

/// Moves the floating point state out of the `ucontext_t`, whose `fpregs`
/// points at memory that won't outlive the handler or the getcontext caller
pub(super) fn detach_float_state(cc: &mut CrashContext) {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            let fpregs = cc.context.uc_mcontext.fpregs;
            if !fpregs.is_null() {
                // SAFETY: the kernel/getcontext pointed it at a valid fpregset_t
                unsafe {
                    ptr::copy_nonoverlapping(
                        fpregs,
                        ((&mut cc.float_state) as *mut crash_context::fpregset_t).cast(),
                        1,
                    );
                }
            }
            cc.context.uc_mcontext.fpregs = ptr::null_mut();
        } else if #[cfg(target_arch = "aarch64")] {
            let fp_ptr = cc.context.uc_mcontext.__reserved.as_ptr().cast::<crash_context::fpsimd_context>();

            // SAFETY: the reserved area always starts with a context header
            unsafe {
                if (*fp_ptr).head.magic == crash_context::FPSIMD_MAGIC {
                    ptr::copy_nonoverlapping(fp_ptr, &mut cc.float_state, 1);
                }
            }
        }
    }
}

unsafe fn capture_signal(
    area: &mut CaptureArea,
    sig: i32,
    info: &libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    unsafe {
        let cc = &mut area.context;
        ptr::write_bytes(cc as *mut CrashContext, 0, 1);
        debug_print!("zeroed context");

        ptr::copy_nonoverlapping(
            (info as *const libc::siginfo_t).cast::<libc::signalfd_siginfo>(),
            &mut cc.siginfo,
            1,
        );

        let uc_ptr = &*uc.cast::<crash_context::ucontext_t>();
        ptr::copy_nonoverlapping(uc_ptr, &mut cc.context, 1);
        detach_float_state(cc);
        debug_print!("copied context");

        cc.pid = std::process::id() as i32;
        cc.tid = super::current_tid();

        // si_addr is only meaningful for faults raised by the CPU
        let address = if info.si_code > SI_USER {
            info.si_addr() as usize
        } else {
            0
        };

        let sp = Registers::from_context(cc).sp as usize;
        let overflow = sig == libc::SIGSEGV && area.is_stack_overflow(address, sp);

        area.record = FaultRecord {
            signal: sig,
            si_code: info.si_code,
            address,
            overflow,
            simulated: None,
            snapshot_base: 0,
            snapshot_len: 0,
        };

        // The stack is exactly what we can't read if it overflowed
        if !overflow {
            area.snapshot_stack(sp);
            debug_print!("copied stack");
        }
    }
}

/// This is the actual function installed for each signal we support, invoked
/// by the kernel
unsafe extern "C" fn signal_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    unsafe {
        // Some other code in the process might save and restore handlers with
        // `signal` instead of `sigaction`, which loses `SA_SIGINFO`, making
        // `info` and `uc` garbage. If that is the case, reinstall with the
        // right flags and return, the fault will be raised again.
        {
            let mut cur_handler: libc::sigaction = mem::zeroed();
            if libc::sigaction(sig, ptr::null(), &mut cur_handler) == 0
                && cur_handler.sa_sigaction == signal_handler as usize
                && cur_handler.sa_flags & libc::SA_SIGINFO == 0
            {
                libc::sigemptyset(&mut cur_handler.sa_mask);
                libc::sigaddset(&mut cur_handler.sa_mask, sig);

                cur_handler.sa_sigaction = signal_handler as usize;
                cur_handler.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

                if libc::sigaction(sig, &cur_handler, ptr::null_mut()) == -1 {
                    install_default_handler(sig);
                }

                return;
            }
        }

        let translator = armed_translator();

        if !translator.is_null() {
            debug_print!("fault inside a guarded scope");

            let translator = &mut *translator;
            capture_signal(&mut *translator.area, sig, &*info, uc);

            translator.armed = false;
            jmp::siglongjmp(ptr::addr_of_mut!(translator.jmp_buf).cast(), 1);
        }

        debug_print!("fault outside of a guarded scope");
        forward_signal(sig, info, uc);
    }
}

/// Hands a fault we don't own to the handler that was installed before ours
unsafe fn forward_signal(sig: i32, info: *mut libc::siginfo_t, uc: *mut libc::c_void) {
    unsafe {
        let previous = INSTALLED.lock().as_ref().and_then(|installed| {
            FAULT_SIGNALS
                .iter()
                .position(|s| *s == sig)
                .map(|i| installed.previous[i])
        });

        match previous {
            Some(action)
                if action.sa_sigaction != libc::SIG_DFL && action.sa_sigaction != libc::SIG_IGN =>
            {
                if action.sa_flags & libc::SA_SIGINFO != 0 {
                    let handler: extern "C" fn(i32, *mut libc::siginfo_t, *mut libc::c_void) =
                        mem::transmute(action.sa_sigaction);
                    handler(sig, info, uc);
                } else {
                    let handler: extern "C" fn(i32) = mem::transmute(action.sa_sigaction);
                    handler(sig);
                }
            }
            _ => {
                debug_print!("installing default handler");
                install_default_handler(sig);

                if (*info).si_code <= SI_USER || sig == libc::SIGABRT {
                    // This signal was sent to us with kill() or abort(), it
                    // won't be raised again by returning, so queue it again
                    // ourselves.
                    let tid = super::current_tid();
                    if libc::syscall(libc::SYS_tgkill, std::process::id(), tid, sig) < 0 {
                        libc::_exit(1);
                    }
                }

                // A synchronous fault is raised again when we return
            }
        }
    }
}

/// Captures the live context and jumps to the innermost armed translator
pub(super) unsafe fn simulate(code: FaultCode) -> bool {
    let translator = armed_translator();
    if translator.is_null() {
        return false;
    }

    unsafe {
        let translator = &mut *translator;
        (*translator.area).capture_live(code);

        translator.armed = false;
        jmp::siglongjmp(ptr::addr_of_mut!(translator.jmp_buf).cast(), 1)
    }
}

/// Records the state of the calling thread at the point of a panic, for the
/// innermost armed translator. Called by the panic hook before unwinding
/// starts, so the frames of the panicking code are still intact.
///
/// Returns `false` if there is no armed translator on this thread.
#[inline(never)]
pub(super) fn capture_panic(call_chain: Vec<u64>) -> bool {
    let translator = armed_translator();
    if translator.is_null() {
        return false;
    }

    // SAFETY: the translator is armed, so its scope is still executing on
    // this thread, and the area outlives every translator of the thread
    unsafe {
        let area = &mut *(*translator).area;
        area.capture_live(FaultCode::Panic);
        area.call_chain = call_chain;
    }

    true
}

#[inline]
pub(super) fn has_armed_translator() -> bool {
    !armed_translator().is_null()
}

/// The `[low, high)` address range of the calling thread's stack
fn current_stack_bounds() -> Option<(usize, usize)> {
    unsafe {
        let mut attr: libc::pthread_attr_t = mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }

        let mut addr = ptr::null_mut();
        let mut size = 0;
        let r = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);

        (r == 0).then(|| (addr as usize, addr as usize + size))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classifies_signals() {
        // SEGV_MAPERR
        assert_eq!(classify(libc::SIGSEGV, 1, false), FaultCode::AccessViolation);
        assert_eq!(classify(libc::SIGSEGV, 1, true), FaultCode::StackOverflow);
        assert_eq!(classify(libc::SIGFPE, FPE_INTDIV, false), FaultCode::DivideByZero);
        // FPE_FLTDIV
        assert_eq!(classify(libc::SIGFPE, 3, false), FaultCode::FloatingPoint);
        // SI_KERNEL, which is what int3 produces
        assert_eq!(classify(libc::SIGTRAP, 0x80, false), FaultCode::Breakpoint);
        // SI_TKILL, abort() and raise()
        assert_eq!(classify(libc::SIGABRT, -6, false), FaultCode::NonContinuable);
        assert_eq!(classify(libc::SIGSEGV, -6, false), FaultCode::ExternalBreak);
        assert_eq!(classify(libc::SIGBUS, SI_USER, false), FaultCode::ExternalBreak);
    }

    #[test]
    fn stack_bounds_contain_locals() {
        let local = 0u64;
        let addr = &local as *const u64 as usize;

        let (low, high) = current_stack_bounds().expect("failed to query stack bounds");
        assert!(low < addr && addr < high);
    }
}
