use crate::{DumpBackend, Error, referenced};
use fault_bridge::CapturedException;
use minidump_writer::app_memory::AppMemory;
use std::{
    fs::File,
    io::{self, Read, Write},
    ops::Range,
    os::fd::{FromRawFd, OwnedFd},
    time::{Duration, Instant},
};

/// We define these constants ourselves rather than use libc as they are missing
/// from eg. Android
const PR_GET_DUMPABLE: i32 = 3;
const PR_SET_DUMPABLE: i32 = 4;
const PR_SET_PTRACER: i32 = 0x59616d61;

/// Exit code of the helper when writing the minidump failed
const HELPER_WRITE_FAILED: i32 = 1;
/// Exit code of the helper when the parent went away before allowing it to
/// proceed
const HELPER_ABANDONED: i32 = 2;

/// How long the helper gets to write a dump before it is killed
const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(60);
/// How often a helper that is still running is checked on
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Ptracer and dumpable are settings of the whole process, so only one helper
/// may be granted them at a time
static DUMP_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// Writes a minidump with [`minidump_writer`].
///
/// A process can't `ptrace` itself, so a helper process is forked which does
/// the actual writing while the faulting thread waits for it. The helper is
/// only a copy of the process, so anything it needs, eg. the crash context,
/// is prepared before forking.
///
/// Besides the default streams, the dump contains the memory around every
/// address the captured stack refers to that lies in a readable data mapping,
/// which covers the heap objects the faulting code was working with.
///
/// Dumps are written one at a time, a fault on another thread waits until the
/// current dump is done.
pub struct MinidumpBackend {
    helper_timeout: Duration,
}

impl Default for MinidumpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MinidumpBackend {
    pub fn new() -> Self {
        Self {
            helper_timeout: DEFAULT_HELPER_TIMEOUT,
        }
    }

    /// Sets how long the helper may take before it is killed, which fails the
    /// dump with [`Error::HelperKilled`]. Defaults to 60 seconds.
    pub fn with_helper_timeout(mut self, timeout: Duration) -> Self {
        self.helper_timeout = timeout;
        self
    }
}

impl DumpBackend for MinidumpBackend {
    fn write_dump(&self, file: &mut File, exception: &CapturedException) -> Result<(), Error> {
        // An exception that was not captured by the bridge has no machine
        // context, so use the state of this thread, which is where it was
        // caught
        let context = match exception.context() {
            Some(cc) => cc.clone(),
            None => *fault_bridge::live_context(),
        };

        let app_memory = referenced_memory(exception);

        let _lock = DUMP_LOCK.lock();

        let (go_read, go_write) = pipe()?;
        let (status_read, status_write) = pipe()?;
        let parent = std::process::id() as libc::pid_t;

        // SAFETY: syscall
        let child = unsafe { libc::fork() };

        match child {
            -1 => Err(io::Error::last_os_error().into()),
            0 => {
                drop(go_write);
                drop(status_read);

                // SAFETY: we're the forked helper
                unsafe { run_helper(go_read, status_write, parent, context, app_memory, file) }
            }
            child => {
                drop(go_read);
                drop(status_write);

                wait_for_helper(child, go_write, status_read, self.helper_timeout)
            }
        }
    }
}

/// The regions around the addresses the exception's stack snapshot refers to
fn referenced_memory(exception: &CapturedException) -> Vec<AppMemory> {
    let Some(stack) = exception.stack() else {
        return Vec::new();
    };

    let maps = match std::fs::read_to_string("/proc/self/maps") {
        Ok(maps) => maps,
        Err(err) => {
            log::warn!("unable to read the memory mappings, referenced memory will be missing: {err}");
            return Vec::new();
        }
    };

    let mappings = referenced::data_mappings(&maps);
    referenced::referenced_regions(stack, &mappings)
        .into_iter()
        .filter(is_readable)
        .map(|region| AppMemory {
            ptr: region.start as usize,
            length: (region.end - region.start) as usize,
        })
        .collect()
}

/// Whether all of `region` can be read right now, a single region the helper
/// fails to read fails the whole dump
fn is_readable(region: &Range<u64>) -> bool {
    let len = (region.end - region.start) as usize;
    let mut buf = vec![0u8; len];

    let local = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: len,
    };
    let remote = libc::iovec {
        iov_base: region.start as usize as *mut libc::c_void,
        iov_len: len,
    };

    // SAFETY: syscall, reading through the kernel reports unmapped memory as
    // an error instead of faulting
    let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    read == len as isize
}

fn wait_for_helper(
    child: libc::pid_t,
    go: OwnedFd,
    status: OwnedFd,
    timeout: Duration,
) -> Result<(), Error> {
    let wait_status = {
        // SAFETY: syscalls
        let _dumpable = unsafe { SetDumpable::new(child) };

        let mut go = File::from(go);
        if let Err(err) = go.write_all(&[1]) {
            log::warn!("failed to signal dump helper: {err}");
        }
        drop(go);

        wait_for_exit(child, timeout)?
    };

    // The helper is gone, so this reads whatever it wrote about why it
    // failed, if it did, up to the end of the pipe
    let mut message = String::new();
    let _ = File::from(status).read_to_string(&mut message);

    if libc::WIFEXITED(wait_status) {
        match libc::WEXITSTATUS(wait_status) {
            0 => Ok(()),
            code => Err(Error::HelperFailed { code, message }),
        }
    } else {
        Err(Error::HelperKilled(libc::WTERMSIG(wait_status)))
    }
}

/// Reaps `child`, killing it if it is still running once `timeout` has
/// passed. Returns the wait status.
fn wait_for_exit(child: libc::pid_t, timeout: Duration) -> Result<i32, Error> {
    let deadline = Instant::now() + timeout;
    let mut wait_status = 0;

    loop {
        // SAFETY: syscall
        let res = unsafe { libc::waitpid(child, &mut wait_status, libc::WNOHANG) };

        if res == child {
            return Ok(wait_status);
        }

        if res == -1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
            continue;
        }

        if Instant::now() >= deadline {
            break;
        }

        std::thread::sleep(POLL_INTERVAL);
    }

    log::warn!("dump helper {child} did not finish within {timeout:?}, killing it");

    // SAFETY: syscall, the child has not been reaped so the pid is still ours
    unsafe { libc::kill(child, libc::SIGKILL) };

    loop {
        // SAFETY: syscall
        let res = unsafe { libc::waitpid(child, &mut wait_status, 0) };
        if res == child {
            return Ok(wait_status);
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
}

/// The body of the forked helper process
unsafe fn run_helper(
    go: OwnedFd,
    status: OwnedFd,
    parent: libc::pid_t,
    context: crash_context::CrashContext,
    app_memory: Vec<AppMemory>,
    file: &mut File,
) -> ! {
    let mut status = File::from(status);

    // Wait until the parent has allowed us to ptrace it
    let mut byte = [0u8; 1];
    if !matches!(File::from(go).read(&mut byte), Ok(1)) {
        unsafe { libc::_exit(HELPER_ABANDONED) };
    }

    let mut writer = minidump_writer::minidump_writer::MinidumpWriter::new(parent, context.tid);
    writer
        .set_crash_context(minidump_writer::crash_context::CrashContext { inner: context })
        .set_app_memory(app_memory);

    let code = match writer.dump(file) {
        Ok(_) => 0,
        Err(err) => {
            let _ = write!(status, "{err}");
            HELPER_WRITE_FAILED
        }
    };

    // Skip atexit handlers and destructors, they belong to the parent
    unsafe { libc::_exit(code) }
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];

    // SAFETY: syscall
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: the descriptors were just created and are owned by nothing else
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Helper that sets the process as dumpable if it is not, and allows the
/// helper to ptrace us, and when dropped returns it back to the original
/// state if needed
struct SetDumpable {
    was_dumpable: bool,
}

impl SetDumpable {
    unsafe fn new(helper: libc::pid_t) -> Self {
        unsafe {
            let is_dumpable = libc::syscall(libc::SYS_prctl, PR_GET_DUMPABLE, 0, 0, 0, 0);
            let was_dumpable = is_dumpable > 0;

            if !was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 1, 0, 0, 0);
            }

            // Only needed if `/proc/sys/kernel/yama/ptrace_scope` = 1, but
            // harmless in any other mode
            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, helper, 0, 0, 0);

            Self { was_dumpable }
        }
    }
}

impl Drop for SetDumpable {
    fn drop(&mut self) {
        unsafe {
            libc::syscall(libc::SYS_prctl, PR_SET_PTRACER, 0, 0, 0, 0);

            if !self.was_dumpable {
                libc::syscall(libc::SYS_prctl, PR_SET_DUMPABLE, 0, 0, 0, 0);
            }
        }
    }
}
