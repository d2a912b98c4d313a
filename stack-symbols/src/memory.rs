use fault_bridge::StackSnapshot;

/// Memory access needed to follow the frame chain
pub trait ReadMemory {
    /// Reads a native endian `u64`, returning `None` if the address is not
    /// readable
    fn read_u64(&self, addr: u64) -> Option<u64>;
}

/// Reads the memory of a process with `process_vm_readv`, so an invalid
/// address is reported as an error instead of faulting.
#[derive(Copy, Clone, Debug)]
pub struct ProcessMemory {
    pid: libc::pid_t,
}

impl ProcessMemory {
    pub fn new(pid: u32) -> Self {
        Self {
            pid: pid as libc::pid_t,
        }
    }

    /// The memory of the calling process
    pub fn current() -> Self {
        Self::new(std::process::id())
    }
}

impl ReadMemory for ProcessMemory {
    fn read_u64(&self, addr: u64) -> Option<u64> {
        if addr == 0 {
            return None;
        }

        let mut value = 0u64;

        let local = libc::iovec {
            iov_base: (&mut value as *mut u64).cast(),
            iov_len: std::mem::size_of::<u64>(),
        };
        let remote = libc::iovec {
            iov_base: addr as usize as *mut libc::c_void,
            iov_len: std::mem::size_of::<u64>(),
        };

        // SAFETY: syscall, `local` points at `value` which outlives the call
        let read = unsafe { libc::process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };

        (read == std::mem::size_of::<u64>() as isize).then_some(value)
    }
}

/// Reads from a copy of the stack taken when a fault was captured, and from
/// the live process for everything outside of it.
///
/// The frames between the fault and the scope that caught it have already been
/// reused by the time the stack is walked.
pub struct SnapshotMemory<'snap> {
    snapshot: Option<&'snap StackSnapshot>,
    process: ProcessMemory,
}

impl<'snap> SnapshotMemory<'snap> {
    pub fn new(snapshot: Option<&'snap StackSnapshot>, process: ProcessMemory) -> Self {
        Self { snapshot, process }
    }
}

impl ReadMemory for SnapshotMemory<'_> {
    fn read_u64(&self, addr: u64) -> Option<u64> {
        match self.snapshot {
            Some(snapshot) if snapshot.contains(addr) => snapshot.read_u64(addr),
            _ => self.process.read_u64(addr),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reads_own_memory() {
        let value = Box::new(0x0123_4567_89ab_cdefu64);
        let mem = ProcessMemory::current();

        assert_eq!(mem.read_u64(&*value as *const u64 as u64), Some(*value));
        assert_eq!(mem.read_u64(0), None);
        assert_eq!(mem.read_u64(8), None);
    }

    #[test]
    fn prefers_snapshot() {
        let value = Box::new(7u64);
        let addr = &*value as *const u64 as u64;

        let snapshot = StackSnapshot {
            base: addr,
            bytes: 11u64.to_ne_bytes().to_vec(),
        };

        let mem = SnapshotMemory::new(Some(&snapshot), ProcessMemory::current());
        assert_eq!(mem.read_u64(addr), Some(11));

        let mem = SnapshotMemory::new(None, ProcessMemory::current());
        assert_eq!(mem.read_u64(addr), Some(7));
    }
}
