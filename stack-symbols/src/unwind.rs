use crate::{error::UnwindError, memory::ReadMemory};
use fault_bridge::Registers;

/// The state of one frame during a walk
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StackFrame {
    /// The code address the frame is executing
    pub pc: u64,
    /// Where the frame returns to in its caller, 0 at the end of the stack
    pub return_address: u64,
    /// Stack pointer
    pub stack: u64,
    /// Frame pointer
    pub frame: u64,
}

impl From<Registers> for StackFrame {
    fn from(regs: Registers) -> Self {
        Self {
            pc: regs.ip,
            return_address: 0,
            stack: regs.sp,
            frame: regs.fp,
        }
    }
}

/// The platform's unwind primitive, moving one frame at a time.
///
/// The first step fills in the return address of the starting frame, each
/// step after that moves `frame` to its caller.
pub trait Unwind {
    fn step(&mut self, frame: &mut StackFrame) -> Result<(), UnwindError>;
}

/// Follows the chain of frame records, which on both x86_64 and aarch64 is a
/// pair of the caller's frame pointer and the return address, stored at the
/// frame pointer.
///
/// This requires frame pointers, anything built without them ends the chain
/// early or produces garbage that is caught by the direction check.
pub struct FramePointerUnwinder<M> {
    memory: M,
    started: bool,
}

impl<M: ReadMemory> FramePointerUnwinder<M> {
    pub fn new(memory: M) -> Self {
        Self {
            memory,
            started: false,
        }
    }

    #[inline]
    fn read(&self, addr: u64) -> Result<u64, UnwindError> {
        self.memory.read_u64(addr).ok_or(UnwindError::Read(addr))
    }

    fn return_address(&self, fp: u64) -> Result<u64, UnwindError> {
        if fp == 0 {
            return Ok(0);
        }

        self.read(fp.checked_add(8).ok_or(UnwindError::Read(fp))?)
    }
}

impl<M: ReadMemory> Unwind for FramePointerUnwinder<M> {
    fn step(&mut self, frame: &mut StackFrame) -> Result<(), UnwindError> {
        if !self.started {
            self.started = true;
            frame.return_address = self.return_address(frame.frame)?;
            return Ok(());
        }

        if frame.return_address == 0 {
            return Err(UnwindError::EndOfStack);
        }

        let caller = self.read(frame.frame)?;

        // The stack grows down, so callers always have higher frame pointers.
        // The same frame pointer is allowed so that self referential frames
        // are left to the recursion guard.
        if caller != 0 && caller < frame.frame {
            return Err(UnwindError::InvalidFrame {
                frame: frame.frame,
                caller,
            });
        }

        *frame = StackFrame {
            pc: frame.return_address,
            return_address: self.return_address(caller)?,
            stack: frame.frame + 16,
            frame: caller,
        };

        Ok(())
    }
}

/// Replays a chain of return addresses that was recorded while the stack was
/// still intact, see [`fault_bridge::CapturedException::call_chain`].
///
/// Every recorded address is a return address, so it is moved back into the
/// call instruction. Calls to functions that never return are often the last
/// instruction of their caller, and the return address would then belong to
/// whatever function follows it.
pub struct RecordedUnwinder<'chain> {
    chain: &'chain [u64],
    next: usize,
}

impl<'chain> RecordedUnwinder<'chain> {
    pub fn new(chain: &'chain [u64]) -> Self {
        Self { chain, next: 0 }
    }

    /// The frame the walk starts from
    pub fn start(&self) -> StackFrame {
        StackFrame::default()
    }

    #[inline]
    fn call_site(&self, index: usize) -> u64 {
        self.chain
            .get(index)
            .map_or(0, |ret| ret.saturating_sub(1))
    }
}

impl Unwind for RecordedUnwinder<'_> {
    fn step(&mut self, frame: &mut StackFrame) -> Result<(), UnwindError> {
        if self.next >= self.chain.len() {
            return Err(UnwindError::EndOfStack);
        }

        *frame = StackFrame {
            pc: self.call_site(self.next),
            return_address: self.call_site(self.next + 1),
            stack: 0,
            frame: 0,
        };
        self.next += 1;

        Ok(())
    }
}
