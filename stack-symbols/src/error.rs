#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to enumerate the modules loaded in the process")]
    NoModules,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single unwind step failed, which ends the walk
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UnwindError {
    #[error("unable to read memory at {0:#x}")]
    Read(u64),
    #[error("caller frame {caller:#x} is below the current frame {frame:#x}")]
    InvalidFrame { frame: u64, caller: u64 },
    #[error("the end of the stack was already reached")]
    EndOfStack,
}
