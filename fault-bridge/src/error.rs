use std::fmt;

/// An error that can occur when attaching an [`crate::ExceptionBridge`]
#[derive(Debug)]
pub enum Error {
    /// Unable to `mmap` memory for the alternate signal stack
    OutOfMemory,
    /// A signal handler could not be installed
    HandlerInstall {
        signal: i32,
        source: std::io::Error,
    },
    /// An I/O or other syscall failed
    Io(std::io::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(inner) | Self::HandlerInstall { source: inner, .. } => Some(inner),
            Self::OutOfMemory => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("unable to allocate memory"),
            Self::HandlerInstall { signal, source } => {
                write!(f, "unable to install handler for signal {signal}: {source}")
            }
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
