/// The host's text log, which takes pre-formatted, possibly multi-line, text
pub trait LogSink: Send + Sync {
    fn write(&self, text: &str);
}

/// Forwards everything to the [`log`] facade at error level
#[derive(Copy, Clone, Debug, Default)]
pub struct LogFacade;

impl LogSink for LogFacade {
    fn write(&self, text: &str) {
        log::error!("{text}");
    }
}
