//! Runs callbacks handed to the host under a fault guard.
//!
//! A fault raised by a guarded callback is reported, with the call stack at
//! the point of the fault, a crash dump is written, and a recovery action is
//! run, after which the host carries on as if the callback returned. Faults
//! that can't be recovered from are passed back to the caller, or re-raised.

mod config;
mod errors;
mod log_sink;
pub mod recovery;
pub mod thread_role;

pub use config::GuardConfig;
pub use errors::Error;
pub use fault_bridge::{CapturedException, FaultCode};
pub use log_sink::{LogFacade, LogSink};

use crash_dumper::{CrashDumper, DumpBackend, DumpConfig, MinidumpBackend};
use fault_bridge::FaultInterceptor;
use stack_symbols::{CallStackEntry, SymbolSession};
use std::{
    fmt::Write as _,
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    sync::Arc,
};

/// The start of the first line of every crash entry written to the
/// [`LogSink`], the role of the faulting thread follows it
pub const CRASH_HEADER: &str = "Unhandled exception caught by guarded call";

/// What is left of a fault once it has been contained
#[derive(Debug)]
pub struct FaultSummary {
    pub code: FaultCode,
    /// The human readable description of the fault
    pub message: String,
    pub trace: Vec<CallStackEntry>,
    /// The crash dump, if one was written
    pub dump: Option<PathBuf>,
}

/// The result of a guarded call that was not stopped by a terminal fault
#[derive(Debug)]
pub enum Outcome<R> {
    /// The body ran to completion
    Completed(R),
    /// The body faulted, the fault was reported and the recovery ran
    Contained(FaultSummary),
}

impl<R> Outcome<R> {
    #[inline]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// The body's return value, if it completed
    #[inline]
    pub fn completed(self) -> Option<R> {
        match self {
            Self::Completed(r) => Some(r),
            Self::Contained(_) => None,
        }
    }

    #[inline]
    pub fn summary(&self) -> Option<&FaultSummary> {
        match self {
            Self::Completed(_) => None,
            Self::Contained(summary) => Some(summary),
        }
    }
}

pub struct GuardedCall {
    interceptor: Arc<dyn FaultInterceptor>,
    session: Arc<SymbolSession>,
    dumper: Option<CrashDumper>,
    sink: Arc<dyn LogSink>,
}

impl GuardedCall {
    /// Creates a guard that intercepts faults natively, resolves symbols of
    /// the calling process, writes minidumps and logs via [`LogFacade`]
    pub fn new(config: GuardConfig) -> Result<Self, Error> {
        Self::builder(config).build()
    }

    pub fn builder(config: GuardConfig) -> Builder {
        Builder {
            config,
            interceptor: None,
            session: None,
            dump_backend: None,
            sink: None,
        }
    }

    #[inline]
    pub fn session(&self) -> &SymbolSession {
        &self.session
    }

    #[inline]
    pub fn dumper(&self) -> Option<&CrashDumper> {
        self.dumper.as_ref()
    }

    /// Runs `body`, containing any non-terminal fault it raises.
    ///
    /// `recovery` only runs if `body` faulted and the fault was contained, and
    /// never more than once. A terminal fault is returned as is, without any
    /// diagnostics besides a single log line, it is up to the caller to
    /// propagate it, see [`Self::call_or_reraise`].
    pub fn call<R>(
        &self,
        description: &str,
        body: impl FnOnce() -> R,
        recovery: impl FnOnce(),
    ) -> Result<Outcome<R>, CapturedException> {
        let exception = match fault_bridge::capture(&*self.interceptor, body) {
            Ok(r) => return Ok(Outcome::Completed(r)),
            Err(exception) => exception,
        };

        if exception.is_terminal() {
            self.sink.write(&format!(
                "{description}: {} can't be recovered from, propagating",
                exception.code().description()
            ));
            return Err(exception);
        }

        let summary = self.report(description, exception);
        self.recover(description, recovery);

        Ok(Outcome::Contained(summary))
    }

    /// Same as [`Self::call`], but terminal faults are re-raised, which
    /// normally terminates the process
    pub fn call_or_reraise<R>(
        &self,
        description: &str,
        body: impl FnOnce() -> R,
        recovery: impl FnOnce(),
    ) -> Outcome<R> {
        match self.call(description, body, recovery) {
            Ok(outcome) => outcome,
            Err(exception) => exception.reraise(),
        }
    }

    /// Turns `hook` into a callback that can be registered with the host,
    /// every invocation is guarded by `guard`
    pub fn wrap_hook<F, Rec>(
        guard: Arc<Self>,
        description: impl Into<String>,
        hook: F,
        recovery: Rec,
    ) -> impl Fn() + Send + Sync + 'static
    where
        F: Fn() + Send + Sync + 'static,
        Rec: Fn() + Send + Sync + 'static,
    {
        let description = description.into();
        move || {
            guard.call_or_reraise(&description, &hook, &recovery);
        }
    }

    /// [`Self::wrap_hook`] for callbacks that take an argument
    pub fn wrap_hook_with<A, F, Rec>(
        guard: Arc<Self>,
        description: impl Into<String>,
        hook: F,
        recovery: Rec,
    ) -> impl Fn(A) + Send + Sync + 'static
    where
        F: Fn(A) + Send + Sync + 'static,
        Rec: Fn() + Send + Sync + 'static,
    {
        let description = description.into();
        move |arg| {
            guard.call_or_reraise(&description, || hook(arg), &recovery);
        }
    }

    fn report(&self, description: &str, exception: CapturedException) -> FaultSummary {
        let trace = self.session.walk_exception(Some(&exception));
        let message = exception.message();

        let mut entry = String::with_capacity(1024);
        // Writing to a String can't fail
        let _ = writeln!(entry, "{CRASH_HEADER} on {} thread", thread_role::current());
        let _ = writeln!(entry, "{description}");
        let _ = writeln!(entry, "{message}");
        entry.push('\n');
        entry.push_str(&stack_symbols::format_trace(&trace));

        self.sink.write(&entry);

        let dump = self
            .dumper
            .as_ref()
            .and_then(|dumper| match dumper.write(&exception) {
                Ok(path) => {
                    log::info!("wrote crash dump to {}", path.display());
                    Some(path)
                }
                Err(err) => {
                    log::warn!("failed to write crash dump: {err}");
                    None
                }
            });

        FaultSummary {
            code: exception.code(),
            message,
            trace,
            dump,
        }
    }

    fn recover(&self, description: &str, recovery: impl FnOnce()) {
        // A hardware fault raised by the recovery itself is not intercepted
        if let Err(payload) = catch_unwind(AssertUnwindSafe(recovery)) {
            let exception = CapturedException::from_panic(payload);
            log::error!("recovery of '{description}' panicked: {}", exception.message());
        }
    }
}

impl job_queue::JobWrapper for GuardedCall {
    fn run(&self, lane: &str, job: job_queue::Job) {
        self.call_or_reraise(&format!("job on '{lane}'"), job, || {});
    }
}

/// Assembles a [`GuardedCall`] out of replaceable parts
pub struct Builder {
    config: GuardConfig,
    interceptor: Option<Arc<dyn FaultInterceptor>>,
    session: Option<Arc<SymbolSession>>,
    dump_backend: Option<Box<dyn DumpBackend>>,
    sink: Option<Arc<dyn LogSink>>,
}

impl Builder {
    pub fn interceptor(mut self, interceptor: Arc<dyn FaultInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn session(mut self, session: Arc<SymbolSession>) -> Self {
        self.session = Some(session);
        self
    }

    /// Replaces the minidump writer, only used if dumps are enabled
    pub fn dump_backend(mut self, backend: Box<dyn DumpBackend>) -> Self {
        self.dump_backend = Some(backend);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<GuardedCall, Error> {
        let Self {
            config,
            interceptor,
            session,
            dump_backend,
            sink,
        } = self;

        let interceptor = match interceptor {
            Some(interceptor) => interceptor,
            None => native_interceptor()?,
        };

        let session = session.unwrap_or_else(|| {
            Arc::new(SymbolSession::new(
                config.symbol_path.clone(),
                config.walk,
            ))
        });

        let dumper = config.write_dumps.then(|| {
            let dump_config = DumpConfig::new(
                config.dump_directory.clone(),
                config.plugin_name.clone(),
                config.plugin_version.clone(),
            );
            let backend =
                dump_backend.unwrap_or_else(|| Box::new(MinidumpBackend::new()));
            CrashDumper::new(dump_config, backend)
        });

        log::debug!(
            "guarding calls of {} {}",
            config.plugin_name,
            config.plugin_version
        );

        Ok(GuardedCall {
            interceptor,
            session,
            dumper,
            sink: sink.unwrap_or_else(|| Arc::new(LogFacade)),
        })
    }
}

fn native_interceptor() -> Result<Arc<dyn FaultInterceptor>, Error> {
    Ok(Arc::new(fault_bridge::ExceptionBridge::attach()?))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn outcome_accessors() {
        let done: Outcome<u32> = Outcome::Completed(3);
        assert!(done.is_completed());
        assert!(done.summary().is_none());
        assert_eq!(done.completed(), Some(3));

        let contained: Outcome<u32> = Outcome::Contained(FaultSummary {
            code: FaultCode::Panic,
            message: "boom".to_owned(),
            trace: Vec::new(),
            dump: None,
        });
        assert!(!contained.is_completed());
        assert_eq!(contained.summary().unwrap().message, "boom");
        assert_eq!(contained.completed(), None);
    }
}
