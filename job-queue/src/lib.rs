//! Moves blocking work off latency sensitive threads.
//!
//! A [`JobQueue`] runs jobs one at a time, in the order they were added, on a
//! dedicated thread. A [`JobPool`] spreads a range of work over a fixed number
//! of lanes, either transient threads or persistent queues.
//!
//! A job that panics is only contained if its queue was created with a
//! [`JobWrapper`], otherwise it kills the worker, which leaves the lane dead.
//! Dead lanes are not restarted.

mod errors;
mod pool;
mod queue;
mod ticket;

pub use errors::Error;
pub use pool::{JobPool, partition};
pub use queue::JobQueue;
pub use ticket::JobTicket;

/// A deferred unit of work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs on behalf of a queue, eg. to contain faults raised by them.
pub trait JobWrapper: Send + Sync {
    /// Runs `job`, which was taken from the queue named `lane`.
    ///
    /// A panic that escapes this function kills the worker of the lane.
    fn run(&self, lane: &str, job: Job);
}

/// Contains panics raised by jobs by logging them
pub struct CatchPanics;

impl JobWrapper for CatchPanics {
    fn run(&self, lane: &str, job: Job) {
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
            log::error!("job on '{lane}' panicked: {}", panic_message(payload.as_ref()));
        }
    }
}

/// The text of a panic payload. `panic!` only ever produces a `&'static str`
/// or a `String`, `Box<str>` shows up when a payload is passed to
/// `resume_unwind` by hand.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = payload.downcast_ref::<Box<str>>() {
        &**s
    } else {
        "unknown panic"
    }
}
