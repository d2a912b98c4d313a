use crate::Error;
use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

enum Slot<T> {
    Pending,
    Done(T),
    Abandoned,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// The result of a job submitted with [`crate::JobQueue::submit`]
pub struct JobTicket<T> {
    inner: Arc<Inner<T>>,
}

/// The job side of a [`JobTicket`]. If it is dropped without completing, eg.
/// because the job panicked or was discarded, the ticket is abandoned.
pub(crate) struct Completer<T> {
    inner: Option<Arc<Inner<T>>>,
}

pub(crate) fn ticket<T>() -> (JobTicket<T>, Completer<T>) {
    let inner = Arc::new(Inner {
        slot: Mutex::new(Slot::Pending),
        ready: Condvar::new(),
    });

    (
        JobTicket {
            inner: inner.clone(),
        },
        Completer { inner: Some(inner) },
    )
}

impl<T> Completer<T> {
    pub(crate) fn complete(mut self, value: T) {
        if let Some(inner) = self.inner.take() {
            *inner.slot.lock() = Slot::Done(value);
            inner.ready.notify_all();
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            *inner.slot.lock() = Slot::Abandoned;
            inner.ready.notify_all();
        }
    }
}

impl<T> JobTicket<T> {
    /// Whether the job has finished, successfully or not
    pub fn is_finished(&self) -> bool {
        !matches!(*self.inner.slot.lock(), Slot::Pending)
    }

    /// Blocks until the job has completed
    pub fn wait(self) -> Result<T, Error> {
        let mut slot = self.inner.slot.lock();

        while matches!(*slot, Slot::Pending) {
            self.inner.ready.wait(&mut slot);
        }

        take(&mut slot)
    }

    /// Blocks until the job has completed or `timeout` has elapsed.
    ///
    /// On timeout the ticket is consumed, the job still runs but its result
    /// is discarded.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, Error> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();

        while matches!(*slot, Slot::Pending) {
            if self.inner.ready.wait_until(&mut slot, deadline).timed_out()
                && matches!(*slot, Slot::Pending)
            {
                return Err(Error::Timeout);
            }
        }

        take(&mut slot)
    }
}

fn take<T>(slot: &mut Slot<T>) -> Result<T, Error> {
    match std::mem::replace(slot, Slot::Abandoned) {
        Slot::Done(value) => Ok(value),
        Slot::Abandoned | Slot::Pending => Err(Error::Abandoned),
    }
}
