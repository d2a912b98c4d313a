use crate::{Error, Job, JobTicket, JobWrapper, ticket};
use parking_lot::{Condvar, Mutex};
use std::{collections::VecDeque, sync::Arc, thread::JoinHandle};

#[derive(Default)]
struct State {
    jobs: VecDeque<Job>,
    /// Set while the worker is running a job
    executing: bool,
    shutdown: bool,
    /// The worker was killed by a panicking job
    dead: bool,
}

impl State {
    #[inline]
    fn is_busy(&self) -> bool {
        !self.jobs.is_empty() || self.executing
    }
}

struct Shared {
    name: String,
    state: Mutex<State>,
    /// Signaled when a job is queued or shutdown is requested
    work: Condvar,
    /// Signaled whenever the queue may have become idle
    idle: Condvar,
    wrapper: Option<Arc<dyn JobWrapper>>,
}

/// An ordered queue of jobs run one at a time, in the order they were added,
/// on a dedicated worker thread.
///
/// Dropping the queue waits for the worker to finish every job that was
/// added before the drop.
pub struct JobQueue {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl JobQueue {
    /// Creates a queue whose jobs run unguarded, a job that panics kills the
    /// worker.
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        Self::create(name.into(), None)
    }

    /// Creates a queue that runs every job through `wrapper`
    pub fn with_wrapper(
        name: impl Into<String>,
        wrapper: Arc<dyn JobWrapper>,
    ) -> Result<Self, Error> {
        Self::create(name.into(), Some(wrapper))
    }

    fn create(name: String, wrapper: Option<Arc<dyn JobWrapper>>) -> Result<Self, Error> {
        let shared = Arc::new(Shared {
            name,
            state: Mutex::new(State::default()),
            work: Condvar::new(),
            idle: Condvar::new(),
            wrapper,
        });

        let worker = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(shared.name.clone())
                .spawn(move || worker_loop(&shared))?
        };

        log::debug!("started job queue '{}'", shared.name);

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Appends a job to the queue. Can be called from any thread.
    ///
    /// Jobs added after [`Self::shutdown`], or after the worker died, are
    /// dropped.
    pub fn add_job(&self, job: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        self.push(Box::new(job))
    }

    fn push(&self, job: Job) -> Result<(), Error> {
        let mut state = self.shared.state.lock();

        if state.dead {
            log::warn!("dropping job for dead job queue '{}'", self.shared.name);
            return Err(Error::DeadLane(self.shared.name.clone()));
        }

        if state.shutdown {
            log::warn!("dropping job for job queue '{}' which is shutting down", self.shared.name);
            return Err(Error::ShutDown(self.shared.name.clone()));
        }

        state.jobs.push_back(job);
        self.shared.work.notify_one();
        Ok(())
    }

    /// Queues a job whose result can be waited on through the returned ticket
    pub fn submit<T, F>(&self, job: F) -> Result<JobTicket<T>, Error>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (ticket, completer) = ticket::ticket();
        self.push(Box::new(move || completer.complete(job())))?;
        Ok(ticket)
    }

    /// Whether a job is queued or running.
    ///
    /// This is a snapshot that may be stale as soon as it is returned, use
    /// [`Self::wait_idle`] to actually wait for the queue.
    pub fn is_busy(&self) -> bool {
        self.shared.state.lock().is_busy()
    }

    /// Whether the worker was killed by a panicking job
    pub fn is_dead(&self) -> bool {
        self.shared.state.lock().dead
    }

    /// Blocks until no job is queued or running, or the worker has died
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while state.is_busy() && !state.dead {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Stops accepting new jobs, the jobs that are already queued still run
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.work.notify_all();
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown();

        if let Some(worker) = self.worker.take() {
            if let Err(payload) = worker.join() {
                log::error!(
                    "job queue '{}' worker died: {}",
                    self.shared.name,
                    crate::panic_message(payload.as_ref())
                );
            } else {
                log::debug!("stopped job queue '{}'", self.shared.name);
            }
        }
    }
}

/// Clears the executing flag once a job is done, including when the job
/// unwinds out of the worker
struct Executing<'s>(&'s Shared);

impl Drop for Executing<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.executing = false;

        if std::thread::panicking() {
            state.dead = true;

            // Nothing will ever run these
            let dropped = std::mem::take(&mut state.jobs);
            log::error!(
                "a job panicked and killed the worker of job queue '{}', dropping {} queued jobs",
                self.0.name,
                dropped.len()
            );

            // Release the lock before the jobs, which may be holding tickets
            drop(state);
            drop(dropped);
        }

        self.0.idle.notify_all();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    state.executing = true;
                    break Some(job);
                }

                if state.shutdown {
                    break None;
                }

                shared.work.wait(&mut state);
            }
        };

        let Some(job) = job else {
            return;
        };

        let _executing = Executing(shared);
        match &shared.wrapper {
            Some(wrapper) => wrapper.run(&shared.name, job),
            None => job(),
        }
    }
}
