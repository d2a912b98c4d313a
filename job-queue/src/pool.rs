use crate::{Error, JobQueue, JobWrapper};
use parking_lot::Mutex;
use std::{ops::Range, sync::Arc, thread::JoinHandle};

/// Splits `range` into `n` contiguous slices of near equal length.
///
/// Every slice but the last has `ceil(len / n)` elements, slices that would be
/// empty are left out, so fewer than `n` slices are returned for short ranges.
pub fn partition(range: Range<usize>, n: usize) -> Vec<Range<usize>> {
    let len = range.end.saturating_sub(range.start);
    if n == 0 || len == 0 {
        return Vec::new();
    }

    let step = len.div_ceil(n);

    (0..n)
        .map(|i| {
            let begin = range.start + (i * step).min(len);
            let end = range.start + ((i + 1) * step).min(len);
            begin..end
        })
        .filter(|slice| !slice.is_empty())
        .collect()
}

/// A fixed set of workers ("lanes").
///
/// Lanes are either transient threads that each work through one slice of a
/// range, see [`Self::for_range`], or persistent [`JobQueue`]s that jobs can
/// be added to, see [`Self::new`]. There is no ordering between lanes.
pub struct JobPool {
    name: String,
    lanes: Vec<JobQueue>,
    transient: Mutex<Vec<JoinHandle<()>>>,
}

impl JobPool {
    /// Runs `job` for every index in `range`, spread over `n` threads that
    /// exit once their slice is done. [`Self::wait`] joins them.
    pub fn for_range<F>(n: usize, range: Range<usize>, job: F) -> Result<Self, Error>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let job = Arc::new(job);
        let mut threads = Vec::with_capacity(n);

        for (i, slice) in partition(range, n).into_iter().enumerate() {
            let job = job.clone();
            let thread = std::thread::Builder::new()
                .name(format!("job-pool-{i}"))
                .spawn(move || slice.for_each(|index| job(index)));

            match thread {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    // Don't leave the slices that did start running unattended
                    join_all("job-pool", threads);
                    return Err(err.into());
                }
            }
        }

        Ok(Self {
            name: "job-pool".to_owned(),
            lanes: Vec::new(),
            transient: Mutex::new(threads),
        })
    }

    /// Creates a pool of `n` persistent lanes, named `{name}-{index}`
    pub fn new(name: impl Into<String>, n: usize) -> Result<Self, Error> {
        Self::create(name.into(), n, None)
    }

    /// Creates a pool of `n` persistent lanes that run every job through
    /// `wrapper`
    pub fn with_wrapper(
        name: impl Into<String>,
        n: usize,
        wrapper: Arc<dyn JobWrapper>,
    ) -> Result<Self, Error> {
        Self::create(name.into(), n, Some(wrapper))
    }

    fn create(name: String, n: usize, wrapper: Option<Arc<dyn JobWrapper>>) -> Result<Self, Error> {
        let lanes = (0..n)
            .map(|i| {
                let lane_name = format!("{name}-{i}");
                match &wrapper {
                    Some(wrapper) => JobQueue::with_wrapper(lane_name, wrapper.clone()),
                    None => JobQueue::new(lane_name),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name,
            lanes,
            transient: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The persistent lanes of the pool
    #[inline]
    pub fn lanes(&self) -> &[JobQueue] {
        &self.lanes
    }

    /// Adds a job to the persistent lane with index `lane`
    pub fn add_job(&self, lane: usize, job: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        self.lanes
            .get(lane)
            .ok_or(Error::NoSuchLane {
                lane,
                count: self.lanes.len(),
            })?
            .add_job(job)
    }

    /// Partitions `range` over the persistent lanes, queueing one job per
    /// slice that runs `job` for every index of it
    pub fn dispatch_range<F>(&self, range: Range<usize>, job: F) -> Result<(), Error>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let job = Arc::new(job);

        for (lane, slice) in self.lanes.iter().zip(partition(range, self.lanes.len())) {
            let job = job.clone();
            lane.add_job(move || slice.for_each(|index| job(index)))?;
        }

        Ok(())
    }

    /// Whether any lane is still working
    pub fn is_busy(&self) -> bool {
        self.transient.lock().iter().any(|thread| !thread.is_finished())
            || self.lanes.iter().any(JobQueue::is_busy)
    }

    /// Joins the transient threads, then waits until every persistent lane
    /// is idle
    pub fn wait(&self) {
        let threads = std::mem::take(&mut *self.transient.lock());
        join_all(&self.name, threads);

        for lane in &self.lanes {
            lane.wait_idle();
        }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        self.wait();
    }
}

fn join_all(name: &str, threads: Vec<JoinHandle<()>>) {
    for thread in threads {
        let thread_name = thread.thread().name().unwrap_or("<unnamed>").to_owned();
        if thread.join().is_err() {
            log::error!("worker '{thread_name}' of job pool '{name}' panicked");
        }
    }
}
