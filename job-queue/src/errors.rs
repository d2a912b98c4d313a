#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("job queue '{0}' is shutting down")]
    ShutDown(String),
    #[error("the worker of job queue '{0}' died")]
    DeadLane(String),
    #[error("job pool has no lane {lane}, it has {count}")]
    NoSuchLane { lane: usize, count: usize },
    #[error("timed out waiting for the job to complete")]
    Timeout,
    #[error("the job was dropped before it completed")]
    Abandoned,
    #[error(transparent)]
    Spawn(#[from] std::io::Error),
}
