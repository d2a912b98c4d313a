#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("dump helper process failed with code {code}: {message}")]
    HelperFailed { code: i32, message: String },
    #[error("dump helper process was killed by signal {0}")]
    HelperKilled(i32),
}
