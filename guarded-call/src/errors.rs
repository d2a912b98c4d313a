#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to attach the exception bridge")]
    Bridge(#[from] fault_bridge::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
