//! Recovery actions that are useful at more than one call site

use std::{thread::JoinHandle, time::Duration};

/// Runs `f` on a helper thread once `delay` has passed.
///
/// Used for actions that can't run from inside the failing callback, eg. a
/// plugin unloading itself after it failed to load, which also gives the log
/// time to be flushed.
pub fn deferred(
    delay: Duration,
    f: impl FnOnce() + Send + 'static,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("deferred-recovery".to_owned())
        .spawn(move || {
            std::thread::sleep(delay);
            log::debug!("running deferred recovery");
            f();
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Instant;

    #[test]
    fn runs_after_delay() {
        let start = Instant::now();
        let (tx, rx) = std::sync::mpsc::channel();

        let handle = deferred(Duration::from_millis(30), move || {
            tx.send(Instant::now()).unwrap();
        })
        .unwrap();

        let ran_at = rx.recv().unwrap();
        assert!(ran_at.duration_since(start) >= Duration::from_millis(30));
        handle.join().unwrap();
    }
}
