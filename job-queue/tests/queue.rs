use job_queue::{CatchPanics, Error, JobQueue};
use parking_lot::Mutex;
use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

#[test]
fn runs_in_order() {
    let sink = Arc::new(Mutex::new(Vec::new()));

    {
        let queue = JobQueue::new("ordered").unwrap();
        for i in 1..=200 {
            let sink = sink.clone();
            queue.add_job(move || sink.lock().push(i)).unwrap();
        }

        // Dropping drains the queue
    }

    assert_eq!(*sink.lock(), (1..=200).collect::<Vec<_>>());
}

#[test]
fn one_job_at_a_time() {
    let queue = JobQueue::new("serial").unwrap();
    let running = Arc::new(Mutex::new(0u32));
    let max = Arc::new(Mutex::new(0u32));

    for _ in 0..20 {
        let running = running.clone();
        let max = max.clone();
        queue
            .add_job(move || {
                {
                    let mut running = running.lock();
                    *running += 1;
                    let mut max = max.lock();
                    *max = (*max).max(*running);
                }
                std::thread::sleep(Duration::from_millis(1));
                *running.lock() -= 1;
            })
            .unwrap();
    }

    queue.wait_idle();
    assert_eq!(*max.lock(), 1);
}

#[test]
fn busy_until_idle() {
    let queue = JobQueue::new("busy").unwrap();
    assert!(!queue.is_busy());

    let (tx, rx) = mpsc::channel::<()>();
    queue
        .add_job(move || {
            let _ = rx.recv();
        })
        .unwrap();

    assert!(queue.is_busy());

    drop(tx);
    queue.wait_idle();
    assert!(!queue.is_busy());
}

#[test]
fn submit_returns_results() {
    let queue = JobQueue::new("results").unwrap();

    let ticket = queue.submit(|| 6 * 7).unwrap();
    assert_eq!(ticket.wait().unwrap(), 42);

    let (tx, rx) = mpsc::channel::<()>();
    let slow = queue
        .submit(move || {
            let _ = rx.recv();
            "late"
        })
        .unwrap();

    assert!(matches!(
        slow.wait_timeout(Duration::from_millis(10)),
        Err(Error::Timeout)
    ));

    // The late result is discarded, but the job still finishes
    drop(tx);
    queue.wait_idle();
}

#[test]
fn panicking_job_kills_lane() {
    let queue = JobQueue::new("fragile").unwrap();

    let (tx, rx) = mpsc::channel::<()>();
    queue
        .add_job(move || {
            let _ = rx.recv();
            panic!("job failed");
        })
        .unwrap();

    // Queued behind the panicking job, never runs
    let stranded = queue.submit(|| 1).unwrap();

    drop(tx);
    queue.wait_idle();

    assert!(queue.is_dead());
    assert!(!queue.is_busy());
    assert!(matches!(stranded.wait(), Err(Error::Abandoned)));
    assert!(matches!(queue.add_job(|| {}), Err(Error::DeadLane(name)) if name == "fragile"));
}

#[test]
fn wrapper_contains_panics() {
    let queue = JobQueue::with_wrapper("sturdy", Arc::new(CatchPanics)).unwrap();

    queue.add_job(|| panic!("job failed")).unwrap();
    let ticket = queue.submit(|| 2).unwrap();

    assert_eq!(ticket.wait().unwrap(), 2);
    assert!(!queue.is_dead());
}

#[test]
fn rejects_jobs_after_shutdown() {
    let queue = JobQueue::new("closing").unwrap();
    let ran = Arc::new(Mutex::new(false));

    {
        let ran = ran.clone();
        queue.add_job(move || *ran.lock() = true).unwrap();
    }

    queue.shutdown();
    assert!(matches!(queue.add_job(|| {}), Err(Error::ShutDown(_))));

    drop(queue);
    assert!(*ran.lock(), "jobs queued before shutdown still run");
}
