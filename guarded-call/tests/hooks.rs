
use guarded_call::{FaultCode, GuardedCall};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

#[test]
fn wrapped_hooks_survive_faults() {
    let harness = shared::harness(false);
    let calls = Arc::new(AtomicUsize::new(0));
    let recovered = Arc::new(AtomicUsize::new(0));

    let hook = GuardedCall::wrap_hook(
        harness.guard.clone(),
        "end play",
        {
            let calls = calls.clone();
            move || {
                if calls.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                    fault_bridge::simulate_fault(FaultCode::AccessViolation);
                }
            }
        },
        {
            let recovered = recovered.clone();
            move || {
                recovered.fetch_add(1, Ordering::SeqCst);
            }
        },
    );

    for _ in 0..4 {
        hook();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(recovered.load(Ordering::SeqCst), 2);

    let entries = harness.sink.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.contains("\nend play\n")));
}

#[test]
fn wrapped_hooks_take_arguments() {
    let harness = shared::harness(false);
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let hook = GuardedCall::wrap_hook_with(
        harness.guard.clone(),
        "map loaded",
        {
            let seen = seen.clone();
            move |map: String| {
                if map.is_empty() {
                    panic!("no map name");
                }
                seen.lock().push(map);
            }
        },
        || {},
    );

    hook("arena".to_owned());
    hook(String::new());
    hook("harbor".to_owned());

    assert_eq!(*seen.lock(), ["arena", "harbor"]);

    let entries = harness.sink.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].contains("no map name"));
}
