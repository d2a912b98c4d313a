
use guarded_call::FaultCode;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn terminal_faults_propagate_without_recovery() {
    for code in [
        FaultCode::StackOverflow,
        FaultCode::Breakpoint,
        FaultCode::NonContinuable,
        FaultCode::ExternalBreak,
    ] {
        let harness = shared::harness(false);
        let recovered = AtomicUsize::new(0);

        let result = harness.guard.call(
            "draw overlay",
            || {
                assert!(fault_bridge::simulate_fault(code));
            },
            || {
                recovered.fetch_add(1, Ordering::SeqCst);
            },
        );

        let exc = result.expect_err("terminal faults are not contained");
        assert_eq!(exc.code(), code);
        assert!(exc.is_terminal());

        assert_eq!(recovered.load(Ordering::SeqCst), 0, "{code:?}");
        assert_eq!(harness.dumps_written(), 0, "{code:?}");

        let entries = harness.sink.entries();
        assert_eq!(entries.len(), 1, "{code:?}");
        assert!(entries[0].starts_with("draw overlay: "));
        assert!(!entries[0].contains(guarded_call::CRASH_HEADER));
        assert_eq!(entries[0].lines().count(), 1);

        assert!(fault_bridge::active_translator().is_none());
    }
}
