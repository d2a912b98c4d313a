#![allow(unused_unsafe)]


use fault_bridge::FaultCode;

#[test]
fn captures_stack_overflow() {
    // Run on a thread with a known, small, stack so that the overflow is quick
    std::thread::Builder::new()
        .stack_size(256 * 1024)
        .spawn(|| {
            let exc = shared::captures(FaultCode::StackOverflow, || unsafe {
                sadness_generator::raise_stack_overflow();
            });

            assert!(exc.is_terminal());
            assert!(exc.stack().is_none(), "an overflowed stack is not copied");
        })
        .unwrap()
        .join()
        .unwrap();
}
