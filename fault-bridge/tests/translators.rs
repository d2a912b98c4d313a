use fault_bridge::{
    CapturedException, ExceptionBridge, FaultCode, FaultInterceptor, active_translator,
    simulate_fault,
};

#[test]
fn scoped_installation_restores_previous() {
    let bridge = ExceptionBridge::attach().unwrap();

    assert!(active_translator().is_none());

    let outer = bridge.install_scoped();
    assert_eq!(active_translator(), Some(outer.id()));

    {
        let inner = bridge.install_scoped();
        assert_eq!(active_translator(), Some(inner.id()));
        assert_ne!(inner.id(), outer.id());
    }

    assert_eq!(active_translator(), Some(outer.id()));
    drop(outer);
    assert!(active_translator().is_none());
}

#[test]
fn restores_after_panic() {
    let bridge = ExceptionBridge::attach().unwrap();
    let outer = bridge.install_scoped();

    let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _inner = bridge.install_scoped();
        panic!("unwinding through a scope");
    }));

    assert!(res.is_err());
    assert_eq!(active_translator(), Some(outer.id()));
}

#[test]
fn restores_after_fault() {
    let bridge = ExceptionBridge::attach().unwrap();
    let outer = bridge.install_scoped();

    let exc = fault_bridge::capture(&bridge, || {
        assert_ne!(active_translator(), Some(outer.id()));
        unsafe { std::ptr::read_volatile(8usize as *const u8) }
    })
    .unwrap_err();

    assert_eq!(exc.code(), FaultCode::AccessViolation);
    assert_eq!(active_translator(), Some(outer.id()));
}

#[test]
fn converts_panics() {
    let bridge = ExceptionBridge::attach().unwrap();

    let exc: CapturedException = fault_bridge::capture(&bridge, || {
        panic!("the body panicked with {}", 3);
    })
    .unwrap_err();

    assert_eq!(exc.code(), FaultCode::Panic);
    assert_eq!(exc.panic_message(), Some("the body panicked with 3"));
    assert!(!exc.is_terminal());

    // The panic site was recorded before unwinding
    assert!(exc.context().is_some());
    assert!(exc.stack().is_some());
    assert!(!exc.call_chain().is_empty());
    assert_eq!(exc.pid(), std::process::id());
}

#[test]
fn panics_outside_scopes_record_nothing() {
    let bridge = ExceptionBridge::attach().unwrap();

    // Caught by the body itself, so the scope completes
    let caught = fault_bridge::capture(&bridge, || {
        std::panic::catch_unwind(|| panic!("handled by the body")).is_err()
    });
    assert!(caught.unwrap());

    let unguarded = std::panic::catch_unwind(|| panic!("no scope"));
    assert!(unguarded.is_err());

    // A scope that faults for real afterwards only sees its own fault
    let exc = fault_bridge::capture(&bridge, || simulate_fault(FaultCode::BusError)).unwrap_err();
    assert_eq!(exc.code(), FaultCode::BusError);
    assert!(exc.call_chain().is_empty());
}

#[test]
fn passes_through_results() {
    let bridge = ExceptionBridge::attach().unwrap();
    assert_eq!(fault_bridge::capture(&bridge, || 42).unwrap(), 42);
}

#[test]
fn nested_fault_goes_to_innermost() {
    let bridge = ExceptionBridge::attach().unwrap();

    let outer = fault_bridge::capture(&bridge, || {
        let inner = fault_bridge::capture(&bridge, || simulate_fault(FaultCode::BusError));
        inner.unwrap_err().code()
    });

    assert_eq!(outer.unwrap(), FaultCode::BusError);
}

#[test]
fn simulates_faults() {
    let bridge = ExceptionBridge::attach().unwrap();

    for code in [
        FaultCode::StackOverflow,
        FaultCode::Breakpoint,
        FaultCode::NonContinuable,
        FaultCode::IllegalInstruction,
    ] {
        let exc = fault_bridge::capture::<()>(&bridge, || {
            simulate_fault(code);
            unreachable!("simulating a fault inside a scope does not return");
        })
        .unwrap_err();

        assert_eq!(exc.code(), code);
        assert_eq!(exc.signal(), code.signal());
        assert_eq!(exc.is_terminal(), code.is_terminal());
        assert!(exc.registers().is_some());
        assert!(exc.stack().is_some());
    }

    // Nothing to jump to
    assert!(!simulate_fault(FaultCode::Breakpoint));
}

#[test]
fn bridges_are_reference_counted() {
    let first = ExceptionBridge::attach().unwrap();
    let second = ExceptionBridge::attach().unwrap();

    first.detach();

    let exc = fault_bridge::capture(&second, || unsafe {
        std::ptr::read_volatile(24usize as *const u8)
    })
    .unwrap_err();
    assert_eq!(exc.fault_address(), 24);
}
