use fault_bridge::ExceptionBridge;
use stack_symbols::{SymbolSession, WalkOptions};

#[inline(never)]
fn walk_from_here(session: &SymbolSession) -> Vec<stack_symbols::CallStackEntry> {
    let entries = session.walk_exception(None);
    std::hint::black_box(entries)
}

#[test]
fn walks_live_stack() {
    let session = SymbolSession::new(None, WalkOptions::default());

    let entries = walk_from_here(&session);
    assert!(!entries.is_empty());

    let first = &entries[0];
    assert!(
        first.symbol_name().is_some_and(|name| name.contains("walk_process")),
        "{first}"
    );
    assert!(first.module.is_some());

    assert!(
        entries
            .iter()
            .any(|entry| entry.symbol_name().is_some_and(|name| name.contains("walk_from_here"))),
        "{}",
        stack_symbols::format_trace(&entries)
    );
}

#[inline(never)]
fn faulting_function() -> u32 {
    unsafe { std::ptr::read_volatile(32usize as *const u32) }
}

#[inline(never)]
fn calls_faulting_function() -> u32 {
    std::hint::black_box(faulting_function()) + 1
}

#[test]
fn walks_captured_fault() {
    let bridge = ExceptionBridge::attach().unwrap();
    let session = SymbolSession::new(None, WalkOptions::default());

    let exc = fault_bridge::capture(&bridge, calls_faulting_function).unwrap_err();

    // Clobber the stack the fault happened on, the walk has to use the copy
    std::hint::black_box([0u8; 4096]);

    let entries = session.walk_exception(Some(&exc));
    let trace = stack_symbols::format_trace(&entries);

    assert_eq!(entries[0].address, exc.registers().unwrap().ip, "{trace}");
    assert!(
        entries[0]
            .symbol_name()
            .is_some_and(|name| name.contains("faulting_function")),
        "{trace}"
    );
    assert!(
        entries
            .iter()
            .any(|entry| entry.symbol_name().is_some_and(|name| name.contains("calls_faulting_function"))),
        "{trace}"
    );
}

#[inline(never)]
fn rejects_settings(value: u32) -> u32 {
    if std::hint::black_box(value) > 2 {
        panic!("setting out of range: {value}");
    }
    value
}

#[inline(never)]
fn loads_settings() -> u32 {
    std::hint::black_box(rejects_settings(7)) + 1
}

#[test]
fn walks_panic_site() {
    let bridge = ExceptionBridge::attach().unwrap();
    let session = SymbolSession::new(None, WalkOptions::default());

    let exc = fault_bridge::capture(&bridge, loads_settings).unwrap_err();
    assert_eq!(exc.code(), fault_bridge::FaultCode::Panic);

    let entries = session.walk_exception(Some(&exc));
    let trace = stack_symbols::format_trace(&entries);

    // The hook and the panic machinery are not part of the trace
    assert!(
        entries[0]
            .symbol_name()
            .is_some_and(|name| name.contains("rejects_settings")),
        "{trace}"
    );
    assert!(entries[0].module.is_some(), "{trace}");
    assert!(
        entries
            .iter()
            .any(|entry| entry.symbol_name().is_some_and(|name| name.contains("loads_settings"))),
        "{trace}"
    );
}
