//! Records where a panic was raised while the panicking frames still exist.
//!
//! By the time `catch_unwind` hands the payload to the bridge the stack has
//! been unwound, so the hook captures the context, a stack snapshot and the
//! chain of return addresses on behalf of the innermost armed translator.

use super::state;
use std::{ffi::c_void, panic, sync::Once};

/// The most return addresses recorded for one panic
const MAX_CALL_CHAIN: usize = 256;

/// Symbol prefixes of the frames between the panic hook and the code that
/// panicked
const PANIC_MACHINERY: &[&str] = &[
    "std::panicking::",
    "core::panicking::",
    "std::panic::panic_any",
    "std::sys::backtrace::",
    "std::sys_common::backtrace::",
    "rust_begin_unwind",
    "__rustc::rust_begin_unwind",
];

static INSTALL: Once = Once::new();

/// Chains our hook in front of the one that is currently set. It stays
/// installed for the rest of the process, but does nothing for panics raised
/// outside of a guarded scope.
pub(super) fn install() {
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if state::has_armed_translator() {
                state::capture_panic(record_call_chain());
            }
            previous(info);
        }));
    });
}

fn record_call_chain() -> Vec<u64> {
    let mut chain = Vec::with_capacity(64);
    backtrace::trace(|frame| {
        chain.push(frame.ip() as u64);
        chain.len() < MAX_CALL_CHAIN
    });

    let site = panic_site(&chain, is_panic_machinery);
    chain.split_off(site)
}

/// The index of the first frame after the run of panic machinery frames, or 0
/// if there is no such run, in which case the whole chain is kept
fn panic_site(chain: &[u64], is_machinery: impl Fn(u64) -> bool) -> usize {
    let mut in_machinery = false;

    for (i, ip) in chain.iter().enumerate() {
        if is_machinery(*ip) {
            in_machinery = true;
        } else if in_machinery {
            return i;
        }
    }

    0
}

fn is_panic_machinery(ip: u64) -> bool {
    let mut machinery = false;

    // Return addresses point at the instruction after the call
    backtrace::resolve(ip.saturating_sub(1) as usize as *mut c_void, |symbol| {
        if let Some(name) = symbol.name() {
            let name = format!("{name:#}");
            machinery |= PANIC_MACHINERY.iter().any(|prefix| name.starts_with(prefix));
        }
    });

    machinery
}
