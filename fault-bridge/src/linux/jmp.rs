//! FFI bindings for the non-local goto used to leave the signal handler.
//!
//! ```
//! use fault_bridge::jmp;
//!
//! unsafe {
//!     let mut jmp_buf = std::mem::MaybeUninit::uninit();
//!
//!     let val = jmp::sigsetjmp(jmp_buf.as_mut_ptr(), 1);
//!
//!     if val == 0 {
//!         jmp::siglongjmp(jmp_buf.as_mut_ptr(), 7);
//!     } else {
//!         assert_eq!(val, 7);
//!     }
//! }
//! ```

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        #[repr(C)]
        #[doc(hidden)]
        #[allow(non_camel_case_types)]
        pub struct __jmp_buf([u64; 8]);
    } else if #[cfg(target_arch = "aarch64")] {
        #[repr(C)]
        #[doc(hidden)]
        #[allow(non_camel_case_types)]
        pub struct __jmp_buf([u64; 22]);
    } else {
        compile_error!("the jump buffer layout is only known for x86_64 and aarch64");
    }
}

/// The register state of a point in execution at the time of a [`sigsetjmp`]
/// call, which [`siglongjmp`] returns to.
///
/// The saved mask is a full kernel `sigset_t`, which is 8 byte aligned, so the
/// padding after `__fl` is part of the layout.
#[repr(C)]
pub struct JmpBuf {
    /// CPU context
    __jmp_buf: __jmp_buf,
    /// Whether the signal mask was saved
    __fl: u32,
    /// Saved signal mask
    __ss: [u64; 16],
}

unsafe extern "C" {
    /// Saves the calling environment, and the signal mask if `save_mask` is
    /// non-zero.
    ///
    /// Returns 0 on the direct invocation, and the value passed to
    /// [`siglongjmp`] when returning to the call site through it.
    ///
    /// See [sigsetjmp](https://man7.org/linux/man-pages/man3/sigsetjmp.3p.html).
    #[cfg_attr(target_env = "gnu", link_name = "__sigsetjmp")]
    pub fn sigsetjmp(jb: *mut JmpBuf, save_mask: i32) -> i32;
    /// Restores the environment saved by [`sigsetjmp`], a `val` of 0 is
    /// changed to 1.
    ///
    /// See [siglongjmp](https://man7.org/linux/man-pages/man3/siglongjmp.3p.html).
    pub fn siglongjmp(jb: *mut JmpBuf, val: i32) -> !;
}
