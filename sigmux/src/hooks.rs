//! Debugger breakpoint hooks
//!
//! Empty functions with stable, unmangled names. A debugger sets a breakpoint
//! on them to stop exactly when sigmux is about to kill the process for a
//! fatal signal, or when it seizes a new signal (a good moment to tell the
//! debugger to stop intercepting that signal).

use std::ffi::c_void;
use std::hint::black_box;

use sigmux_osal::compiler_barrier;

/// Called on the signal path before sigmux runs the saved disposition of a
/// fault signal, and before it re-raises any signal that is about to kill
/// the process.
#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn sigmux_gdbhook_on_fatal_signal(info: *mut libc::siginfo_t, context: *mut c_void) {
    black_box((info, context));
    #[cfg(test)]
    FATAL_HOOK_CALLS.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    compiler_barrier();
}

#[cfg(test)]
pub(crate) static FATAL_HOOK_CALLS: std::sync::atomic::AtomicUsize =
    std::sync::atomic::AtomicUsize::new(0);

/// Called after sigmux installs its trampoline for a signal.
#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn sigmux_gdbhook_on_signal_seized() {
    black_box(());
    compiler_barrier();
}
