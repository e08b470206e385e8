//! Default-disposition emulation
//!
//! When no registered handler claims a signal, the dispatcher runs whatever
//! disposition was in force before sigmux seized it. A real handler is simply
//! called. `SIG_DFL` and `SIG_IGN` have to be emulated, because the kernel
//! only ever sees the trampoline.
//!
//! Everything here runs in signal context.

use std::ffi::c_void;

use sigmux_osal::sigaction::zeroed_sigaction;
use sigmux_osal::{
    RealSigaction, abort_process, empty_sigset, raise_signal, set_thread_mask, sigset_add,
    unblock_signal,
};

use crate::hooks;

/// What running a saved disposition amounts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fallback {
    /// Call the saved handler
    Handler,
    /// Die from the signal, as the kernel's default would
    Terminate,
    /// Stop the process, as the kernel's default would for job control
    Stop,
    /// Nothing to do
    Ignore,
}

/// Signals whose kernel default is to do nothing
fn default_is_ignore(signum: i32) -> bool {
    matches!(
        signum,
        libc::SIGCHLD | libc::SIGWINCH | libc::SIGURG | libc::SIGCONT
    )
}

/// Synchronous faults: returning from the handler would just re-execute the
/// faulting instruction, so ignoring them still kills the process.
fn always_fatal(signum: i32) -> bool {
    matches!(
        signum,
        libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE | libc::SIGABRT
    )
}

fn is_job_control_stop(signum: i32) -> bool {
    matches!(signum, libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU)
}

pub(crate) fn classify(signum: i32, act: &libc::sigaction) -> Fallback {
    let siginfo = act.sa_flags & libc::SA_SIGINFO != 0;
    // A null `sa_sigaction` is SIG_DFL in both conventions.
    let is_default = act.sa_sigaction == libc::SIG_DFL;
    let is_ignore = !siginfo && act.sa_sigaction == libc::SIG_IGN;

    if !is_default && !is_ignore {
        Fallback::Handler
    } else if always_fatal(signum) {
        Fallback::Terminate
    } else if is_default && is_job_control_stop(signum) {
        Fallback::Stop
    } else if is_default && !default_is_ignore(signum) {
        Fallback::Terminate
    } else {
        Fallback::Ignore
    }
}

/// Whether `act` is plain `SIG_DFL` in either handler convention, as a
/// one-shot handler reads once it has fired
pub(crate) fn reads_as_default(act: &libc::sigaction) -> bool {
    act.sa_sigaction == libc::SIG_DFL
}

/// Run the saved disposition `act` for this delivery.
///
/// # Safety
///
/// `act` must be a disposition the application installed, and `info` and
/// `context` must be what the kernel passed for this delivery (or null); a
/// saved handler is called with them.
pub(crate) unsafe fn invoke(
    signum: i32,
    act: &libc::sigaction,
    info: *mut libc::siginfo_t,
    context: *mut c_void,
    real: &dyn RealSigaction,
) {
    let fallback = classify(signum, act);
    if always_fatal(signum) || fallback == Fallback::Terminate {
        hooks::sigmux_gdbhook_on_fatal_signal(info, context);
    }
    match fallback {
        Fallback::Handler => unsafe { call_handler(signum, act, info, context) },
        Fallback::Terminate => die(signum, real),
        Fallback::Stop => raise_signal(libc::SIGSTOP),
        Fallback::Ignore => {}
    }
}

unsafe fn call_handler(
    signum: i32,
    act: &libc::sigaction,
    info: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    // The mask the kernel would have applied for this handler.
    let mut mask = act.sa_mask;
    if act.sa_flags & libc::SA_NODEFER == 0 {
        sigset_add(&mut mask, signum);
    }
    let saved = sigmux_osal::current_thread_mask();
    set_thread_mask(&mask);

    if act.sa_flags & libc::SA_SIGINFO != 0 {
        let handler = unsafe {
            std::mem::transmute::<
                usize,
                extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void),
            >(act.sa_sigaction)
        };
        handler(signum, info, context);
    } else {
        let handler =
            unsafe { std::mem::transmute::<usize, extern "C" fn(libc::c_int)>(act.sa_sigaction) };
        handler(signum);
    }

    set_thread_mask(&saved);
}

/// Kill the process with `signum` itself so the parent sees the right
/// termination status.
fn die(signum: i32, real: &dyn RealSigaction) -> ! {
    let mut dfl = zeroed_sigaction();
    dfl.sa_sigaction = libc::SIG_DFL;
    dfl.sa_flags = libc::SA_RESTART;
    dfl.sa_mask = empty_sigset();
    let _ = real.sigaction(signum, Some(&dfl), None);

    unblock_signal(signum);
    raise_signal(signum);
    // Still alive: the signal was not fatal after all (or is blocked in a way
    // we cannot undo). Do not return into the faulting code.
    abort_process()
}
