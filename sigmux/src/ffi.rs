//! C ABI over the global multiplexer
//!
//! Errors are reported C-style: `-1` or `NULL`, with `errno` set.

#![allow(non_camel_case_types)]

use std::ffi::{c_int, c_uint, c_void};

use sigmux_common::SigmuxError;
use sigmux_osal::{OsSigaction, SigactionFn, SignalSet, set_errno};
use sigmux_phaser::CriticalSection;

use crate::control::{SigactionImpl, Sigmux};
use crate::handler::{DispatchFlags, RegisterFlags, SigmuxAction, SignalHandler, SignalInfo};
use crate::registry::Registration;

pub const SIGMUX_CONTINUE_SEARCH: c_int = 0;
pub const SIGMUX_CONTINUE_EXECUTION: c_int = 1;

pub const SIGMUX_HANDLE_SIGNAL_NORMAL_PRIORITY: c_uint = DispatchFlags::NORMAL_PRIORITY.bits();
pub const SIGMUX_HANDLE_SIGNAL_LOW_PRIORITY: c_uint = DispatchFlags::LOW_PRIORITY.bits();
pub const SIGMUX_HANDLE_SIGNAL_INVOKE_DEFAULT: c_uint = DispatchFlags::INVOKE_DEFAULT.bits();

pub const SIGMUX_REGISTER_LOW_PRIORITY: c_uint = RegisterFlags::LOW_PRIORITY.bits();

/// What a C handler receives
#[repr(C)]
#[derive(Debug)]
pub struct sigmux_siginfo {
    pub signum: c_int,
    pub info: *mut libc::siginfo_t,
    pub context: *mut c_void,
}

/// `sigmux_siginfo` plus the dispatcher's critical section, for
/// [`sigmux_leave_handler`]
#[repr(C)]
struct CSignalInfo {
    public: sigmux_siginfo,
    section: *const CriticalSection<'static>,
}

pub type sigmux_handler =
    unsafe extern "C" fn(info: *mut sigmux_siginfo, data: *mut c_void) -> c_int;

/// Opaque registration handle
#[derive(Debug)]
pub struct sigmux_registration(Registration);

struct CHandler {
    func: sigmux_handler,
    data: *mut c_void,
}

// SAFETY: the C caller of `sigmux_register` vouches that `data` may be used
// from any thread's signal context.
unsafe impl Send for CHandler {}
unsafe impl Sync for CHandler {}

impl SignalHandler for CHandler {
    fn handle(&self, info: &SignalInfo<'_>) -> SigmuxAction {
        let mut cinfo = CSignalInfo {
            public: sigmux_siginfo {
                signum: info.signum(),
                info: info.info(),
                context: info.context(),
            },
            section: std::ptr::from_ref(info.section()).cast(),
        };
        match unsafe { (self.func)(&mut cinfo.public, self.data) } {
            SIGMUX_CONTINUE_EXECUTION => SigmuxAction::ContinueExecution,
            _ => SigmuxAction::ContinueSearch,
        }
    }
}

fn fail(err: SigmuxError) -> c_int {
    set_errno(err.raw_os_error());
    -1
}

#[unsafe(no_mangle)]
pub extern "C" fn sigmux_init(signum: c_int) -> c_int {
    match Sigmux::global().init(signum) {
        Ok(()) => 0,
        Err(err) => fail(err),
    }
}

/// # Safety
///
/// `signals` must point to a valid `sigset_t`. `handler` is called from
/// signal context on any thread with `data`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sigmux_register(
    signals: *const libc::sigset_t,
    handler: Option<sigmux_handler>,
    data: *mut c_void,
    flags: c_uint,
) -> *mut sigmux_registration {
    let (Some(signals), Some(func)) = (unsafe { signals.as_ref() }, handler) else {
        fail(SigmuxError::InvalidArgument("null signal set or handler"));
        return std::ptr::null_mut();
    };
    let result = Sigmux::global().register(
        SignalSet::from_sigset(signals),
        CHandler { func, data },
        RegisterFlags::from_bits_truncate(flags),
    );
    match result {
        Ok(reg) => Box::into_raw(Box::new(sigmux_registration(reg))),
        Err(err) => {
            fail(err);
            std::ptr::null_mut()
        }
    }
}

/// Remove a registration. Blocks until no dispatcher is running its handler.
///
/// # Safety
///
/// `reg` must come from `sigmux_register` and not have been unregistered.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sigmux_unregister(reg: *mut sigmux_registration) -> c_int {
    if reg.is_null() {
        return fail(SigmuxError::InvalidArgument("null registration"));
    }
    let reg = unsafe { Box::from_raw(reg) };
    match Sigmux::global().unregister(reg.0) {
        Ok(()) => 0,
        Err(err) => fail(err),
    }
}

/// # Safety
///
/// `act` and `oldact` must each be null or valid.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sigmux_sigaction(
    signum: c_int,
    act: *const libc::sigaction,
    oldact: *mut libc::sigaction,
) -> c_int {
    let (act, oldact) = unsafe { (act.as_ref(), oldact.as_mut()) };
    match Sigmux::global().sigaction(signum, act, oldact) {
        Ok(()) => 0,
        Err(err) => fail(err),
    }
}

/// Replace the `sigaction` sigmux uses; `NULL` restores libc's. Returns the
/// previous function, or `NULL` if it was libc's or not a C function.
///
/// # Safety
///
/// `func` must behave like `sigaction(2)` and be async-signal-safe.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sigmux_set_real_sigaction(func: Option<SigactionFn>) -> Option<SigactionFn> {
    let imp = match func {
        Some(func) => SigactionImpl::Os(unsafe { OsSigaction::from_fn(func) }),
        None => SigactionImpl::libc(),
    };
    match Sigmux::global().set_real_sigaction(imp) {
        SigactionImpl::Os(os) if os.function() as usize != libc::sigaction as usize => {
            Some(os.function())
        }
        _ => None,
    }
}

/// # Safety
///
/// Same as [`Sigmux::handle_signal`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sigmux_handle_signal(
    signum: c_int,
    info: *mut libc::siginfo_t,
    context: *mut c_void,
    flags: c_uint,
) -> c_int {
    let flags = DispatchFlags::from_bits_truncate(flags);
    match unsafe { Sigmux::global().handle_signal(signum, info, context, flags) } {
        SigmuxAction::ContinueExecution => SIGMUX_CONTINUE_EXECUTION,
        SigmuxAction::ContinueSearch => SIGMUX_CONTINUE_SEARCH,
    }
}

/// Leave the dispatcher's critical section. A C handler calls this right
/// before `siglongjmp`ing out.
///
/// A handler that returns after calling this is treated as having claimed
/// the signal: no other handler and no fallback runs for that delivery.
///
/// # Safety
///
/// `info` must be the pointer the running handler received.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sigmux_leave_handler(info: *mut sigmux_siginfo) {
    let cinfo = info.cast::<CSignalInfo>();
    if let Some(cinfo) = unsafe { cinfo.as_ref() } {
        if let Some(section) = unsafe { cinfo.section.as_ref() } {
            section.close();
        }
    }
}
