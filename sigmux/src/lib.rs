//! sigmux: a cooperative POSIX signal multiplexer
//!
//! POSIX allows one handler per signal per process. sigmux takes over
//! ("seizes") a signal by installing a single trampoline for it, then lets any
//! number of components register handlers for it. Each delivery is offered to
//! the registered handlers, newest first, until one claims it; if none does,
//! the disposition the application would otherwise have had runs instead.
//!
//! Handlers can be removed at any time. [`unregister`] returns only once the
//! handler is no longer running anywhere, using a [`Phaser`] drain rather than
//! locks on the signal path, so dispatch stays async-signal-safe.
//!
//! Applications keep using `sigaction` semantics through [`sigaction`]: for a
//! seized signal it reads and writes the fallback disposition instead of the
//! kernel's.
//!
//! # 示例
//! ```no_run
//! use sigmux::{RegisterFlags, SigmuxAction, SignalInfo, SignalSet};
//!
//! sigmux::init(libc::SIGUSR1).unwrap();
//! let reg = sigmux::register(
//!     SignalSet::from_signals([libc::SIGUSR1]).unwrap(),
//!     |_: &SignalInfo<'_>| SigmuxAction::ContinueExecution,
//!     RegisterFlags::empty(),
//! )
//! .unwrap();
//! unsafe { libc::raise(libc::SIGUSR1) };
//! sigmux::unregister(reg).unwrap();
//! ```
//!
//! [`Phaser`]: sigmux_phaser::Phaser

use std::ffi::c_void;

mod control;
mod disposition;
mod dispatch;
pub mod ffi;
mod handler;
pub mod hooks;
mod registry;
mod slots;

pub use control::{SigactionImpl, Sigmux};
pub use handler::{DispatchFlags, RegisterFlags, SigmuxAction, SignalHandler, SignalInfo};
pub use registry::Registration;

pub use sigmux_common::{DispatchConfig, Result, SigmuxConfig, SigmuxError};
pub use sigmux_osal::{FakeSigaction, NSIG, OsSigaction, RealSigaction, SignalSet};

/// Seize `signum` on the global multiplexer. See [`Sigmux::init`].
pub fn init(signum: i32) -> Result<()> {
    Sigmux::global().init(signum)
}

/// See [`Sigmux::register`].
pub fn register<H>(signals: SignalSet, handler: H, flags: RegisterFlags) -> Result<Registration>
where
    H: SignalHandler + 'static,
{
    Sigmux::global().register(signals, handler, flags)
}

/// See [`Sigmux::unregister`].
pub fn unregister(reg: Registration) -> Result<()> {
    Sigmux::global().unregister(reg)
}

/// See [`Sigmux::sigaction`].
pub fn sigaction(
    signum: i32,
    act: Option<&libc::sigaction>,
    oldact: Option<&mut libc::sigaction>,
) -> Result<()> {
    Sigmux::global().sigaction(signum, act, oldact)
}

/// See [`Sigmux::set_real_sigaction`].
pub fn set_real_sigaction(imp: SigactionImpl) -> SigactionImpl {
    Sigmux::global().set_real_sigaction(imp)
}

/// See [`Sigmux::handle_signal`].
///
/// # Safety
///
/// As for [`Sigmux::handle_signal`].
pub unsafe fn handle_signal(
    signum: i32,
    info: *mut libc::siginfo_t,
    context: *mut c_void,
    flags: DispatchFlags,
) -> SigmuxAction {
    unsafe { Sigmux::global().handle_signal(signum, info, context, flags) }
}

/// See [`Sigmux::configure`].
pub fn configure(config: SigmuxConfig) {
    Sigmux::global().configure(config)
}
