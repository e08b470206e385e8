//! Handler-facing types
//!
//! What a registered handler receives for each delivery ([`SignalInfo`]),
//! what it answers ([`SigmuxAction`]), and the flags that steer dispatch and
//! registration.

use std::convert::Infallible;
use std::ffi::c_void;
use std::fmt;

use bitflags::bitflags;
use sigmux_common::DispatchConfig;
use sigmux_phaser::CriticalSection;

/// A handler's verdict on one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigmuxAction {
    /// Not mine; offer the signal to the next handler
    ContinueSearch,
    /// Handled; stop dispatching and resume the interrupted code
    ContinueExecution,
}

bitflags! {
    /// Passes run by [`Sigmux::handle_signal`](crate::Sigmux::handle_signal)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DispatchFlags: u32 {
        /// Try handlers registered without [`RegisterFlags::LOW_PRIORITY`]
        const NORMAL_PRIORITY = 1 << 0;
        /// Try handlers registered with [`RegisterFlags::LOW_PRIORITY`]
        const LOW_PRIORITY = 1 << 1;
        /// Run the pre-seizure disposition if no handler claims the signal
        const INVOKE_DEFAULT = 1 << 2;
    }
}

impl DispatchFlags {
    /// Flags the OS trampoline uses under `config`
    pub fn from_config(config: &DispatchConfig) -> Self {
        let mut flags = DispatchFlags::empty();
        flags.set(DispatchFlags::NORMAL_PRIORITY, config.normal_priority);
        flags.set(DispatchFlags::LOW_PRIORITY, config.low_priority);
        flags.set(DispatchFlags::INVOKE_DEFAULT, config.invoke_default);
        flags
    }
}

impl Default for DispatchFlags {
    fn default() -> Self {
        DispatchFlags::all()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RegisterFlags: u32 {
        /// Only try this handler after every normal-priority handler passed
        const LOW_PRIORITY = 1 << 0;
    }
}

/// One signal delivery as seen by a handler.
///
/// Valid only for the duration of the handler call. The dispatcher holds a
/// phaser critical section for that whole time; see [`escape`](Self::escape)
/// for leaving it without returning.
pub struct SignalInfo<'a> {
    signum: i32,
    info: *mut libc::siginfo_t,
    context: *mut c_void,
    section: &'a CriticalSection<'a>,
}

impl<'a> SignalInfo<'a> {
    pub(crate) fn new(
        signum: i32,
        info: *mut libc::siginfo_t,
        context: *mut c_void,
        section: &'a CriticalSection<'a>,
    ) -> Self {
        Self {
            signum,
            info,
            context,
            section,
        }
    }

    pub fn signum(&self) -> i32 {
        self.signum
    }

    /// The kernel's `siginfo_t`; null when the caller of `handle_signal`
    /// supplied none
    pub fn info(&self) -> *mut libc::siginfo_t {
        self.info
    }

    /// The interrupted `ucontext_t`, as an opaque pointer
    pub fn context(&self) -> *mut c_void {
        self.context
    }

    /// Leave the dispatcher without returning.
    ///
    /// Exits the critical section held for this delivery, then runs `jump`,
    /// which must not return (typically a `siglongjmp` or a thread exit).
    /// Skipping this when jumping out of a handler leaves the section open
    /// and every later unregister or `sigaction` hangs.
    pub fn escape<F>(&self, jump: F) -> !
    where
        F: FnOnce() -> Infallible,
    {
        self.section.escape(jump)
    }

    pub(crate) fn section(&self) -> &'a CriticalSection<'a> {
        self.section
    }
}

impl fmt::Debug for SignalInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalInfo")
            .field("signum", &self.signum)
            .field("info", &self.info)
            .field("context", &self.context)
            .finish()
    }
}

/// A callback registered with the multiplexer.
///
/// Runs in signal context. Implementations must be async-signal-safe: no
/// allocation, no locks, no logging. Returning
/// [`SigmuxAction::ContinueExecution`] claims the signal.
pub trait SignalHandler: Send + Sync {
    fn handle(&self, info: &SignalInfo<'_>) -> SigmuxAction;
}

impl<F> SignalHandler for F
where
    F: Fn(&SignalInfo<'_>) -> SigmuxAction + Send + Sync,
{
    fn handle(&self, info: &SignalInfo<'_>) -> SigmuxAction {
        self(info)
    }
}
