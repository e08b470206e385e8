//! Signal-path dispatch
//!
//! [`Sigmux::handle_signal`] and the `extern "C"` trampoline the kernel
//! calls. Nothing here allocates, locks or logs.

use std::ffi::c_void;
use std::sync::atomic::Ordering;

use sigmux_osal::{ErrnoGuard, empty_sigset, set_thread_mask};

use crate::control::Sigmux;
use crate::disposition;
use crate::handler::{DispatchFlags, SigmuxAction, SignalInfo};

impl Sigmux {
    /// Dispatch one delivery of `signum`.
    ///
    /// Runs the normal-priority pass, then the low-priority pass, as selected
    /// by `flags`, newest registration first in each. If nobody claims the
    /// signal and `flags` has [`DispatchFlags::INVOKE_DEFAULT`], runs the
    /// disposition the application installed (or had before seizure), after
    /// leaving the critical section. A signal this multiplexer never seized
    /// has no such disposition and gets no fallback.
    ///
    /// Returns [`SigmuxAction::ContinueExecution`] if a handler claimed the
    /// signal or the fallback ran. A fatal fallback does not return. A
    /// handler that closes the critical section counts as a claim.
    ///
    /// # Safety
    ///
    /// `info` and `context` are handed to handlers and to a saved
    /// `sigaction` handler. They must be null or what the kernel passed for
    /// this delivery.
    pub unsafe fn handle_signal(
        &self,
        signum: i32,
        info: *mut libc::siginfo_t,
        context: *mut c_void,
        flags: DispatchFlags,
    ) -> SigmuxAction {
        let section = self.phaser.critical_section();
        let siginfo = SignalInfo::new(signum, info, context, &section);

        let mut action = SigmuxAction::ContinueSearch;
        if flags.contains(DispatchFlags::NORMAL_PRIORITY) {
            action = self.registry.dispatch(&siginfo, false);
        }
        if action == SigmuxAction::ContinueSearch && flags.contains(DispatchFlags::LOW_PRIORITY) {
            action = self.registry.dispatch(&siginfo, true);
        }

        // Copy out everything the fallback needs while still inside the
        // section; the buffers may be recycled once it closes.
        let fallback = if action == SigmuxAction::ContinueSearch
            && flags.contains(DispatchFlags::INVOKE_DEFAULT)
        {
            self.slots
                .get(signum)
                .and_then(|slot| slot.current())
                .map(|saved| (saved.claim(), self.real()))
        } else {
            None
        };

        section.close();

        match fallback {
            Some((act, real)) => {
                unsafe { disposition::invoke(signum, &act, info, context, real.get()) };
                SigmuxAction::ContinueExecution
            }
            None => action,
        }
    }
}

/// Installed as the `SA_SIGINFO` handler of every seized signal.
pub(crate) extern "C" fn trampoline(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    let _errno = ErrnoGuard::new();
    let mux = Sigmux::global();
    if mux.reset_mask_on_entry.load(Ordering::Relaxed) {
        set_thread_mask(&empty_sigset());
    }
    let flags = DispatchFlags::from_bits_truncate(mux.dispatch_flags.load(Ordering::Relaxed));
    let _ = unsafe { mux.handle_signal(signum, info, context, flags) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::SigactionImpl;
    use crate::handler::RegisterFlags;
    use sigmux_osal::sigaction::zeroed_sigaction;
    use sigmux_osal::{FakeSigaction, SignalSet};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn dispatch(mux: &Sigmux, signum: i32, flags: DispatchFlags) -> SigmuxAction {
        unsafe { mux.handle_signal(signum, std::ptr::null_mut(), std::ptr::null_mut(), flags) }
    }

    #[test]
    fn test_unseized_signal_has_no_fallback() {
        let mux = Sigmux::new();
        assert_eq!(
            dispatch(&mux, libc::SIGUSR1, DispatchFlags::all()),
            SigmuxAction::ContinueSearch
        );
    }

    #[test]
    fn test_low_priority_runs_after_normal() {
        let mux = Sigmux::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let signals = SignalSet::from_signals([libc::SIGUSR2]).unwrap();

        let seen = Arc::clone(&order);
        let low = mux
            .register(
                signals,
                move |_: &SignalInfo<'_>| {
                    seen.lock().push("low");
                    SigmuxAction::ContinueSearch
                },
                RegisterFlags::LOW_PRIORITY,
            )
            .unwrap();
        let seen = Arc::clone(&order);
        let normal = mux
            .register(
                signals,
                move |_: &SignalInfo<'_>| {
                    seen.lock().push("normal");
                    SigmuxAction::ContinueSearch
                },
                RegisterFlags::empty(),
            )
            .unwrap();

        dispatch(&mux, libc::SIGUSR2, DispatchFlags::all());
        assert_eq!(*order.lock(), vec!["normal", "low"]);

        order.lock().clear();
        dispatch(&mux, libc::SIGUSR2, DispatchFlags::LOW_PRIORITY);
        assert_eq!(*order.lock(), vec!["low"]);

        mux.unregister(low).unwrap();
        mux.unregister(normal).unwrap();
    }

    #[test]
    fn test_claimed_signal_skips_fallback() {
        let fake: &'static FakeSigaction = Box::leak(Box::new(FakeSigaction::new()));
        let mux = Sigmux::new();
        mux.set_real_sigaction(SigactionImpl::Custom(fake));
        mux.init(libc::SIGCHLD).unwrap();

        static FALLBACK_RUNS: AtomicUsize = AtomicUsize::new(0);
        extern "C" fn counting(_: libc::c_int) {
            FALLBACK_RUNS.fetch_add(1, Ordering::SeqCst);
        }
        let mut act = zeroed_sigaction();
        act.sa_sigaction = counting as usize;
        mux.sigaction(libc::SIGCHLD, Some(&act), None).unwrap();

        let reg = mux
            .register(
                SignalSet::from_signals([libc::SIGCHLD]).unwrap(),
                |_: &SignalInfo<'_>| SigmuxAction::ContinueExecution,
                RegisterFlags::empty(),
            )
            .unwrap();
        assert_eq!(
            dispatch(&mux, libc::SIGCHLD, DispatchFlags::all()),
            SigmuxAction::ContinueExecution
        );
        assert_eq!(FALLBACK_RUNS.load(Ordering::SeqCst), 0);

        mux.unregister(reg).unwrap();
        assert_eq!(
            dispatch(&mux, libc::SIGCHLD, DispatchFlags::all()),
            SigmuxAction::ContinueExecution
        );
        assert_eq!(FALLBACK_RUNS.load(Ordering::SeqCst), 1);

        // Without INVOKE_DEFAULT nothing claims it.
        assert_eq!(
            dispatch(&mux, libc::SIGCHLD, DispatchFlags::NORMAL_PRIORITY),
            SigmuxAction::ContinueSearch
        );
        assert_eq!(FALLBACK_RUNS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_section_stops_dispatch() {
        let fake: &'static FakeSigaction = Box::leak(Box::new(FakeSigaction::new()));
        let mux = Sigmux::new();
        mux.set_real_sigaction(SigactionImpl::Custom(fake));
        mux.init(libc::SIGWINCH).unwrap();

        static FALLBACK_RUNS: AtomicUsize = AtomicUsize::new(0);
        extern "C" fn counting(_: libc::c_int) {
            FALLBACK_RUNS.fetch_add(1, Ordering::SeqCst);
        }
        let mut act = zeroed_sigaction();
        act.sa_sigaction = counting as usize;
        mux.sigaction(libc::SIGWINCH, Some(&act), None).unwrap();

        let older_runs = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&older_runs);
        let older = mux
            .register(
                SignalSet::from_signals([libc::SIGWINCH]).unwrap(),
                move |_: &SignalInfo<'_>| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    SigmuxAction::ContinueSearch
                },
                RegisterFlags::LOW_PRIORITY,
            )
            .unwrap();
        let leaving = mux
            .register(
                SignalSet::from_signals([libc::SIGWINCH]).unwrap(),
                |info: &SignalInfo<'_>| {
                    info.section().close();
                    SigmuxAction::ContinueSearch
                },
                RegisterFlags::empty(),
            )
            .unwrap();

        assert_eq!(
            dispatch(&mux, libc::SIGWINCH, DispatchFlags::all()),
            SigmuxAction::ContinueExecution
        );
        assert_eq!(older_runs.load(Ordering::SeqCst), 0);
        assert_eq!(FALLBACK_RUNS.load(Ordering::SeqCst), 0);
        for phase in 0..sigmux_phaser::PHASES {
            assert_eq!(mux.phaser.active(phase), 0);
        }

        mux.unregister(leaving).unwrap();
        dispatch(&mux, libc::SIGWINCH, DispatchFlags::all());
        assert_eq!(older_runs.load(Ordering::SeqCst), 1);
        assert_eq!(FALLBACK_RUNS.load(Ordering::SeqCst), 1);
        mux.unregister(older).unwrap();
    }

    #[test]
    fn test_section_closed_after_dispatch() {
        let mux = Sigmux::new();
        dispatch(&mux, libc::SIGUSR1, DispatchFlags::all());
        for phase in 0..sigmux_phaser::PHASES {
            assert_eq!(mux.phaser.active(phase), 0);
        }
    }
}
