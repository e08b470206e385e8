//! The multiplexer and its control plane
//!
//! Every control operation serializes on one lock. Operations that make
//! something unreachable by the dispatcher (unregister, replacing a saved
//! disposition, replacing the real `sigaction`) publish the change and then
//! drain the phaser before reusing or freeing the old value.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use parking_lot::Mutex;
use sigmux_common::logging::signal_name;
use sigmux_common::{Result, SigmuxConfig, SigmuxError};
use sigmux_osal::sigaction::zeroed_sigaction;
use sigmux_osal::{OsSigaction, RealSigaction, SignalSet, empty_sigset};
use sigmux_phaser::Phaser;

use crate::disposition;
use crate::dispatch::trampoline;
use crate::handler::{DispatchFlags, RegisterFlags, SignalHandler};
use crate::hooks;
use crate::registry::{Node, Registration, Registry};
use crate::slots::SignalSlots;

/// The `sigaction` implementation sigmux uses to reach the kernel
#[derive(Clone, Copy)]
pub enum SigactionImpl {
    /// A C `sigaction`-shaped function, libc's by default
    Os(OsSigaction),
    /// Any other implementation; must be async-signal-safe
    Custom(&'static dyn RealSigaction),
}

impl SigactionImpl {
    pub const fn libc() -> Self {
        SigactionImpl::Os(OsSigaction::libc())
    }

    pub fn get(&self) -> &dyn RealSigaction {
        match self {
            SigactionImpl::Os(os) => os,
            SigactionImpl::Custom(custom) => *custom,
        }
    }
}

impl Default for SigactionImpl {
    fn default() -> Self {
        Self::libc()
    }
}

impl fmt::Debug for SigactionImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SigactionImpl::Os(os) => f.debug_tuple("Os").field(os).finish(),
            SigactionImpl::Custom(custom) => f
                .debug_tuple("Custom")
                .field(&(*custom as *const dyn RealSigaction as *const ()))
                .finish(),
        }
    }
}

/// Lock-protected bookkeeping
struct ControlState {
    seized: SignalSet,
    phaser_ready: bool,
    /// `None` until the first `configure`
    config: Option<SigmuxConfig>,
}

impl ControlState {
    fn config(&self) -> SigmuxConfig {
        self.config.clone().unwrap_or_default()
    }
}

/// A signal multiplexer.
///
/// The process-wide instance, [`Sigmux::global`], is the one the OS-level
/// trampoline dispatches to. Other instances never receive kernel deliveries
/// on their own; they serve hosts that intercept delivery themselves and
/// call [`handle_signal`](Self::handle_signal), and tests that plug in a
/// fake `sigaction`.
pub struct Sigmux {
    state: Mutex<ControlState>,
    pub(crate) phaser: Phaser,
    pub(crate) registry: Registry,
    pub(crate) slots: SignalSlots,
    /// Null means [`SigactionImpl::libc`]
    real: AtomicPtr<SigactionImpl>,
    /// Trampoline settings, read from signal context
    pub(crate) dispatch_flags: AtomicU32,
    pub(crate) reset_mask_on_entry: AtomicBool,
}

static GLOBAL: Sigmux = Sigmux::new();

impl Sigmux {
    pub const fn new() -> Self {
        Self {
            state: parking_lot::const_mutex(ControlState {
                seized: SignalSet::empty(),
                phaser_ready: false,
                config: None,
            }),
            phaser: Phaser::new(),
            registry: Registry::new(),
            slots: SignalSlots::new(),
            real: AtomicPtr::new(ptr::null_mut()),
            dispatch_flags: AtomicU32::new(DispatchFlags::all().bits()),
            reset_mask_on_entry: AtomicBool::new(cfg!(target_os = "android")),
        }
    }

    /// The process-wide multiplexer
    pub fn global() -> &'static Sigmux {
        &GLOBAL
    }

    fn is_global(&self) -> bool {
        ptr::eq(self, &GLOBAL)
    }

    fn ensure_phaser(&self, state: &mut ControlState) -> Result<()> {
        if !state.phaser_ready {
            self.phaser
                .prepare()
                .map_err(|e| SigmuxError::os("phaser backend setup", e))?;
            state.phaser_ready = true;
        }
        Ok(())
    }

    /// The current real `sigaction`. Stays valid under the control lock, or
    /// inside a critical section for the value copied out.
    pub(crate) fn real(&self) -> SigactionImpl {
        match unsafe { self.real.load(Ordering::Acquire).as_ref() } {
            Some(imp) => *imp,
            None => SigactionImpl::libc(),
        }
    }

    // ========================================================================
    // 配置
    // ========================================================================

    /// Apply `config`. Trampoline settings take effect for the next delivery;
    /// `on_alt_stack` and `restart_syscalls` apply to signals seized later.
    pub fn configure(&self, config: SigmuxConfig) {
        let mut state = self.state.lock();
        self.dispatch_flags.store(
            DispatchFlags::from_config(&config.dispatch).bits(),
            Ordering::Relaxed,
        );
        self.reset_mask_on_entry
            .store(config.reset_mask_on_entry, Ordering::Relaxed);
        log::debug!("sigmux configured: {:?}", config);
        state.config = Some(config);
    }

    pub fn config(&self) -> SigmuxConfig {
        self.state.lock().config()
    }

    // ========================================================================
    // 接管信号
    // ========================================================================

    /// Take over `signum`: route its deliveries through the multiplexer.
    ///
    /// The disposition in force before seizure becomes the default
    /// fallback. Idempotent.
    pub fn init(&self, signum: i32) -> Result<()> {
        SignalSet::check(signum)?;
        let mut state = self.state.lock();
        self.ensure_phaser(&mut state)?;
        if state.seized.contains(signum) {
            return Ok(());
        }
        // The trampoline only reaches the global instance; a kernel-level
        // install from any other one would strand the signal's fallback.
        if !self.is_global() && matches!(self.real(), SigactionImpl::Os(_)) {
            log::warn!(
                "refusing to seize {} for a non-global multiplexer",
                signal_name(signum)
            );
            return Err(SigmuxError::NotGlobal(signum));
        }
        let slot = self
            .slots
            .get(signum)
            .ok_or(SigmuxError::InvalidSignal(signum))?;
        let real = self.real();
        let real = real.get();

        // Publish the current disposition first, so a signal arriving the
        // instant the trampoline goes in finds a filled slot.
        let mut current = zeroed_sigaction();
        real.sigaction(signum, None, Some(&mut current))
            .map_err(|e| SigmuxError::os("sigaction", e))?;
        slot.publish(&current, &self.phaser);
        slot.reserve();

        let config = state.config();
        let mut act = zeroed_sigaction();
        act.sa_sigaction = trampoline as usize;
        act.sa_mask = empty_sigset();
        act.sa_flags = libc::SA_NODEFER | libc::SA_SIGINFO;
        if config.on_alt_stack {
            act.sa_flags |= libc::SA_ONSTACK;
        }
        if config.restart_syscalls {
            act.sa_flags |= libc::SA_RESTART;
        }

        let mut previous = zeroed_sigaction();
        real.sigaction(signum, Some(&act), Some(&mut previous))
            .map_err(|e| SigmuxError::os("sigaction", e))?;
        if previous.sa_sigaction != current.sa_sigaction || previous.sa_flags != current.sa_flags
        {
            // Someone changed it between our query and our install.
            slot.publish(&previous, &self.phaser);
        }

        state.seized.add(signum)?;
        hooks::sigmux_gdbhook_on_signal_seized();
        log::info!("seized {}", signal_name(signum));
        Ok(())
    }

    pub fn is_seized(&self, signum: i32) -> bool {
        self.state.lock().seized.contains(signum)
    }

    // ========================================================================
    // 注册
    // ========================================================================

    /// Add `handler` for `signals`. It is tried before every handler
    /// registered earlier with the same priority.
    ///
    /// Registering does not seize anything; call [`init`](Self::init) for
    /// each signal the handler should actually see.
    pub fn register<H>(
        &self,
        signals: SignalSet,
        handler: H,
        flags: RegisterFlags,
    ) -> Result<Registration>
    where
        H: SignalHandler + 'static,
    {
        let node = Node::new(signals, flags, Box::new(handler));
        let mut state = self.state.lock();
        self.ensure_phaser(&mut state)?;
        let reg = self.registry.publish(node);
        log::debug!(
            "registered handler {} for {:?} ({:?})",
            reg.id(),
            signals,
            flags
        );
        Ok(reg)
    }

    /// Remove a handler. When this returns, the handler is not running on
    /// any thread and never will again, and it has been dropped.
    ///
    /// Blocks until in-flight dispatches finish; must not be called from a
    /// signal handler.
    pub fn unregister(&self, reg: Registration) -> Result<()> {
        let node = {
            let _state = self.state.lock();
            if !self.registry.contains(&reg) {
                log::warn!("unregister of unknown registration {}", reg.id());
                return Err(SigmuxError::UnknownRegistration(reg.id()));
            }
            let node = self.registry.unlink(&reg);
            self.phaser.drain();
            node
        };
        // SAFETY: unlinked and drained.
        unsafe { Registry::free(node) };
        log::debug!("unregistered handler {}", reg.id());
        Ok(())
    }

    /// Number of live registrations
    pub fn registrations(&self) -> usize {
        let _state = self.state.lock();
        self.registry.len()
    }

    // ========================================================================
    // sigaction
    // ========================================================================

    /// `sigaction(2)` as the application should see it.
    ///
    /// For a seized signal this reads and writes the saved disposition the
    /// multiplexer falls back to; the kernel keeps pointing at the
    /// trampoline. Anything else goes straight to the real `sigaction`.
    pub fn sigaction(
        &self,
        signum: i32,
        act: Option<&libc::sigaction>,
        oldact: Option<&mut libc::sigaction>,
    ) -> Result<()> {
        let state = self.state.lock();
        let slot = self.slots.get(signum);
        let (Some(slot), true) = (slot, state.seized.contains(signum)) else {
            let real = self.real();
            drop(state);
            return real
                .get()
                .sigaction(signum, act, oldact)
                .map_err(|e| SigmuxError::os("sigaction", e));
        };
        let current = slot
            .current()
            .ok_or(SigmuxError::InvalidSignal(signum))?;

        if let Some(oldact) = oldact {
            *oldact = current.snapshot();
            if disposition::reads_as_default(oldact) {
                oldact.sa_sigaction = libc::SIG_DFL;
                oldact.sa_flags &= !(libc::SA_RESETHAND | libc::SA_SIGINFO);
            }
        }
        if let Some(act) = act {
            slot.publish(act, &self.phaser);
            log::debug!(
                "{} disposition now {:#x} (flags {:#x})",
                signal_name(signum),
                act.sa_sigaction,
                act.sa_flags
            );
        }
        Ok(())
    }

    /// Replace the `sigaction` sigmux itself uses; returns the previous one.
    ///
    /// Used by layers that interpose `sigaction` and route application calls
    /// into [`Sigmux::sigaction`].
    pub fn set_real_sigaction(&self, imp: SigactionImpl) -> SigactionImpl {
        let _state = self.state.lock();
        let fresh = Box::into_raw(Box::new(imp));
        let old = self.real.swap(fresh, Ordering::AcqRel);
        self.phaser.drain();
        if old.is_null() {
            SigactionImpl::libc()
        } else {
            // SAFETY: unpublished and drained.
            *unsafe { Box::from_raw(old) }
        }
    }
}

impl Default for Sigmux {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Sigmux {
    fn drop(&mut self) {
        let real = std::mem::replace(self.real.get_mut(), ptr::null_mut());
        if !real.is_null() {
            drop(unsafe { Box::from_raw(real) });
        }
    }
}

impl fmt::Debug for Sigmux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Sigmux")
            .field("seized", &state.seized)
            .field("registrations", &self.registry.len())
            .field("real", &self.real())
            .field("phaser", &self.phaser)
            .finish()
    }
}
