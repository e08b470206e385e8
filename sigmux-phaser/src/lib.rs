//! Phaser: an RCU-style quiescence primitive
//!
//! Any number of threads enter and exit critical sections with
//! [`Phaser::enter`] and [`Phaser::exit`]. Both are wait-free, infallible,
//! fully reentrant and async-signal-safe: they may run inside a signal
//! handler that interrupted another critical section, or that interrupted
//! [`Phaser::drain`] on the same thread.
//!
//! At most one thread at a time calls [`Phaser::drain`], which blocks until
//! every critical section that was active when the drain began has exited.
//! After it returns, anything unpublished before the drain can no longer be
//! referenced from inside a critical section and may be reclaimed.
//!
//! # 实现
//!
//! The phaser keeps [`PHASES`] counters. Each holds a live-entry count in its
//! low 31 bits and a DRAINING flag in bit 31. `enter` increments the first
//! counter whose DRAINING flag is clear and returns its index as the
//! [`Phase`] token; `exit` decrements that same counter and, if the result is
//! exactly `DRAINING | 0`, wakes the drainer. `drain` sets DRAINING on one
//! counter at a time, waits for it to reach `DRAINING | 0`, then clears the
//! flag, so some counter is always open to `enter`.
//!
//! `enter` must test DRAINING *before* incrementing. Incrementing first lets
//! a stream of entrants keep a draining counter above zero forever.
//!
//! # 示例
//! ```
//! use sigmux_phaser::Phaser;
//!
//! let phaser = Phaser::open().unwrap();
//! {
//!     let section = phaser.critical_section();
//!     // ... read shared data published with release stores ...
//!     section.close();
//! }
//! // No critical section that began before this call is still running.
//! phaser.drain();
//! ```

use std::cell::Cell;
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering, fence};

use sigmux_osal::{DefaultWaiter, WaitWake};

/// Number of counters; must be a power of two
pub const PHASES: usize = 2;

const _: () = assert!(PHASES.is_power_of_two() && PHASES >= 2);

const DRAINING: u32 = 1 << 31;
const COUNT_MASK: u32 = !DRAINING;
const COUNT_DRAINED: u32 = DRAINING;

/// Token returned by [`Phaser::enter`]; hand it back unchanged to
/// [`Phaser::exit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Phase(u32);

impl Phase {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub struct Phaser<W: WaitWake = DefaultWaiter> {
    counters: [AtomicU32; PHASES],
    in_drain: AtomicBool,
    waiter: W,
}

impl Phaser<DefaultWaiter> {
    /// A phaser using the build's default backend.
    ///
    /// `const` so it can live in a `static`. Backends that need OS resources
    /// (the pipe backend) must be readied with [`Phaser::prepare`] before the
    /// first drain; until then a drain polls.
    pub const fn new() -> Self {
        Self::with_waiter(DefaultWaiter::new())
    }

    /// Create and prepare a phaser
    pub fn open() -> io::Result<Self> {
        let phaser = Self::new();
        phaser.prepare()?;
        Ok(phaser)
    }
}

impl Default for Phaser<DefaultWaiter> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: WaitWake> Phaser<W> {
    pub const fn with_waiter(waiter: W) -> Self {
        Self {
            counters: [const { AtomicU32::new(0) }; PHASES],
            in_drain: AtomicBool::new(false),
            waiter,
        }
    }

    /// Acquire the backend's OS resources. Idempotent; serialize with
    /// `drain`.
    pub fn prepare(&self) -> io::Result<()> {
        self.waiter.prepare()
    }

    #[inline]
    fn try_increment(counter: &AtomicU32) -> bool {
        if counter.load(Ordering::Relaxed) & DRAINING != 0 {
            return false;
        }

        // A drain may set DRAINING between the check and the add. That is
        // fine: this entry is counted and its exit will decrement the same
        // counter, and the window is small enough to happen only a bounded
        // number of times per drain.
        let prev = counter.fetch_add(1, Ordering::Relaxed);
        if prev & COUNT_MASK == COUNT_MASK {
            // The count just carried into DRAINING. Continuing would corrupt
            // the drain protocol for every thread in the process.
            sigmux_osal::abort_process();
        }
        true
    }

    /// Enter a critical section. Wait-free, reentrant, async-signal-safe and
    /// a full memory barrier.
    #[inline]
    #[must_use = "every enter must be paired with an exit"]
    pub fn enter(&self) -> Phase {
        let mut phase = 0usize;
        while !Self::try_increment(&self.counters[phase]) {
            phase = (phase + 1) & (PHASES - 1);
        }
        fence(Ordering::SeqCst);
        Phase(phase as u32)
    }

    /// Exit the critical section opened by the `enter` that returned
    /// `phase`. Never blocks; async-signal-safe; a full memory barrier.
    #[inline]
    pub fn exit(&self, phase: Phase) {
        fence(Ordering::SeqCst);
        let counter = &self.counters[phase.index()];
        let prev = counter.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev & COUNT_MASK != 0, "phaser exit without matching enter");
        if prev.wrapping_sub(1) == COUNT_DRAINED {
            self.waiter.wake(counter);
        }
    }

    /// Enter a critical section guarded by a [`CriticalSection`]
    #[inline]
    pub fn critical_section(&self) -> CriticalSection<'_, W> {
        CriticalSection {
            phaser: self,
            phase: self.enter(),
            open: Cell::new(true),
        }
    }

    /// Wait for every critical section active at the time of the call to
    /// exit.
    ///
    /// Blocks; not async-signal-safe. Must not be called from inside a
    /// critical section of this phaser, and calls on one phaser must be
    /// serialized by the caller. Full memory barrier.
    pub fn drain(&self) {
        let reentered = self.in_drain.swap(true, Ordering::Acquire);
        debug_assert!(!reentered, "concurrent or reentrant phaser drain");

        for phase in 0..PHASES {
            self.drain_counter(&self.counters[phase]);
            fence(Ordering::SeqCst);
        }

        self.in_drain.store(false, Ordering::Release);
    }

    fn drain_counter(&self, counter: &AtomicU32) {
        let mut value = counter.fetch_or(DRAINING, Ordering::Release) | DRAINING;
        while value != COUNT_DRAINED {
            self.waiter.wait(counter, value);
            value = counter.load(Ordering::Relaxed);
        }
        counter.fetch_and(!DRAINING, Ordering::Relaxed);
    }

    /// Live entries currently counted on `phase`
    pub fn active(&self, phase: usize) -> u32 {
        self.counters[phase].load(Ordering::Relaxed) & COUNT_MASK
    }

    pub fn is_draining(&self, phase: usize) -> bool {
        self.counters[phase].load(Ordering::Relaxed) & DRAINING != 0
    }
}

impl<W: WaitWake + fmt::Debug> fmt::Debug for Phaser<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counters: Vec<u32> = self
            .counters
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        f.debug_struct("Phaser")
            .field("counters", &counters)
            .field("waiter", &self.waiter)
            .finish()
    }
}

// ============================================================================
// 临界区守卫
// ============================================================================

/// An open critical section.
///
/// Closing it is explicit ([`close`](Self::close)) or happens on drop. Code
/// that leaves the section without unwinding (a `siglongjmp` out of a signal
/// handler, a thread exit) must go through [`escape`](Self::escape) so the
/// phase is exited first; otherwise every later drain hangs.
pub struct CriticalSection<'a, W: WaitWake = DefaultWaiter> {
    phaser: &'a Phaser<W>,
    phase: Phase,
    open: Cell<bool>,
}

impl<W: WaitWake> CriticalSection<'_, W> {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.open.get()
    }

    /// Exit the phase. Later calls do nothing.
    #[inline]
    pub fn close(&self) {
        if self.open.replace(false) {
            self.phaser.exit(self.phase);
        }
    }

    /// Exit the phase, then transfer control to `jump`, which never returns
    /// here. `Infallible` stands in for `!` in the bound.
    pub fn escape<F>(&self, jump: F) -> !
    where
        F: FnOnce() -> Infallible,
    {
        self.close();
        match jump() {}
    }
}

impl<W: WaitWake> Drop for CriticalSection<'_, W> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<W: WaitWake> fmt::Debug for CriticalSection<'_, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalSection")
            .field("phase", &self.phase)
            .field("open", &self.open.get())
            .finish()
    }
}

// ============================================================================
// 测试
// ============================================================================
