//! Per-signal saved dispositions
//!
//! Each seized signal keeps two action buffers: `orig`, the disposition the
//! application believes is installed (read by the dispatcher's default
//! fallback), and `alt`, a spare the control plane writes before swapping the
//! two. Buffers are allocated once, on first seizure, and live as long as the
//! multiplexer.
//!
//! The handler word and the flags word of a buffer are atomics so that
//! concurrent deliveries of a one-shot (`SA_RESETHAND`) handler can agree on
//! which one gets to run it. The rest of the `sigaction` is plain memory,
//! written only while no reader can observe the buffer.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};

use sigmux_osal::NSIG;
use sigmux_osal::sigaction::zeroed_sigaction;
use sigmux_phaser::Phaser;

pub(crate) struct SavedAction {
    handler: AtomicUsize,
    flags: AtomicI32,
    raw: UnsafeCell<libc::sigaction>,
}

// SAFETY: `raw` is written only while the buffer is unpublished or drained,
// so shared readers never race a write.
unsafe impl Sync for SavedAction {}
unsafe impl Send for SavedAction {}

impl SavedAction {
    fn new() -> Self {
        Self {
            handler: AtomicUsize::new(libc::SIG_DFL),
            flags: AtomicI32::new(0),
            raw: UnsafeCell::new(zeroed_sigaction()),
        }
    }

    /// # Safety
    ///
    /// No reader may be looking at this buffer.
    unsafe fn store(&self, act: &libc::sigaction) {
        unsafe { *self.raw.get() = *act };
        self.handler.store(act.sa_sigaction, Ordering::Relaxed);
        self.flags.store(act.sa_flags as i32, Ordering::Relaxed);
    }

    /// Copy the whole action out. Signal-safe.
    pub(crate) fn snapshot(&self) -> libc::sigaction {
        let mut act = unsafe { ptr::read(self.raw.get()) };
        // Flags first: a cleared SA_RESETHAND guarantees the handler word
        // already reads SIG_DFL.
        act.sa_flags = self.flags.load(Ordering::Acquire) as _;
        act.sa_sigaction = self.handler.load(Ordering::Relaxed);
        act
    }

    /// Take a snapshot for invocation, consuming a one-shot handler.
    ///
    /// If the action is `SA_RESETHAND`, exactly one caller (across all
    /// threads) gets the handler; every other caller, and every later
    /// snapshot, sees `SIG_DFL`. Signal-safe.
    pub(crate) fn claim(&self) -> libc::sigaction {
        let mut act = self.snapshot();
        if act.sa_flags & libc::SA_RESETHAND == 0 {
            return act;
        }
        if let Err(current) = self.handler.compare_exchange(
            act.sa_sigaction,
            libc::SIG_DFL,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            act.sa_sigaction = current;
        }
        self.flags
            .fetch_and(!(libc::SA_RESETHAND as i32), Ordering::Release);
        act
    }
}

#[derive(Default)]
pub(crate) struct SignalSlot {
    orig: AtomicPtr<SavedAction>,
    alt: AtomicPtr<SavedAction>,
}

impl SignalSlot {
    /// The published disposition, if this signal was ever seized. Inside a
    /// critical section the reference stays valid until the section closes.
    pub(crate) fn current(&self) -> Option<&SavedAction> {
        unsafe { self.orig.load(Ordering::Acquire).as_ref() }
    }

    /// Make sure a spare buffer exists so a later [`publish`](Self::publish)
    /// never allocates. Caller holds the control lock.
    pub(crate) fn reserve(&self) {
        if self.alt.load(Ordering::Relaxed).is_null() {
            let spare = Box::into_raw(Box::new(SavedAction::new()));
            self.alt.store(spare, Ordering::Relaxed);
        }
    }

    /// Replace the published disposition with `act`.
    ///
    /// Writes the spare, swaps it in, then drains so no dispatcher still
    /// reads the old buffer before it becomes the new spare. Caller holds
    /// the control lock.
    pub(crate) fn publish(&self, act: &libc::sigaction, phaser: &Phaser) {
        self.reserve();
        let spare = self.alt.load(Ordering::Relaxed);
        // SAFETY: the spare is never reachable by readers.
        unsafe { (*spare).store(act) };
        let old = self.orig.swap(spare, Ordering::AcqRel);
        phaser.drain();
        self.alt.store(old, Ordering::Relaxed);
    }
}

impl Drop for SignalSlot {
    fn drop(&mut self) {
        for buf in [self.orig.get_mut(), self.alt.get_mut()] {
            let p = std::mem::replace(buf, ptr::null_mut());
            if !p.is_null() {
                drop(unsafe { Box::from_raw(p) });
            }
        }
    }
}

pub(crate) struct SignalSlots {
    slots: [SignalSlot; NSIG as usize],
}

impl SignalSlots {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const {
                SignalSlot {
                    orig: AtomicPtr::new(ptr::null_mut()),
                    alt: AtomicPtr::new(ptr::null_mut()),
                }
            }; NSIG as usize],
        }
    }

    /// Slot for `signum`; `None` outside `1..NSIG`
    #[inline]
    pub(crate) fn get(&self, signum: i32) -> Option<&SignalSlot> {
        if signum <= 0 {
            return None;
        }
        self.slots.get(signum as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn one_shot(_: libc::c_int) {}

    fn resethand(handler: usize) -> libc::sigaction {
        let mut act = zeroed_sigaction();
        act.sa_sigaction = handler;
        act.sa_flags = libc::SA_RESETHAND;
        act
    }

    #[test]
    fn test_unseized_slot_is_empty() {
        let slots = SignalSlots::new();
        assert!(slots.get(libc::SIGUSR1).unwrap().current().is_none());
        assert!(slots.get(0).is_none());
        assert!(slots.get(NSIG).is_none());
    }

    #[test]
    fn test_publish_swaps_buffers() {
        let phaser = Phaser::open().unwrap();
        let slots = SignalSlots::new();
        let slot = slots.get(libc::SIGUSR1).unwrap();

        let mut act = zeroed_sigaction();
        act.sa_sigaction = libc::SIG_IGN;
        slot.publish(&act, &phaser);
        let first = slot.current().unwrap() as *const SavedAction;
        assert_eq!(slot.current().unwrap().snapshot().sa_sigaction, libc::SIG_IGN);

        act.sa_sigaction = libc::SIG_DFL;
        slot.publish(&act, &phaser);
        assert_ne!(slot.current().unwrap() as *const SavedAction, first);
        assert_eq!(slot.current().unwrap().snapshot().sa_sigaction, libc::SIG_DFL);
    }

    #[test]
    fn test_claim_one_shot_once() {
        let phaser = Phaser::open().unwrap();
        let slot = SignalSlot::default();
        slot.publish(&resethand(one_shot as usize), &phaser);
        let saved = slot.current().unwrap();

        let first = saved.claim();
        assert_eq!(first.sa_sigaction, one_shot as usize);

        let second = saved.claim();
        assert_eq!(second.sa_sigaction, libc::SIG_DFL);
        assert_eq!(saved.snapshot().sa_flags & libc::SA_RESETHAND, 0);
    }

    #[test]
    fn test_claim_one_shot_concurrently() {
        let phaser = Phaser::open().unwrap();
        let slot = SignalSlot::default();
        slot.publish(&resethand(one_shot as usize), &phaser);
        let saved = slot.current().unwrap();

        let winners = std::thread::scope(|s| {
            let claims: Vec<_> = (0..8).map(|_| s.spawn(|| saved.claim())).collect();
            claims
                .into_iter()
                .map(|h| h.join().unwrap().sa_sigaction)
                .filter(|&handler| handler == one_shot as usize)
                .count()
        });
        assert_eq!(winners, 1);
    }
}
