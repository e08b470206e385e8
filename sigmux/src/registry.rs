//! Handler registry
//!
//! A doubly-linked list of registrations, newest first. Writers (register and
//! unregister) hold the control lock; readers (the dispatcher) walk it from
//! signal context inside a phaser critical section without any lock.
//!
//! A node is published by a single release store to the list head. It is
//! unpublished by splicing it out with release stores to its neighbours'
//! links, and is freed only after a phaser drain, so a reader that already
//! reached it finishes its walk through valid memory. The unlinked node's own
//! `next` is left intact for exactly that reader.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use sigmux_osal::SignalSet;

use crate::handler::{RegisterFlags, SigmuxAction, SignalHandler, SignalInfo};

/// Registration ids are unique across every multiplexer in the process, so a
/// stale handle never matches a node recycled at the same address.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Node {
    next: AtomicPtr<Node>,
    /// Touched only under the control lock
    prev: AtomicPtr<Node>,
    id: u64,
    signals: SignalSet,
    flags: RegisterFlags,
    handler: Box<dyn SignalHandler>,
}

impl Node {
    pub(crate) fn new(
        signals: SignalSet,
        flags: RegisterFlags,
        handler: Box<dyn SignalHandler>,
    ) -> Box<Self> {
        Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            prev: AtomicPtr::new(ptr::null_mut()),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            signals,
            flags,
            handler,
        })
    }

    #[inline]
    fn wants(&self, signum: i32, low_priority: bool) -> bool {
        self.flags.contains(RegisterFlags::LOW_PRIORITY) == low_priority
            && self.signals.contains(signum)
    }
}

/// Handle to a live registration.
///
/// Consumed by [`Sigmux::unregister`](crate::Sigmux::unregister). Dropping it
/// leaves the handler installed for the life of the multiplexer.
#[must_use = "dropping a Registration leaves its handler installed"]
pub struct Registration {
    node: NonNull<Node>,
    id: u64,
}

// SAFETY: the pointer is only dereferenced by the multiplexer that owns the
// node, after confirming under its control lock that the node is still
// linked.
unsafe impl Send for Registration {}
unsafe impl Sync for Registration {}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish()
    }
}

pub(crate) struct Registry {
    head: AtomicPtr<Node>,
}

impl Registry {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Link `node` at the head. Caller holds the control lock.
    pub(crate) fn publish(&self, node: Box<Node>) -> Registration {
        let id = node.id;
        let old_head = self.head.load(Ordering::Relaxed);
        node.next.store(old_head, Ordering::Relaxed);
        let node = Box::into_raw(node);
        if let Some(old) = unsafe { old_head.as_ref() } {
            old.prev.store(node, Ordering::Relaxed);
        }
        // Publishes the node's contents along with the pointer.
        self.head.store(node, Ordering::Release);
        Registration {
            // SAFETY: `Box::into_raw` never returns null.
            node: unsafe { NonNull::new_unchecked(node) },
            id,
        }
    }

    /// Whether `reg` names a node currently in this list. Caller holds the
    /// control lock.
    pub(crate) fn contains(&self, reg: &Registration) -> bool {
        self.nodes().any(|node| {
            ptr::eq(node, reg.node.as_ptr()) && node.id == reg.id
        })
    }

    /// Splice `reg`'s node out of the list. Readers may still hold it; free
    /// it with [`free`](Self::free) only after a drain. Caller holds the
    /// control lock and has checked [`contains`](Self::contains).
    pub(crate) fn unlink(&self, reg: &Registration) -> NonNull<Node> {
        // SAFETY: linked nodes are live and only this lock holder mutates
        // links.
        let node = unsafe { reg.node.as_ref() };
        let next = node.next.load(Ordering::Relaxed);
        let prev = node.prev.load(Ordering::Relaxed);

        match unsafe { prev.as_ref() } {
            Some(prev) => prev.next.store(next, Ordering::Release),
            None => self.head.store(next, Ordering::Release),
        }
        if let Some(next) = unsafe { next.as_ref() } {
            next.prev.store(prev, Ordering::Relaxed);
        }
        reg.node
    }

    /// Release an unlinked node.
    ///
    /// # Safety
    ///
    /// `node` came from [`unlink`](Self::unlink) and a phaser drain has
    /// completed since.
    pub(crate) unsafe fn free(node: NonNull<Node>) {
        drop(unsafe { Box::from_raw(node.as_ptr()) });
    }

    /// Number of linked nodes. Caller holds the control lock.
    pub(crate) fn len(&self) -> usize {
        self.nodes().count()
    }

    /// Offer the signal to each matching handler, newest first, until one
    /// claims it.
    ///
    /// Signal-safe. The caller must be inside a critical section of the
    /// phaser that guards this registry. A handler that closes that section
    /// and returns anyway ends the walk as if it had claimed the signal,
    /// since no node may be touched after the section closes.
    pub(crate) fn dispatch(&self, info: &SignalInfo<'_>, low_priority: bool) -> SigmuxAction {
        let signum = info.signum();
        let mut cursor = self.head.load(Ordering::Acquire);
        while let Some(node) = unsafe { cursor.as_ref() } {
            if node.wants(signum, low_priority) {
                let action = node.handler.handle(info);
                if action == SigmuxAction::ContinueExecution || !info.section().is_open() {
                    return SigmuxAction::ContinueExecution;
                }
            }
            cursor = node.next.load(Ordering::Acquire);
        }
        SigmuxAction::ContinueSearch
    }

    fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        let mut cursor = self.head.load(Ordering::Acquire);
        std::iter::from_fn(move || {
            let node = unsafe { cursor.as_ref() }?;
            cursor = node.next.load(Ordering::Acquire);
            Some(node)
        })
    }

    /// Free every node. Requires exclusive access, so no reader can be
    /// walking the list.
    pub(crate) fn clear(&mut self) {
        let mut cursor = std::mem::replace(self.head.get_mut(), ptr::null_mut());
        while !cursor.is_null() {
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next.load(Ordering::Relaxed);
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.clear();
    }
}
