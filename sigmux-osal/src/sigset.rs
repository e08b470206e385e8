//! Plain bitset of signal numbers.
//!
//! Used instead of `sigset_t` wherever the set is part of sigmux's own state,
//! so a debugger can read it without knowing the libc's `sigset_t` layout.

use std::fmt;

use sigmux_common::{Result, SigmuxError};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// One past the highest signal number (includes real-time signals)
        pub const NSIG: i32 = 65;
    } else {
        /// One past the highest signal number
        pub const NSIG: i32 = 32;
    }
}

const _: () = assert!(NSIG as u32 <= u128::BITS);

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SignalSet {
    bits: u128,
}

impl SignalSet {
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Every catchable-or-not signal number in `1..NSIG`
    pub const fn full() -> Self {
        let mut bits = 0u128;
        let mut signum = 1;
        while signum < NSIG {
            bits |= 1u128 << signum;
            signum += 1;
        }
        Self { bits }
    }

    #[inline]
    pub const fn is_valid(signum: i32) -> bool {
        0 < signum && signum < NSIG
    }

    /// Reject signal numbers outside `1..NSIG`
    pub fn check(signum: i32) -> Result<()> {
        if Self::is_valid(signum) {
            Ok(())
        } else {
            Err(SigmuxError::InvalidSignal(signum))
        }
    }

    pub fn add(&mut self, signum: i32) -> Result<()> {
        Self::check(signum)?;
        self.bits |= 1u128 << signum;
        Ok(())
    }

    pub fn remove(&mut self, signum: i32) -> Result<()> {
        Self::check(signum)?;
        self.bits &= !(1u128 << signum);
        Ok(())
    }

    /// Membership test; invalid numbers are never members
    #[inline]
    pub const fn contains(&self, signum: i32) -> bool {
        Self::is_valid(signum) && self.bits & (1u128 << signum) != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub const fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        (1..NSIG).filter(move |&signum| self.contains(signum))
    }

    /// Build a set from anything yielding signal numbers
    pub fn from_signals<I: IntoIterator<Item = i32>>(signals: I) -> Result<Self> {
        let mut set = Self::empty();
        for signum in signals {
            set.add(signum)?;
        }
        Ok(set)
    }

    pub fn from_sigset(raw: &libc::sigset_t) -> Self {
        let mut set = Self::empty();
        for signum in 1..NSIG {
            if unsafe { libc::sigismember(raw, signum) } == 1 {
                set.bits |= 1u128 << signum;
            }
        }
        set
    }

    pub fn to_sigset(&self) -> libc::sigset_t {
        let mut raw = crate::empty_sigset();
        for signum in self.iter() {
            crate::sigset_add(&mut raw, signum);
        }
        raw
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
