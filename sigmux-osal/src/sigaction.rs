//! The "real" `sigaction`
//!
//! Sigmux never calls `sigaction(2)` directly. It goes through a
//! [`RealSigaction`] so a higher layer (for example a libc-level sigaction
//! emulation shim that routes application calls into sigmux) can interpose
//! the function sigmux itself uses to reach the kernel.

use std::fmt;
use std::io;

use parking_lot::Mutex;

use crate::sigset::{NSIG, SignalSet};

/// C signature of `sigaction(2)`
pub type SigactionFn =
    unsafe extern "C" fn(libc::c_int, *const libc::sigaction, *mut libc::sigaction) -> libc::c_int;

pub trait RealSigaction: Send + Sync {
    /// Query and/or replace the disposition of `signum`, with `sigaction(2)`
    /// semantics.
    fn sigaction(
        &self,
        signum: i32,
        act: Option<&libc::sigaction>,
        oldact: Option<&mut libc::sigaction>,
    ) -> io::Result<()>;
}

/// An all-zero `struct sigaction`, i.e. `SIG_DFL` with no flags
pub fn zeroed_sigaction() -> libc::sigaction {
    // SAFETY: every field of `struct sigaction` is an integer, a bit set or
    // a nullable function pointer.
    unsafe { std::mem::zeroed() }
}

// ============================================================================
// OS
// ============================================================================

/// Calls a C `sigaction`-shaped function; by default libc's.
#[derive(Clone, Copy)]
pub struct OsSigaction {
    func: SigactionFn,
}

impl OsSigaction {
    /// libc's `sigaction`
    pub const fn libc() -> Self {
        Self {
            func: libc::sigaction,
        }
    }

    /// Wrap a foreign `sigaction` implementation.
    ///
    /// # Safety
    ///
    /// `func` must behave like `sigaction(2)` and be async-signal-safe: sigmux
    /// calls it from signal context when it restores a default disposition.
    pub const unsafe fn from_fn(func: SigactionFn) -> Self {
        Self { func }
    }

    pub fn function(&self) -> SigactionFn {
        self.func
    }
}

impl Default for OsSigaction {
    fn default() -> Self {
        Self::libc()
    }
}

impl fmt::Debug for OsSigaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsSigaction")
            .field("func", &(self.func as usize as *const ()))
            .finish()
    }
}

impl RealSigaction for OsSigaction {
    fn sigaction(
        &self,
        signum: i32,
        act: Option<&libc::sigaction>,
        oldact: Option<&mut libc::sigaction>,
    ) -> io::Result<()> {
        let act = act.map_or(std::ptr::null(), |a| a as *const libc::sigaction);
        let oldact = oldact.map_or(std::ptr::null_mut(), |a| a as *mut libc::sigaction);
        if unsafe { (self.func)(signum, act, oldact) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

// ============================================================================
// Fake (测试用)
// ============================================================================

/// One recorded call to [`FakeSigaction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigactionCall {
    pub signum: i32,
    /// `sa_sigaction` of the installed action, if one was passed
    pub installed: Option<usize>,
    /// Whether the caller asked for the previous action
    pub queried: bool,
}

/// Disposition table kept in memory; never touches the process's real
/// signal dispositions.
pub struct FakeSigaction {
    table: Mutex<Vec<libc::sigaction>>,
    calls: Mutex<Vec<SigactionCall>>,
}

impl FakeSigaction {
    /// All signals start at `SIG_DFL`
    pub fn new() -> Self {
        Self {
            table: Mutex::new((0..NSIG).map(|_| zeroed_sigaction()).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Preset the disposition sigmux will find when it seizes `signum`
    pub fn with_disposition(self, signum: i32, act: libc::sigaction) -> Self {
        self.table.lock()[signum as usize] = act;
        self
    }

    /// Current disposition of `signum`
    pub fn disposition(&self, signum: i32) -> Option<libc::sigaction> {
        SignalSet::is_valid(signum).then(|| self.table.lock()[signum as usize])
    }

    pub fn calls(&self) -> Vec<SigactionCall> {
        self.calls.lock().clone()
    }

    /// Signals an action was ever installed for
    pub fn installed_signals(&self) -> SignalSet {
        let mut set = SignalSet::empty();
        for call in self.calls.lock().iter().filter(|c| c.installed.is_some()) {
            let _ = set.add(call.signum);
        }
        set
    }
}

impl Default for FakeSigaction {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FakeSigaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeSigaction")
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

impl RealSigaction for FakeSigaction {
    fn sigaction(
        &self,
        signum: i32,
        act: Option<&libc::sigaction>,
        oldact: Option<&mut libc::sigaction>,
    ) -> io::Result<()> {
        if !SignalSet::is_valid(signum) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.calls.lock().push(SigactionCall {
            signum,
            installed: act.map(|a| a.sa_sigaction),
            queried: oldact.is_some(),
        });

        let mut table = self.table.lock();
        let slot = &mut table[signum as usize];
        if let Some(oldact) = oldact {
            *oldact = *slot;
        }
        if let Some(act) = act {
            *slot = *act;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_sigaction_query() {
        let real = OsSigaction::libc();
        let mut old = zeroed_sigaction();
        real.sigaction(libc::SIGWINCH, None, Some(&mut old)).unwrap();
    }

    #[test]
    fn test_os_sigaction_invalid_signal() {
        let real = OsSigaction::default();
        let err = real.sigaction(0, None, None).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn test_fake_records_and_swaps() {
        let fake = FakeSigaction::new();
        let mut act = zeroed_sigaction();
        act.sa_sigaction = libc::SIG_IGN;

        let mut old = zeroed_sigaction();
        fake.sigaction(libc::SIGUSR1, Some(&act), Some(&mut old))
            .unwrap();
        assert_eq!(old.sa_sigaction, libc::SIG_DFL);
        assert_eq!(
            fake.disposition(libc::SIGUSR1).unwrap().sa_sigaction,
            libc::SIG_IGN
        );
        assert_eq!(
            fake.calls(),
            vec![SigactionCall {
                signum: libc::SIGUSR1,
                installed: Some(libc::SIG_IGN),
                queried: true,
            }]
        );
        assert!(fake.installed_signals().contains(libc::SIGUSR1));
    }
}
