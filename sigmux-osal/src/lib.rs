//! sigmux-osal: 操作系统抽象层
//!
//! Thin, async-signal-safe wrappers over the handful of OS facilities the
//! signal multiplexer needs: memory barriers, errno preservation, the thread
//! signal mask, a wait-on-address primitive and `sigaction(2)` itself.
//!
//! Every function in this crate that is documented as signal-safe performs
//! no allocation and takes no lock.

use std::sync::atomic::{Ordering, compiler_fence};

pub mod sigaction;
pub mod sigset;
pub mod wait;

pub use sigaction::{FakeSigaction, OsSigaction, RealSigaction, SigactionFn};
pub use sigset::{NSIG, SignalSet};
pub use wait::{DefaultWaiter, WaitWake};

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use wait::FutexWaiter;
pub use wait::PipeWaiter;

// ============================================================================
// 内存屏障
// ============================================================================

/// Compiler-only barrier, enough to order against a handler on this thread
#[inline]
pub fn compiler_barrier() {
    compiler_fence(Ordering::SeqCst);
}

// ============================================================================
// errno
// ============================================================================

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "emscripten"))] {
        use libc::__errno_location as errno_location;
    } else if #[cfg(target_os = "android")] {
        use libc::__errno as errno_location;
    } else {
        use libc::__error as errno_location;
    }
}

/// Current value of `errno` for this thread
#[inline]
pub fn errno() -> i32 {
    unsafe { *errno_location() }
}

/// Overwrite `errno` for this thread
#[inline]
pub fn set_errno(value: i32) {
    unsafe { *errno_location() = value };
}

/// Saves `errno` and restores it when dropped.
///
/// Signal handlers must leave `errno` as they found it; wrap every syscall
/// made on the signal path in one of these.
#[derive(Debug)]
pub struct ErrnoGuard {
    saved: i32,
}

impl ErrnoGuard {
    #[inline]
    pub fn new() -> Self {
        Self { saved: errno() }
    }
}

impl Default for ErrnoGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ErrnoGuard {
    #[inline]
    fn drop(&mut self) {
        set_errno(self.saved);
    }
}

// ============================================================================
// 信号掩码（均为异步信号安全）
// ============================================================================

/// An empty `sigset_t`
pub fn empty_sigset() -> libc::sigset_t {
    let mut set = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

/// Add `signum` to a raw `sigset_t`
pub fn sigset_add(set: &mut libc::sigset_t, signum: i32) {
    unsafe {
        libc::sigaddset(set, signum);
    }
}

/// Replace the calling thread's signal mask
pub fn set_thread_mask(mask: &libc::sigset_t) {
    let _errno = ErrnoGuard::new();
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, mask, std::ptr::null_mut());
    }
}

/// Remove `signum` from the calling thread's signal mask
pub fn unblock_signal(signum: i32) {
    let _errno = ErrnoGuard::new();
    let mut set = empty_sigset();
    sigset_add(&mut set, signum);
    unsafe {
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
}

/// Send `signum` to the calling thread
pub fn raise_signal(signum: i32) {
    let _errno = ErrnoGuard::new();
    unsafe {
        libc::raise(signum);
    }
}

/// Terminate the process with `SIGABRT`
pub fn abort_process() -> ! {
    unsafe { libc::abort() }
}

/// The calling thread's current signal mask
pub fn current_thread_mask() -> libc::sigset_t {
    let mut old = empty_sigset();
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, std::ptr::null(), &mut old);
    }
    old
}

// ============================================================================
// 测试
// ============================================================================
