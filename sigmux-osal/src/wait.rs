//! Wait/wake backends
//!
//! A phaser drain sleeps until a counter word reaches a target value; the
//! critical-section exit that makes it so issues the wake. Two strategies:
//!
//! - [`FutexWaiter`]: `FUTEX_WAIT`/`FUTEX_WAKE` on the counter word itself
//!   (Linux/Android). No file descriptors, lowest latency.
//! - [`PipeWaiter`]: a one-byte pipe used as a binary semaphore, for
//!   platforms without futex. One pipe per phaser suffices because only one
//!   counter is ever drained at a time.
//!
//! Callers re-check the word after every `wait` return, so both backends may
//! wake spuriously. Neither may lose a wake that is issued after `wait`
//! began comparing the word.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::OnceLock;
use std::sync::atomic::AtomicU32;

use crate::ErrnoGuard;

pub trait WaitWake: Send + Sync {
    /// Acquire whatever OS resources the backend needs. Idempotent; callers
    /// serialize it with `wait`.
    fn prepare(&self) -> io::Result<()>;

    /// Block while `word` may still hold `observed`. Not signal-safe.
    fn wait(&self, word: &AtomicU32, observed: u32);

    /// Wake the waiter blocked on `word`, if any. Async-signal-safe,
    /// never blocks, preserves errno.
    fn wake(&self, word: &AtomicU32);
}

cfg_if::cfg_if! {
    if #[cfg(all(any(target_os = "linux", target_os = "android"), not(feature = "pipe-backend")))] {
        /// Backend selected for this build
        pub type DefaultWaiter = FutexWaiter;
    } else {
        /// Backend selected for this build
        pub type DefaultWaiter = PipeWaiter;
    }
}

// ============================================================================
// futex
// ============================================================================

#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Default)]
pub struct FutexWaiter;

#[cfg(any(target_os = "linux", target_os = "android"))]
impl FutexWaiter {
    pub const fn new() -> Self {
        FutexWaiter
    }

    fn futex(word: &AtomicU32, op: libc::c_int, val: u32) -> libc::c_long {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                op | libc::FUTEX_PRIVATE_FLAG,
                val,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            )
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl WaitWake for FutexWaiter {
    fn prepare(&self) -> io::Result<()> {
        Ok(())
    }

    fn wait(&self, word: &AtomicU32, observed: u32) {
        if Self::futex(word, libc::FUTEX_WAIT, observed) == -1 {
            let err = crate::errno();
            debug_assert!(
                err == libc::EAGAIN || err == libc::EINTR,
                "FUTEX_WAIT failed: errno {}",
                err
            );
        }
    }

    fn wake(&self, word: &AtomicU32) {
        let _errno = ErrnoGuard::new();
        // The phaser contract allows a single drainer, but waking everyone
        // costs nothing extra.
        let ret = Self::futex(word, libc::FUTEX_WAKE, i32::MAX as u32);
        debug_assert!(ret != -1, "FUTEX_WAKE failed");
    }
}

// ============================================================================
// pipe
// ============================================================================

/// Pipe-as-semaphore backend: down = read a byte, up = write a byte.
pub struct PipeWaiter {
    fds: OnceLock<(OwnedFd, OwnedFd)>,
}

impl PipeWaiter {
    pub const fn new() -> Self {
        Self {
            fds: OnceLock::new(),
        }
    }

    /// Whether `prepare` has created the pipe
    pub fn is_prepared(&self) -> bool {
        self.fds.get().is_some()
    }

    fn open_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut raw = [-1; 2];
        if unsafe { libc::pipe(raw.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(raw[0]), OwnedFd::from_raw_fd(raw[1])) };

        for fd in [rd.as_raw_fd(), wr.as_raw_fd()] {
            if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        // A full pipe already holds a pending wake, so the writer must never
        // block on it.
        let flags = unsafe { libc::fcntl(wr.as_raw_fd(), libc::F_GETFL) };
        if flags == -1
            || unsafe { libc::fcntl(wr.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1
        {
            return Err(io::Error::last_os_error());
        }
        Ok((rd, wr))
    }
}

impl Default for PipeWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PipeWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fds.get() {
            Some((rd, wr)) => f
                .debug_struct("PipeWaiter")
                .field("read_fd", &rd.as_raw_fd())
                .field("write_fd", &wr.as_raw_fd())
                .finish(),
            None => f.write_str("PipeWaiter(unprepared)"),
        }
    }
}

impl WaitWake for PipeWaiter {
    fn prepare(&self) -> io::Result<()> {
        if self.fds.get().is_none() {
            let pair = Self::open_pipe()?;
            // Lost race: the extra pair is closed on drop.
            let _ = self.fds.set(pair);
        }
        Ok(())
    }

    fn wait(&self, _word: &AtomicU32, _observed: u32) {
        let Some((rd, _)) = self.fds.get() else {
            // Unprepared: degrade to polling.
            std::thread::yield_now();
            return;
        };
        let mut junk = 0u8;
        loop {
            let ret = unsafe { libc::read(rd.as_raw_fd(), (&raw mut junk).cast(), 1) };
            if ret == 1 {
                return;
            }
            let err = crate::errno();
            if ret < 0 && err == libc::EINTR {
                continue;
            }
            debug_assert!(false, "pipe read returned {} (errno {})", ret, err);
            return;
        }
    }

    fn wake(&self, _word: &AtomicU32) {
        let Some((_, wr)) = self.fds.get() else {
            return;
        };
        let _errno = ErrnoGuard::new();
        let byte = 0u8;
        loop {
            let ret = unsafe { libc::write(wr.as_raw_fd(), (&raw const byte).cast(), 1) };
            if ret == -1 && crate::errno() == libc::EINTR {
                continue;
            }
            // EAGAIN: the pipe is full, so a wake is already pending.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    fn wake_after_store<W: WaitWake + 'static>(waiter: Arc<W>) {
        waiter.prepare().unwrap();
        let word = Arc::new(AtomicU32::new(1));

        let setter = {
            let waiter = Arc::clone(&waiter);
            let word = Arc::clone(&word);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                word.store(0, Ordering::SeqCst);
                waiter.wake(&word);
            })
        };

        loop {
            let value = word.load(Ordering::SeqCst);
            if value == 0 {
                break;
            }
            waiter.wait(&word, value);
        }
        setter.join().unwrap();
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_futex_wake() {
        wake_after_store(Arc::new(FutexWaiter::new()));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_futex_wait_on_stale_value_returns() {
        let word = AtomicU32::new(5);
        // Value differs from `observed`: must return immediately (EAGAIN).
        FutexWaiter::new().wait(&word, 4);
    }

    #[test]
    fn test_pipe_wake() {
        wake_after_store(Arc::new(PipeWaiter::new()));
    }

    #[test]
    fn test_pipe_wake_never_blocks_when_full() {
        let waiter = PipeWaiter::new();
        waiter.prepare().unwrap();
        let word = AtomicU32::new(0);
        // Far more than any pipe buffer.
        for _ in 0..200_000 {
            waiter.wake(&word);
        }
        waiter.wait(&word, 0);
    }

    #[test]
    fn test_pipe_wake_preserves_errno() {
        let waiter = PipeWaiter::new();
        waiter.prepare().unwrap();
        crate::set_errno(libc::ENOENT);
        waiter.wake(&AtomicU32::new(0));
        assert_eq!(crate::errno(), libc::ENOENT);
    }

    #[test]
    fn test_unprepared_pipe_is_harmless() {
        let waiter = PipeWaiter::new();
        assert!(!waiter.is_prepared());
        let word = AtomicU32::new(0);
        waiter.wake(&word);
        waiter.wait(&word, 0);
    }
}
