//! Handler lifetime and default fallback under concurrency
//!
//! Dispatch threads call `handle_signal` on private multiplexers the way the
//! trampoline would, while the control thread unregisters handlers and
//! rewrites dispositions underneath them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use sigmux::{
    DispatchFlags, FakeSigaction, RegisterFlags, SigactionImpl, SigmuxAction, SignalHandler,
    SignalInfo, SignalSet, Sigmux,
};
use sigmux_osal::sigaction::zeroed_sigaction;

fn init() {
    sigmux_common::logging::init();
}

fn dispatch(mux: &Sigmux, signum: i32, flags: DispatchFlags) -> SigmuxAction {
    unsafe { mux.handle_signal(signum, std::ptr::null_mut(), std::ptr::null_mut(), flags) }
}

fn fake_backed() -> (Sigmux, &'static FakeSigaction) {
    let fake: &'static FakeSigaction = Box::leak(Box::new(FakeSigaction::new()));
    let mux = Sigmux::new();
    mux.set_real_sigaction(SigactionImpl::Custom(fake));
    (mux, fake)
}

#[test]
fn test_unregister_waits_for_running_handler() {
    init();
    let mux = Arc::new(Sigmux::new());
    let entered = Arc::new(Barrier::new(2));
    let running = Arc::new(AtomicBool::new(false));

    let reg = {
        let entered = Arc::clone(&entered);
        let running = Arc::clone(&running);
        mux.register(
            SignalSet::from_signals([libc::SIGUSR1]).unwrap(),
            move |_: &SignalInfo<'_>| {
                running.store(true, Ordering::SeqCst);
                entered.wait();
                thread::sleep(Duration::from_millis(50));
                running.store(false, Ordering::SeqCst);
                SigmuxAction::ContinueExecution
            },
            RegisterFlags::empty(),
        )
        .unwrap()
    };

    let dispatcher = {
        let mux = Arc::clone(&mux);
        thread::spawn(move || dispatch(&mux, libc::SIGUSR1, DispatchFlags::all()))
    };

    entered.wait();
    mux.unregister(reg).unwrap();
    assert!(
        !running.load(Ordering::SeqCst),
        "unregister returned while the handler was running"
    );
    assert_eq!(dispatcher.join().unwrap(), SigmuxAction::ContinueExecution);
    assert_eq!(mux.registrations(), 0);
}

const LIVE: u64 = 0x5349_474d_5558_4f4b;
const DEAD: u64 = 0xdead_beef_dead_beef;

static VIOLATIONS: AtomicUsize = AtomicUsize::new(0);

/// Poisons itself on drop, so a handler that runs after being freed notices.
struct Sentinel {
    state: u64,
}

impl SignalHandler for Sentinel {
    fn handle(&self, _info: &SignalInfo<'_>) -> SigmuxAction {
        if unsafe { std::ptr::read_volatile(&self.state) } != LIVE {
            VIOLATIONS.fetch_add(1, Ordering::SeqCst);
        }
        SigmuxAction::ContinueSearch
    }
}

impl Drop for Sentinel {
    fn drop(&mut self) {
        unsafe { std::ptr::write_volatile(&mut self.state, DEAD) };
    }
}

#[test]
fn test_register_unregister_churn_during_dispatch() {
    init();
    let mux = Arc::new(Sigmux::new());
    let stop = Arc::new(AtomicBool::new(false));
    let signals = SignalSet::from_signals([libc::SIGUSR2]).unwrap();

    let dispatchers: Vec<_> = (0..4)
        .map(|_| {
            let mux = Arc::clone(&mux);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut rounds = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    dispatch(&mux, libc::SIGUSR2, DispatchFlags::all());
                    rounds += 1;
                }
                rounds
            })
        })
        .collect();

    for round in 0..300 {
        let flags = if round % 3 == 0 {
            RegisterFlags::LOW_PRIORITY
        } else {
            RegisterFlags::empty()
        };
        let a = mux.register(signals, Sentinel { state: LIVE }, flags).unwrap();
        let b = mux
            .register(signals, Sentinel { state: LIVE }, RegisterFlags::empty())
            .unwrap();
        mux.unregister(a).unwrap();
        mux.unregister(b).unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    let rounds: u64 = dispatchers.into_iter().map(|d| d.join().unwrap()).sum();
    log::debug!("{} dispatches during churn", rounds);
    assert_eq!(VIOLATIONS.load(Ordering::SeqCst), 0);
    assert_eq!(mux.registrations(), 0);
}

static ONE_SHOT_RUNS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn one_shot(_: libc::c_int) {
    ONE_SHOT_RUNS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_one_shot_fallback_runs_exactly_once() {
    init();
    let (mux, _fake) = fake_backed();
    mux.init(libc::SIGCHLD).unwrap();

    let mut act = zeroed_sigaction();
    act.sa_sigaction = one_shot as usize;
    act.sa_flags = libc::SA_RESETHAND;
    mux.sigaction(libc::SIGCHLD, Some(&act), None).unwrap();

    let start = Barrier::new(8);
    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                start.wait();
                // The losers fall back to SIGCHLD's default, which is to
                // ignore it.
                assert_eq!(
                    dispatch(&mux, libc::SIGCHLD, DispatchFlags::all()),
                    SigmuxAction::ContinueExecution
                );
            });
        }
    });
    assert_eq!(ONE_SHOT_RUNS.load(Ordering::SeqCst), 1);

    let mut old = zeroed_sigaction();
    mux.sigaction(libc::SIGCHLD, None, Some(&mut old)).unwrap();
    assert_eq!(old.sa_sigaction, libc::SIG_DFL);
    assert_eq!(old.sa_flags & (libc::SA_RESETHAND | libc::SA_SIGINFO), 0);
}

static REWRITE_RUNS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn rewrite_target(_: libc::c_int) {
    REWRITE_RUNS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_sigaction_rewrites_during_fallback() {
    init();
    let (mux, _fake) = fake_backed();
    let mux = Arc::new(mux);
    mux.init(libc::SIGWINCH).unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let dispatcher = {
        let mux = Arc::clone(&mux);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                // Either the handler or SIGWINCH's ignore default; never
                // anything else.
                dispatch(&mux, libc::SIGWINCH, DispatchFlags::INVOKE_DEFAULT);
            }
        })
    };

    let mut handler = zeroed_sigaction();
    handler.sa_sigaction = rewrite_target as usize;
    let dfl = zeroed_sigaction();
    for i in 0..500 {
        let act = if i % 2 == 0 { &handler } else { &dfl };
        mux.sigaction(libc::SIGWINCH, Some(act), None).unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    dispatcher.join().unwrap();
    log::debug!(
        "fallback handler ran {} times",
        REWRITE_RUNS.load(Ordering::SeqCst)
    );
}

#[test]
fn test_escape_leaves_multiplexer_usable() {
    init();
    let mux = Sigmux::new();
    let reg = mux
        .register(
            SignalSet::from_signals([libc::SIGUSR1]).unwrap(),
            |info: &SignalInfo<'_>| -> SigmuxAction {
                info.escape(|| std::panic::resume_unwind(Box::new("escaped")))
            },
            RegisterFlags::empty(),
        )
        .unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        dispatch(&mux, libc::SIGUSR1, DispatchFlags::all())
    }));
    assert!(result.is_err());

    // Would hang if the escaped dispatch still held its critical section.
    mux.unregister(reg).unwrap();
}
