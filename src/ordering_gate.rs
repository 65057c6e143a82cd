//! Process-wide mutual exclusion between lifecycle operations (`attach`,
//! `detach`, `teardown`) and the fatal path, per §4.4/§4.8.
//!
//! Ordinary lifecycle calls take a plain blocking lock: they are never
//! called from a signal handler, so there is no harm in parking the
//! calling thread. `fatal()` cannot do that — blocking in a signal
//! handler on a lock another thread might hold while itself inside a
//! signal handler risks deadlock — so it instead busy-polls `try_lock`.
//! This mirrors the one busy-loop the teacher's own process-reaping code
//! accepts for the same reason (waiting on another process from a
//! restricted context with no safe alternative).

use std::cell::Cell;
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

thread_local! {
    // Reentrancy guard: a second `fatal()` call on the same thread that
    // already holds the gate (e.g. a signal raised while already inside
    // the fatal path) must not spin forever waiting on itself.
    static HOLDING: Cell<bool> = Cell::new(false);
    // Set once a thread has completed a full fatal report. A second,
    // distinct fatal on the same thread after that point is a no-op per
    // §4.4's "at most one fatal report per thread" rule.
    static FATAL_DONE: Cell<bool> = Cell::new(false);
}

/// The gate itself: a unit mutex whose only job is mutual exclusion, not
/// protecting any particular piece of data.
#[derive(Default)]
pub struct OrderingGate(Mutex<()>);

/// RAII guard releasing the gate (and the thread-local reentrancy flag)
/// when dropped.
pub struct GateGuard<'a> {
    _inner: Option<MutexGuard<'a, ()>>,
    reentrant: bool,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if !self.reentrant {
            HOLDING.with(|h| h.set(false));
        }
    }
}

impl OrderingGate {
    pub fn new() -> OrderingGate {
        OrderingGate(Mutex::new(()))
    }

    /// Blocking acquisition for ordinary (non-signal) lifecycle calls.
    pub fn lock(&self) -> GateGuard<'_> {
        if HOLDING.with(Cell::get) {
            return GateGuard {
                _inner: None,
                reentrant: true,
            };
        }
        let guard = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        HOLDING.with(|h| h.set(true));
        GateGuard {
            _inner: Some(guard),
            reentrant: false,
        }
    }

    /// Returns `true` if this thread has already completed a fatal
    /// report and should treat a further call as a no-op.
    pub fn fatal_already_done(&self) -> bool {
        FATAL_DONE.with(Cell::get)
    }

    pub fn mark_fatal_done(&self) {
        FATAL_DONE.with(|f| f.set(true));
    }

    /// Busy-polls for the gate from the fatal path. Reentrant on the
    /// thread that already holds it (a fatal signal delivered while
    /// already inside `fatal()`), otherwise spins on `try_lock` until the
    /// gate is free or `deadline` passes.
    ///
    /// This never blocks on the underlying mutex's parking queue: that
    /// queue is not async-signal-safe to wait on, whereas a `try_lock`
    /// poll loop touches no more than the mutex's own atomic state.
    pub fn spin_lock(&self, deadline: Option<Duration>) -> Option<GateGuard<'_>> {
        if HOLDING.with(Cell::get) {
            return Some(GateGuard {
                _inner: None,
                reentrant: true,
            });
        }
        let started = Instant::now();
        loop {
            match self.0.try_lock() {
                Ok(guard) => {
                    HOLDING.with(|h| h.set(true));
                    return Some(GateGuard {
                        _inner: Some(guard),
                        reentrant: false,
                    });
                }
                Err(TryLockError::Poisoned(poisoned)) => {
                    HOLDING.with(|h| h.set(true));
                    return Some(GateGuard {
                        _inner: Some(poisoned.into_inner()),
                        reentrant: false,
                    });
                }
                Err(TryLockError::WouldBlock) => {
                    if let Some(deadline) = deadline {
                        if started.elapsed() >= deadline {
                            return None;
                        }
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn lock_is_reentrant_on_same_thread() {
        let gate = OrderingGate::new();
        let _outer = gate.lock();
        let _inner = gate.lock();
    }

    #[test]
    fn spin_lock_waits_for_blocking_holder_to_release() {
        let gate = Arc::new(OrderingGate::new());
        let gate2 = Arc::clone(&gate);
        let handle = thread::spawn(move || {
            let _guard = gate2.lock();
            thread::sleep(Duration::from_millis(50));
        });
        thread::sleep(Duration::from_millis(10));
        let guard = gate.spin_lock(Some(Duration::from_secs(5)));
        assert!(guard.is_some());
        handle.join().unwrap();
    }

    #[test]
    fn spin_lock_times_out_if_never_released() {
        let gate = Arc::new(OrderingGate::new());
        let gate2 = Arc::clone(&gate);
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let _guard = gate2.lock();
            tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(200));
        });
        rx.recv().unwrap();
        let guard = gate.spin_lock(Some(Duration::from_millis(20)));
        assert!(guard.is_none());
        handle.join().unwrap();
    }

    #[test]
    fn fatal_done_flag_is_per_thread() {
        let gate = OrderingGate::new();
        assert!(!gate.fatal_already_done());
        gate.mark_fatal_done();
        assert!(gate.fatal_already_done());
        let joined = thread::spawn(|| {
            let gate = OrderingGate::new();
            gate.fatal_already_done()
        })
        .join()
        .unwrap();
        assert!(!joined);
    }
}
