use std::sync::{
    atomic::{AtomicBool, Ordering},
    Condvar, MutexGuard,
};
use std::time::Duration;

/// Coordinates engine shutdown with the write-stall path.
///
/// Beginning a shutdown and draining a sealed memtable both need to wake
/// foreground writers parked on the sealed-memtable queue, so the one-way
/// stop flag and the writer-release condvar live in one primitive. Shared
/// as an `Arc` between the engine, the compaction worker and the tuner
/// thread.
pub struct Shutdown {
    stopped: AtomicBool,

    /// Signalled when a sealed memtable drained (the queue has room
    /// again) and when shutdown begins (stalled writers must fail fast
    /// instead of waiting out their timeout)
    writer_release: Condvar,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            writer_release: Condvar::new(),
        }
    }
}

impl Shutdown {
    /// Begins the shutdown.
    ///
    /// No new work is accepted afterwards, and parked writers are woken so
    /// they can observe the flag. Cannot be undone.
    pub fn begin(&self) {
        self.stopped.store(true, Ordering::Release);
        self.writer_release.notify_all();
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Wakes writers stalled on the sealed-memtable queue
    pub fn release_writers(&self) {
        self.writer_release.notify_all();
    }

    /// Parks a stalled writer on its queue guard until the next release
    /// (or the timeout, so the caller can re-check its deadline).
    ///
    /// The caller re-checks queue room and the stop flag; spurious wakeups
    /// are harmless.
    pub fn park_writer<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> MutexGuard<'a, T> {
        let (guard, _) = self
            .writer_release
            .wait_timeout(guard, timeout)
            .expect("lock is poisoned");

        guard
    }
}
