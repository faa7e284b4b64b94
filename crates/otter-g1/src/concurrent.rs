//! Coordination between the collector, its background work and mutators.
//!
//! ## Design
//!
//! - [`GcPhase`] is published in an atomic so barriers and tests can observe it
//! - [`CancellationToken`] interrupts concurrent marking between objects
//! - [`MutatorControl`] is the runtime's stop-the-world hook

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Collector phase
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No GC in progress
    Idle = 0,
    /// Initial marking (pause)
    InitialMark = 1,
    /// Concurrent marking (background)
    ConcurrentMark = 2,
    /// Remark (pause)
    Remark = 3,
    /// Marking the collection set of a young or mixed pause
    MarkYoung = 4,
    /// Evacuating the collection set
    CollectYoungAndMove = 5,
    /// Marking for a full collection
    FullMark = 6,
    /// Compacting tenured regions in a full collection
    FullCompact = 7,
    /// Reclaiming dead humongous and non-movable objects
    Sweep = 8,
}

impl From<u8> for GcPhase {
    fn from(v: u8) -> Self {
        match v {
            1 => GcPhase::InitialMark,
            2 => GcPhase::ConcurrentMark,
            3 => GcPhase::Remark,
            4 => GcPhase::MarkYoung,
            5 => GcPhase::CollectYoungAndMove,
            6 => GcPhase::FullMark,
            7 => GcPhase::FullCompact,
            8 => GcPhase::Sweep,
            _ => GcPhase::Idle,
        }
    }
}

impl GcPhase {
    /// Whether the phase runs while mutators are stopped.
    pub fn is_pause(self) -> bool {
        !matches!(self, GcPhase::Idle | GcPhase::ConcurrentMark)
    }
}

/// Atomic holder for the current [`GcPhase`].
#[derive(Debug)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    /// Starts in [`GcPhase::Idle`].
    pub fn new() -> Self {
        Self(AtomicU8::new(GcPhase::Idle as u8))
    }

    /// Current phase.
    pub fn get(&self) -> GcPhase {
        GcPhase::from(self.0.load(Ordering::Acquire))
    }

    /// Switch phase, returning the previous one.
    pub fn set(&self, phase: GcPhase) -> GcPhase {
        GcPhase::from(self.0.swap(phase as u8, Ordering::AcqRel))
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative interruption of concurrent work.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

impl CancellationToken {
    /// Fresh, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake delayed waiters.
    pub fn cancel(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.condvar.notify_all();
    }

    /// Whether cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Clear a previous cancellation.
    pub fn reset(&self) {
        self.inner.cancelled.store(false, Ordering::Release);
    }

    /// Sleep up to `timeout`, returning early (with `true`) on cancellation.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            if self
                .inner
                .condvar
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                break;
            }
        }
        self.is_cancelled()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Stop-the-world hook implemented by the runtime.
pub trait MutatorControl: Send + Sync {
    /// Bring every mutator to a safe point and keep it there.
    fn suspend_all(&self);

    /// Let mutators continue.
    fn resume_all(&self);
}

/// Control for runtimes that only call into the collector from safe points.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMutatorControl;

impl MutatorControl for NoopMutatorControl {
    fn suspend_all(&self) {}

    fn resume_all(&self) {}
}

/// Keeps mutators suspended for its lifetime.
pub struct PauseGuard<'a> {
    control: &'a dyn MutatorControl,
}

impl<'a> PauseGuard<'a> {
    /// Suspend mutators until the guard is dropped.
    pub fn new(control: &'a dyn MutatorControl) -> Self {
        control.suspend_all();
        Self { control }
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.control.resume_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn phase_round_trip() {
        let cell = PhaseCell::new();
        assert_eq!(cell.get(), GcPhase::Idle);
        assert_eq!(cell.set(GcPhase::Remark), GcPhase::Idle);
        assert_eq!(cell.get(), GcPhase::Remark);
        assert!(GcPhase::Remark.is_pause());
        assert!(!GcPhase::ConcurrentMark.is_pause());
    }

    #[test]
    fn cancellation_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = std::thread::spawn(move || waiter.wait_for(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().unwrap());
        token.reset();
        assert!(!token.wait_for(Duration::from_millis(1)));
    }

    #[derive(Default)]
    struct Counting {
        suspended: AtomicUsize,
        resumed: AtomicUsize,
    }

    impl MutatorControl for Counting {
        fn suspend_all(&self) {
            self.suspended.fetch_add(1, Ordering::SeqCst);
        }

        fn resume_all(&self) {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn pause_guard_balances_calls() {
        let control = Counting::default();
        {
            let _pause = PauseGuard::new(&control);
            assert_eq!(control.suspended.load(Ordering::SeqCst), 1);
            assert_eq!(control.resumed.load(Ordering::SeqCst), 0);
        }
        assert_eq!(control.resumed.load(Ordering::SeqCst), 1);
    }
}
