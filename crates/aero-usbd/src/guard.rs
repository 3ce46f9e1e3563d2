//! Exclusive-access discipline shared by thread-context API calls and interrupt-context events.
//!
//! The concrete primitive (interrupt masking, a spinlock, a host mutex) is supplied through
//! [`CriticalSection`]. [`ConcurrencyGuard`] layers a depth counter on top so that nested
//! acquisition from the same context (e.g. a device class calling back into the device from inside
//! a callback) never re-enters the primitive.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Platform hook that excludes the other execution context while held.
///
/// `enter`/`exit` calls are always balanced by [`ConcurrencyGuard`] and never nested.
pub trait CriticalSection {
    fn enter(&self);
    fn exit(&self);
}

/// Critical section for single-context use (tests, polled PHYs).
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCriticalSection;

impl CriticalSection for NoopCriticalSection {
    fn enter(&self) {}
    fn exit(&self) {}
}

struct GuardState {
    section: Box<dyn CriticalSection + Send + Sync>,
    depth: AtomicU32,
}

/// Re-entrant, depth-counting guard over a [`CriticalSection`].
///
/// Clones share the same depth counter and primitive.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    state: Arc<GuardState>,
}

impl ConcurrencyGuard {
    pub fn new(section: impl CriticalSection + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(GuardState {
                section: Box::new(section),
                depth: AtomicU32::new(0),
            }),
        }
    }

    pub fn lock(&self) {
        if self.state.depth.load(Ordering::Acquire) == 0 {
            self.state.section.enter();
        }
        self.state.depth.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unlock(&self) {
        let depth = self.state.depth.load(Ordering::Acquire);
        if depth == 0 {
            warn!("ConcurrencyGuard::unlock called without a matching lock");
            debug_assert!(false, "unbalanced ConcurrencyGuard::unlock");
            return;
        }
        self.state.depth.store(depth - 1, Ordering::Release);
        if depth == 1 {
            self.state.section.exit();
        }
    }

    /// Acquires the guard until the returned value is dropped, including during unwinding.
    pub fn hold(&self) -> GuardHeld<'_> {
        self.lock();
        GuardHeld { guard: self }
    }

    /// Development-time check that the caller holds the guard.
    pub fn assert_locked(&self) {
        debug_assert!(self.is_locked(), "USB device state accessed without holding the lock");
    }

    pub fn is_locked(&self) -> bool {
        self.depth() > 0
    }

    pub fn depth(&self) -> u32 {
        self.state.depth.load(Ordering::Acquire)
    }
}

/// Scoped acquisition returned by [`ConcurrencyGuard::hold`].
#[must_use = "the guard is released as soon as this value is dropped"]
pub struct GuardHeld<'a> {
    guard: &'a ConcurrencyGuard,
}

impl Drop for GuardHeld<'_> {
    fn drop(&mut self) {
        self.guard.unlock();
    }
}

impl Default for ConcurrencyGuard {
    fn default() -> Self {
        Self::new(NoopCriticalSection)
    }
}

impl core::fmt::Debug for ConcurrencyGuard {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConcurrencyGuard")
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}
