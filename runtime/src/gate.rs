//! Exclusive call gate: one in-flight execution inside the core at a time.
//!
//! Every entry into the core (perform, setup, teardown, metrics flush) goes
//! through here. Waiters are served in FIFO order. The guard releases on
//! every exit path, including early returns and panics.
//!
//! Acquiring the gate again from inside a held call deadlocks; that is a
//! programming error, not a runtime condition.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, MutexGuard};

/// Future returned by an operation run under [`ExclusiveGate::with_exclusive`].
pub type GateFut<'a, R> = Pin<Box<dyn Future<Output = R> + Send + 'a>>;

pub struct ExclusiveGate<T> {
    value: Mutex<T>,
    held: AtomicBool,
    waiters: AtomicUsize,
}

impl<T> ExclusiveGate<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            held: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Wait for the gate and hold it until the guard is dropped.
    pub async fn acquire(&self) -> GateGuard<'_, T> {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let guard = self.value.lock().await;
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        self.held.store(true, Ordering::SeqCst);
        tracing::trace!("call gate acquired");
        GateGuard {
            guard,
            held: &self.held,
        }
    }

    /// Run `op` against the protected value while holding the gate.
    pub async fn with_exclusive<R>(
        &self,
        op: impl for<'a> FnOnce(&'a mut T) -> GateFut<'a, R>,
    ) -> R {
        let mut guard = self.acquire().await;
        op(&mut guard).await
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Number of callers currently blocked in [`acquire`](Self::acquire).
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }
}

pub struct GateGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    held: &'a AtomicBool,
}

impl<T> Deref for GateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for GateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for GateGuard<'_, T> {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
        tracing::trace!("call gate released");
    }
}
