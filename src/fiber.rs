//! Fiber identity and the park/restore contract consumed by channels.
//!
//! A fiber is whatever the embedding scheduler runs: this module maps each
//! fiber onto its backing thread. A blocked channel operation enqueues the
//! [current] fiber and calls [reschedule]; the peer completing the transfer
//! calls [Fiber::restore] to mark it runnable again.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};

use static_assertions::assert_impl_all;

/// Identity of a running or parked fiber, comparable for equality.
#[derive(Clone)]
pub struct Fiber {
    inner: Arc<Inner>,
}

struct Inner {
    thread: Thread,
    // One pending wakeup. Absorbs a restore that lands before the park.
    notified: AtomicBool,
}

assert_impl_all!(Fiber: Send, Sync, Clone);

thread_local! {
    static CURRENT: Fiber = Fiber {
        inner: Arc::new(Inner { thread: thread::current(), notified: AtomicBool::new(false) }),
    };
}

/// Returns the identity of the calling fiber.
pub fn current() -> Fiber {
    CURRENT.with(Fiber::clone)
}

/// Parks the calling fiber until another fiber [restores][Fiber::restore] it.
///
/// Returns immediately if a restore already arrived. Every park is paired
/// with exactly one restore, so a wakeup here always means the awaited state
/// transition has been published.
pub fn reschedule() {
    let fiber = current();
    while !fiber.inner.notified.swap(false, Ordering::Acquire) {
        thread::park();
    }
}

impl Fiber {
    /// Marks this fiber runnable. Safe to call while holding a channel lock.
    pub fn restore(&self) {
        self.inner.notified.store(true, Ordering::Release);
        self.inner.thread.unpark();
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Fiber) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Fiber {}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({:p})", Arc::as_ptr(&self.inner))
    }
}

/// Spawns a new fiber running `f`.
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::spawn(f)
}
