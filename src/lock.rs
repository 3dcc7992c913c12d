//! Lock guarding per channel state.

#[cfg(feature = "mt")]
use std::hint;
#[cfg(feature = "mt")]
use std::sync::atomic::{AtomicBool, Ordering};

/// Non-reentrant spin lock.
///
/// Critical sections are short and never suspend: fibers park only after the
/// lock is released. Without the `mt` feature the lock compiles to a no-op and
/// correctness relies on the embedding scheduler being single-threaded.
#[cfg(feature = "mt")]
pub(crate) struct Lock {
    locked: AtomicBool,
}

#[cfg(feature = "mt")]
impl Lock {
    pub fn new() -> Lock {
        Lock { locked: AtomicBool::new(false) }
    }

    pub fn lock(&self) {
        while self.locked.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn sync<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let result = f();
        self.unlock();
        result
    }
}

#[cfg(not(feature = "mt"))]
pub(crate) struct Lock;

#[cfg(not(feature = "mt"))]
impl Lock {
    pub fn new() -> Lock {
        Lock
    }

    pub fn lock(&self) {}

    pub fn unlock(&self) {}

    pub fn sync<R>(&self, f: impl FnOnce() -> R) -> R {
        f()
    }
}

#[cfg(all(test, feature = "mt"))]
mod tests {
    use std::cell::UnsafeCell;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::Lock;

    struct Counter {
        lock: Lock,
        count: UnsafeCell<usize>,
    }

    // SAFETY: `count` is mutated only while `lock` is held.
    unsafe impl Sync for Counter {}

    #[test]
    fn exclusion() {
        let counter = Arc::new(Counter { lock: Lock::new(), count: UnsafeCell::new(0) });
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.lock.sync(|| unsafe { *counter.count.get() += 1 });
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(unsafe { *counter.count.get() }, 4000);
    }
}
