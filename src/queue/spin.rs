//! Bounded queue serialized by a busy-retry spin lock.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::Backoff;

use crate::queue::RingState;

/// A bounded circular queue guarded by a test-and-set spin lock.
///
/// Semantically identical to [`crate::queue::MutexQueue`]; only the wait
/// strategy differs. A contending thread spins (with exponential backoff)
/// and never yields, which trades CPU for latency under short critical
/// sections.
pub struct SpinQueue<T> {
    locked: AtomicBool,
    ring: UnsafeCell<RingState<T>>,
}

// Safety: the spin lock grants exclusive access to the ring.
unsafe impl<T: Send> Send for SpinQueue<T> {}
unsafe impl<T: Send> Sync for SpinQueue<T> {}

impl<T> SpinQueue<T> {
    /// Creates a queue holding up to `capacity` elements.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            locked: AtomicBool::new(false),
            ring: UnsafeCell::new(RingState::with_capacity(capacity)),
        }
    }

    fn lock(&self) -> SpinGuard<'_, T> {
        let backoff = Backoff::new();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinGuard { queue: self };
            }
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
    }

    /// Attempts to push; returns the value back if the queue is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        self.lock().push(value)
    }

    /// Attempts to pop; `None` if the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop()
    }

    /// Returns `true` if the queue was observed empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns `true` if the queue was observed full.
    pub fn is_full(&self) -> bool {
        self.lock().is_full()
    }

    /// Returns the number of elements the queue can hold.
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }
}

struct SpinGuard<'a, T> {
    queue: &'a SpinQueue<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = RingState<T>;
    fn deref(&self) -> &RingState<T> {
        // Safety: the flag is held for the guard's lifetime.
        unsafe { &*self.queue.ring.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut RingState<T> {
        // Safety: as above, and the guard is unique.
        unsafe { &mut *self.queue.ring.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.queue.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_and_boundaries() {
        let queue = SpinQueue::with_capacity(2);
        queue.try_push('a').unwrap();
        queue.try_push('b').unwrap();
        assert!(queue.is_full());
        assert_eq!(queue.try_push('c'), Err('c'));
        assert_eq!(queue.try_pop(), Some('a'));
        assert_eq!(queue.try_pop(), Some('b'));
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }
}
