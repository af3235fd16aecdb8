//! Bounded queue serialized by one blocking lock.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::queue::RingState;

/// A bounded circular queue guarded by a [`Mutex`].
///
/// Every operation holds the structure lock for its whole duration; waiting
/// threads yield to the scheduler. The simplest of the three variants, and
/// the baseline the others are measured against.
pub struct MutexQueue<T> {
    ring: Mutex<RingState<T>>,
}

impl<T> MutexQueue<T> {
    /// Creates a queue holding up to `capacity` elements.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(RingState::with_capacity(capacity)),
        }
    }

    // A poisoning panic cannot leave the ring half-updated (index moves
    // after the slot write), so a poisoned lock still yields the ring.
    fn ring(&self) -> MutexGuard<'_, RingState<T>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attempts to push; returns the value back if the queue is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        self.ring().push(value)
    }

    /// Attempts to pop; `None` if the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        self.ring().pop()
    }

    /// Returns `true` if the queue was observed empty.
    pub fn is_empty(&self) -> bool {
        self.ring().is_empty()
    }

    /// Returns `true` if the queue was observed full.
    pub fn is_full(&self) -> bool {
        self.ring().is_full()
    }

    /// Returns the number of elements the queue can hold.
    pub fn capacity(&self) -> usize {
        self.ring().capacity()
    }
}
