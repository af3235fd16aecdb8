//! Bounded queue with CAS-only index updates and a publish index.
//!
//! Reserving a slot (advancing `tail`) and finishing the write into it are
//! two separate steps, so a third index, `committed`, publishes completed
//! writes: a reader never consumes a slot that `tail` has reserved but
//! `committed` has not yet passed. Writers commit strictly in reservation
//! order; each writer advances `committed` from its own reserved index to
//! the successor, spinning until its predecessor has committed.
//!
//! Indices advance monotonically (wrapping at the integer boundary) and are
//! projected onto a power-of-two slot array by masking, which keeps a slow
//! reader's claim CAS from succeeding against a recycled index. Under that
//! projection the ring keeps the usual one-slot-spare discipline: `head ==
//! tail` is empty and `tail - head == capacity` is full.
//!
//! A reader copies the slot *before* claiming it and only assumes ownership
//! of the bytes when its head CAS wins, so a lost race never drops or
//! returns a value the reader does not own.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

use crate::cache_padded::CachePadded;

/// A bounded circular queue with lock-free push and pop.
pub struct LockFreeQueue<T> {
    /// Next index to read.
    head: CachePadded<AtomicUsize>,
    /// Next index to reserve for writing.
    tail: CachePadded<AtomicUsize>,
    /// Index up to which writes are complete and visible to readers.
    committed: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    capacity: usize,
}

// Safety: each value is written by exactly one reserving producer and
// handed to exactly one claiming consumer.
unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> LockFreeQueue<T> {
    /// Creates a queue holding up to `capacity` elements.
    ///
    /// The slot array is rounded up to the next power of two above
    /// `capacity`, leaving at least one slot spare.
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be nonzero");
        let slots = (capacity + 1).next_power_of_two();
        let buf = (0..slots)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            committed: CachePadded::new(AtomicUsize::new(0)),
            slots: buf,
            mask: slots - 1,
            capacity,
        }
    }

    /// Attempts to push; returns the value back if the queue is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            if tail.wrapping_sub(self.head.load(Ordering::Acquire)) >= self.capacity {
                return Err(value);
            }
            match self.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(t) => tail = t,
            }
        }

        // SAFETY: the CAS reserved index `tail` exclusively for us, and the
        // full check keeps producers `capacity` behind unconsumed slots.
        unsafe {
            (*self.slots[tail & self.mask].get()).write(value);
        }

        // Publish. Predecessors commit first, so spin until `committed`
        // reaches our reserved index, then advance it past us.
        let backoff = Backoff::new();
        while self
            .committed
            .compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_err()
        {
            backoff.spin();
        }
        Ok(())
    }

    /// Attempts to pop; `None` if the queue is empty or nothing at the head
    /// has been published yet.
    pub fn try_pop(&self) -> Option<T> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head == self.tail.load(Ordering::Acquire) {
                return None;
            }
            if head == self.committed.load(Ordering::Acquire) {
                // Reserved but not yet published.
                return None;
            }
            // Copy before claiming; only a winning CAS takes ownership of
            // these bytes.
            let value = unsafe { ptr::read(self.slots[head & self.mask].get()) };
            match self.head.compare_exchange_weak(
                head,
                head.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                // SAFETY: we claimed index `head`, which was behind
                // `committed`, so the slot held a completed write.
                Ok(_) => return Some(unsafe { value.assume_init() }),
                Err(h) => head = h,
            }
        }
    }

    /// Returns `true` if the queue was observed empty.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head == tail
    }

    /// Returns `true` if the queue was observed full.
    pub fn is_full(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        tail.wrapping_sub(head) >= self.capacity
    }

    /// Returns the number of elements the queue can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: every reservation has been committed.
        let tail = *self.tail.get_mut();
        debug_assert_eq!(*self.committed.get_mut(), tail);
        let mut head = *self.head.get_mut();
        while head != tail {
            // SAFETY: indices in [head, tail) hold initialized values.
            unsafe {
                (*self.slots[head & self.mask].get()).assume_init_drop();
            }
            head = head.wrapping_add(1);
        }
    }
}
