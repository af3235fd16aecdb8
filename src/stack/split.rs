//! A Treiber stack reclaiming nodes through split reference counting.
//!
//! The head is a single machine word packing a node pointer together with an
//! *outer* count of threads that have read this head value and are racing to
//! claim it. Each node additionally carries an *inner* count that absorbs
//! the corrections once the race is settled: the winner adds
//! `outer - 2` (its own claim plus the baseline), every loser subtracts one,
//! and whichever adjustment brings the sum to zero frees the node. There is
//! no shared table and no global epoch, only counter arithmetic.
//!
//! The original formulation keeps pointer and counter in a double-width
//! atomic. Here nodes are over-aligned to 128 bytes instead, so the low
//! [`COUNT_BITS`] bits of the word hold the counter and a plain
//! single-word CAS updates both halves together. The trade-off is a bound
//! of 126 threads simultaneously claiming one head value (debug-asserted);
//! links store packed words too, so a head value that gets covered by a push
//! and later re-exposed resumes its count.

use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use crate::cache_padded::CachePadded;
use crate::stack::Stack;

/// Low bits of the head word reserved for the outer count.
pub(crate) const COUNT_BITS: u32 = 7;
const COUNT_MASK: usize = (1 << COUNT_BITS) - 1;

#[repr(align(128))] // keeps the low COUNT_BITS of every node address zero
struct SplitNode<T> {
    value: ManuallyDrop<T>,
    inner: AtomicIsize,
    /// Packed word of the head value this node was pushed in front of.
    next: usize,
}

const _: () = assert!(std::mem::align_of::<SplitNode<()>>() >= 1 << COUNT_BITS);

fn pack<T>(node: *mut SplitNode<T>, count: usize) -> usize {
    debug_assert!(count <= COUNT_MASK, "outer count overflows the pointer bits");
    debug_assert_eq!(node as usize & COUNT_MASK, 0);
    node as usize | count
}

fn unpack<T>(word: usize) -> (*mut SplitNode<T>, usize) {
    ((word & !COUNT_MASK) as *mut SplitNode<T>, word & COUNT_MASK)
}

/// Lock-free stack with split (outer + inner) reference counting.
pub struct SplitRefStack<T> {
    head: CachePadded<AtomicUsize>,
    len: AtomicUsize,
    _owns: PhantomData<T>,
}

// Safety: the stack hands each value to exactly one consumer.
unsafe impl<T: Send> Send for SplitRefStack<T> {}
unsafe impl<T: Send> Sync for SplitRefStack<T> {}

impl<T> SplitRefStack<T> {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self {
            // Empty head: null pointer, baseline count of one.
            head: CachePadded::new(AtomicUsize::new(pack::<T>(ptr::null_mut(), 1))),
            len: AtomicUsize::new(0),
            _owns: PhantomData,
        }
    }

    /// Pushes a value onto the stack.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(SplitNode {
            value: ManuallyDrop::new(value),
            inner: AtomicIsize::new(0),
            next: 0,
        }));
        let new_head = pack(node, 1);
        let mut cur = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: the node is not yet published, we are its only writer.
            unsafe { (*node).next = cur };
            match self
                .head
                .compare_exchange_weak(cur, new_head, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(w) => cur = w,
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Pops the most recently pushed value.
    pub fn pop(&self) -> Option<T> {
        let mut cur = self.head.load(Ordering::Relaxed);
        loop {
            // Declare intent to read the current head by bumping its outer
            // count. An empty head needs no protection, so bail before
            // bumping (the counter must not creep into the pointer bits).
            let claimed = loop {
                let (node, count) = unpack::<T>(cur);
                if node.is_null() {
                    return None;
                }
                debug_assert!(count < COUNT_MASK, "too many concurrent claimants");
                match self.head.compare_exchange_weak(
                    cur,
                    pack(node, count + 1),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break pack(node, count + 1),
                    Err(w) => cur = w,
                }
            };
            let (node, count) = unpack::<T>(claimed);

            // Race to unlink the node we now hold a claim on.
            // Safety: our claim keeps the node alive; `next` was written
            // before the node was published.
            let next = unsafe { (*node).next };
            match self
                .head
                .compare_exchange(claimed, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    // Winner: move the value out, then settle the count for
                    // every other claimant still holding a reference.
                    let value =
                        unsafe { ManuallyDrop::into_inner(ptr::read(&(*node).value)) };
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    let extra = count as isize - 2;
                    // Safety: node stays allocated until the count settles.
                    if unsafe { &(*node).inner }.fetch_add(extra, Ordering::AcqRel) == -extra
                    {
                        unsafe { drop(Box::from_raw(node)) };
                    }
                    return Some(value);
                }
                Err(w) => {
                    // Loser: drop our claim; free the node if we were last.
                    // Safety: as above.
                    if unsafe { &(*node).inner }.fetch_sub(1, Ordering::AcqRel) == 1 {
                        unsafe { drop(Box::from_raw(node)) };
                    }
                    cur = w;
                }
            }
        }
    }

    /// Returns `true` if the stack was observed empty.
    pub fn is_empty(&self) -> bool {
        unpack::<T>(self.head.load(Ordering::Acquire)).0.is_null()
    }

    /// Returns a snapshot of the element count.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }
}

impl<T> Default for SplitRefStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Stack<T> for SplitRefStack<T> {
    fn push(&self, value: T) {
        SplitRefStack::push(self, value);
    }
    fn pop(&self) -> Option<T> {
        SplitRefStack::pop(self)
    }
    fn is_empty(&self) -> bool {
        SplitRefStack::is_empty(self)
    }
    fn len(&self) -> usize {
        SplitRefStack::len(self)
    }
}

impl<T> Drop for SplitRefStack<T> {
    fn drop(&mut self) {
        let (mut cur, _) = unpack::<T>(*self.head.get_mut());
        while !cur.is_null() {
            let (next, _) = unpack::<T>(unsafe { (*cur).next });
            unsafe {
                let mut boxed = Box::from_raw(cur);
                ManuallyDrop::drop(&mut boxed.value);
            }
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_round_trips() {
        let node = Box::into_raw(Box::new(SplitNode {
            value: ManuallyDrop::new(7_u32),
            inner: AtomicIsize::new(0),
            next: 0,
        }));
        for count in [0, 1, 63, COUNT_MASK] {
            let (p, c) = unpack::<u32>(pack(node, count));
            assert_eq!(p, node);
            assert_eq!(c, count);
        }
        unsafe {
            let mut boxed = Box::from_raw(node);
            ManuallyDrop::drop(&mut boxed.value);
        }
    }

    #[test]
    fn lifo_single_thread() {
        let stack = SplitRefStack::new();
        for i in 1..=5 {
            stack.push(i);
        }
        assert_eq!(stack.len(), 5);
        for i in (1..=5).rev() {
            assert_eq!(stack.pop(), Some(i));
        }
        assert_eq!(stack.pop(), None);
        assert!(stack.is_empty());
    }

    #[test]
    fn empty_pops_do_not_disturb_the_head() {
        let stack = SplitRefStack::new();
        for _ in 0..1_000 {
            assert_eq!(stack.pop(), None);
        }
        stack.push("still fine");
        assert_eq!(stack.pop(), Some("still fine"));
    }
}
