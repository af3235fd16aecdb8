//! A Treiber stack reclaiming nodes through a global "in pop" counter.
//!
//! Every popper increments a shared counter before touching the head and
//! decrements it on the way out. A removed node may be freed immediately
//! only by a thread that observed itself as the sole popper; every other
//! removal parks the node on a deferred-deletion chain, which the next sole
//! popper drains wholesale.
//!
//! The counter and the head participate in a single total order (`SeqCst`):
//! a node is only ever freed after its unlink is ordered before the
//! "counter == 1" observation, so a later popper that increments the counter
//! can no longer reach it through the head.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::cache_padded::CachePadded;
use crate::stack::{Node, Stack};

/// Lock-free stack with in-pop reference counting.
pub struct RefCountedStack<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    in_pop: CachePadded<AtomicUsize>,
    deferred: CachePadded<AtomicPtr<Node<T>>>,
    len: AtomicUsize,
}

// Safety: the stack hands each value to exactly one consumer.
unsafe impl<T: Send> Send for RefCountedStack<T> {}
unsafe impl<T: Send> Sync for RefCountedStack<T> {}

impl<T> RefCountedStack<T> {
    /// Creates an empty stack.
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            in_pop: CachePadded::new(AtomicUsize::new(0)),
            deferred: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            len: AtomicUsize::new(0),
        }
    }

    /// Pushes a value onto the stack.
    pub fn push(&self, value: T) {
        let node = Node::alloc(value);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: the node is not yet published, we are its only writer.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Pops the most recently pushed value.
    pub fn pop(&self) -> Option<T> {
        self.in_pop.fetch_add(1, Ordering::SeqCst);

        let mut head = self.head.load(Ordering::SeqCst);
        loop {
            if head.is_null() {
                self.in_pop.fetch_sub(1, Ordering::SeqCst);
                return None;
            }
            // Safety: while `in_pop` includes us, no thread frees a node we
            // can still reach through `head` (see module docs).
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(h) => head = h,
            }
        }

        // Safety: the CAS above made us the unique remover of `head`.
        let value = unsafe {
            // Sever the link so deferral treats this as a one-node chain.
            (*head).next.store(ptr::null_mut(), Ordering::Relaxed);
            Node::take_value(head)
        };
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.retire(head);
        Some(value)
    }

    /// Returns `true` if the stack was observed empty.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Returns a snapshot of the element count.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Frees `node` now if we are the sole popper, otherwise defers it.
    fn retire(&self, node: *mut Node<T>) {
        if self.in_pop.load(Ordering::SeqCst) == 1 {
            // Sole popper: claim the whole deferred chain before leaving.
            let chain = self.deferred.swap(ptr::null_mut(), Ordering::SeqCst);
            if self.in_pop.fetch_sub(1, Ordering::SeqCst) == 1 {
                // Still sole at the decrement: nothing can reach the chain.
                unsafe { Self::free_chain(chain) };
            } else if !chain.is_null() {
                // Someone entered meanwhile; park the chain again.
                self.defer_chain(chain);
            }
            // The node itself was unlinked while we were alone, so no other
            // thread ever obtained a reference to it.
            unsafe { Node::free(node) };
        } else {
            self.defer_chain(node);
            self.in_pop.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Links the chain starting at `head` in front of the deferred chain.
    fn defer_chain(&self, head: *mut Node<T>) {
        let mut tail = head;
        // Safety: the chain is private to us until the CAS below publishes it.
        unsafe {
            loop {
                let next = (*tail).next.load(Ordering::Relaxed);
                if next.is_null() {
                    break;
                }
                tail = next;
            }
        }
        let mut cur = self.deferred.load(Ordering::SeqCst);
        loop {
            unsafe { (*tail).next.store(cur, Ordering::Relaxed) };
            match self
                .deferred
                .compare_exchange_weak(cur, head, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(c) => cur = c,
            }
        }
    }

    /// Frees every node on `chain`. Values were taken by their poppers.
    ///
    /// # Safety
    /// No other thread may still hold references into the chain.
    unsafe fn free_chain(chain: *mut Node<T>) {
        #[cfg(feature = "tracing")]
        let mut freed = 0_usize;
        let mut cur = chain;
        while !cur.is_null() {
            let next = (*cur).next.load(Ordering::Relaxed);
            Node::free(cur);
            #[cfg(feature = "tracing")]
            {
                freed += 1;
            }
            cur = next;
        }
        #[cfg(feature = "tracing")]
        if freed > 0 {
            tracing::trace!(freed, "drained deferred-deletion chain");
        }
    }
}

impl<T> Default for RefCountedStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Stack<T> for RefCountedStack<T> {
    fn push(&self, value: T) {
        RefCountedStack::push(self, value);
    }
    fn pop(&self) -> Option<T> {
        RefCountedStack::pop(self)
    }
    fn is_empty(&self) -> bool {
        RefCountedStack::is_empty(self)
    }
    fn len(&self) -> usize {
        RefCountedStack::len(self)
    }
}

impl<T> Drop for RefCountedStack<T> {
    fn drop(&mut self) {
        // Exclusive access: free the live chain including its values, then
        // any deferred remnant left behind by contended final pops.
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            unsafe { Node::free_with_value(cur) };
            cur = next;
        }
        let mut cur = *self.deferred.get_mut();
        while !cur.is_null() {
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            unsafe { Node::free(cur) };
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifo_single_thread() {
        let stack = RefCountedStack::new();
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
    fn pop_empty_then_push() {
        let stack = RefCountedStack::new();
        assert_eq!(stack.pop(), None);
        stack.push("after");
        assert_eq!(stack.pop(), Some("after"));
    }

    #[test]
    fn drop_releases_unpopped_nodes() {
        let stack = RefCountedStack::new();
        for i in 0..64 {
            stack.push(Box::new(i));
        }
        let _ = stack.pop();
        // The rest is released by Drop.
    }
}
