//! A Treiber stack reclaiming nodes through hazard pointers.
//!
//! A [`HazardRegistry`] is a fixed table of slots. Before dereferencing the
//! observed head, a popper records its address in the slot it owns; any
//! thread about to free a node first scans the whole table and defers the
//! free while some slot still guards that address. The cost of reclamation
//! is therefore one bounded table scan, with no global participation
//! tracking.
//!
//! Slot lifecycle: a thread claims the first unowned slot the first time it
//! pops against a registry, keeps it for its whole lifetime, and a
//! thread-local drop guard clears it when the thread terminates. The table
//! is the one exhaustible resource here: with all slots owned, a new
//! thread's pop fails with [`RegistryFull`] rather than proceeding without
//! protection.
//!
//! The guard-publish / head-revalidate handshake in `pop` and the
//! unlink / table-scan handshake in reclamation both rely on a single total
//! order, so those accesses are `SeqCst`.

use std::cell::RefCell;
use std::error::Error;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cache_padded::CachePadded;
use crate::stack::{Node, Stack};

/// Default number of slots for [`HazardPointerStack::new`].
pub const DEFAULT_SLOTS: usize = 64;

/// Error: every slot in the hazard registry is owned by a live thread.
///
/// This is fatal for the requesting thread's ability to pop safely; popping
/// without a slot would reintroduce use-after-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryFull;

impl fmt::Display for RegistryFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("hazard registry has no free slot for this thread")
    }
}

impl Error for RegistryFull {}

struct HazardSlot {
    /// 0 = free, otherwise the owning thread's token.
    owner: AtomicU64,
    /// Address the owning thread is currently dereferencing, or null.
    guarded: AtomicPtr<()>,
}

/// A fixed-size table of per-thread hazard slots.
///
/// Constructed once, shared by every stack that hands out an `Arc` to it.
/// The slot count bounds how many threads can be inside `pop` concurrently.
pub struct HazardRegistry {
    slots: Box<[HazardSlot]>,
}

impl HazardRegistry {
    /// Creates a registry with `slots` hazard slots.
    ///
    /// # Panics
    /// Panics if `slots` is zero.
    pub fn new(slots: usize) -> Arc<Self> {
        assert!(slots > 0, "hazard registry needs at least one slot");
        let slots = (0..slots)
            .map(|_| HazardSlot {
                owner: AtomicU64::new(0),
                guarded: AtomicPtr::new(ptr::null_mut()),
            })
            .collect();
        Arc::new(Self { slots })
    }

    /// Returns the number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claims the first free slot for `token`.
    fn claim(&self, token: u64) -> Result<usize, RegistryFull> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .owner
                .compare_exchange(0, token, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                #[cfg(feature = "tracing")]
                tracing::trace!(index, token, "claimed hazard slot");
                return Ok(index);
            }
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(token, capacity = self.capacity(), "hazard registry exhausted");
        Err(RegistryFull)
    }

    fn release(&self, index: usize) {
        let slot = &self.slots[index];
        slot.guarded.store(ptr::null_mut(), Ordering::Release);
        slot.owner.store(0, Ordering::Release);
    }

    fn guard(&self, index: usize, address: *mut ()) {
        self.slots[index].guarded.store(address, Ordering::SeqCst);
    }

    fn clear_guard(&self, index: usize) {
        self.slots[index].guarded.store(ptr::null_mut(), Ordering::SeqCst);
    }

    /// Scans the whole table for a slot guarding `address`.
    fn is_guarded(&self, address: *mut ()) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.guarded.load(Ordering::SeqCst) == address)
    }
}

/// A slot owned by the current thread, released when the thread exits.
struct ClaimedSlot {
    registry: Arc<HazardRegistry>,
    index: usize,
}

impl Drop for ClaimedSlot {
    fn drop(&mut self) {
        self.registry.release(self.index);
    }
}

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Process-unique identity of this thread; 0 is reserved for "free".
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
    /// Slots this thread owns, one per registry it has popped against.
    static CLAIMED: RefCell<Vec<ClaimedSlot>> = const { RefCell::new(Vec::new()) };
}

/// Returns this thread's slot in `registry`, claiming one on first use.
fn slot_for(registry: &Arc<HazardRegistry>) -> Result<usize, RegistryFull> {
    CLAIMED.with(|claimed| {
        let mut claimed = claimed.borrow_mut();
        if let Some(slot) = claimed
            .iter()
            .find(|slot| Arc::ptr_eq(&slot.registry, registry))
        {
            return Ok(slot.index);
        }
        let token = THREAD_TOKEN.with(|token| *token);
        let index = registry.claim(token)?;
        claimed.push(ClaimedSlot {
            registry: Arc::clone(registry),
            index,
        });
        Ok(index)
    })
}

/// Lock-free stack with hazard-pointer reclamation.
pub struct HazardPointerStack<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    deferred: CachePadded<AtomicPtr<Node<T>>>,
    len: AtomicUsize,
    registry: Arc<HazardRegistry>,
}

// Safety: the stack hands each value to exactly one consumer.
unsafe impl<T: Send> Send for HazardPointerStack<T> {}
unsafe impl<T: Send> Sync for HazardPointerStack<T> {}

impl<T> HazardPointerStack<T> {
    /// Creates an empty stack with its own registry of [`DEFAULT_SLOTS`] slots.
    pub fn new() -> Self {
        Self::with_registry(HazardRegistry::new(DEFAULT_SLOTS))
    }

    /// Creates an empty stack backed by `registry`.
    ///
    /// Several stacks may share one registry; threads then claim a single
    /// slot for all of them.
    pub fn with_registry(registry: Arc<HazardRegistry>) -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            deferred: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            len: AtomicUsize::new(0),
            registry,
        }
    }

    /// The registry backing this stack.
    pub fn registry(&self) -> &Arc<HazardRegistry> {
        &self.registry
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
    ///
    /// # Panics
    /// Panics with [`RegistryFull`] if this thread cannot claim a hazard
    /// slot. Use [`HazardPointerStack::try_pop`] to handle that case.
    pub fn pop(&self) -> Option<T> {
        self.try_pop()
            .expect("no free hazard slot for this thread")
    }

    /// Pops the most recently pushed value, surfacing slot exhaustion.
    ///
    /// # Errors
    /// Returns [`RegistryFull`] if this thread has no slot and every slot in
    /// the registry is owned.
    pub fn try_pop(&self) -> Result<Option<T>, RegistryFull> {
        let slot = slot_for(&self.registry)?;

        let node = loop {
            let head = self.head.load(Ordering::SeqCst);
            if head.is_null() {
                self.registry.clear_guard(slot);
                return Ok(None);
            }
            self.registry.guard(slot, head.cast());
            // Revalidate: the node could have been unlinked and freed before
            // our guard became visible to the freeing thread's scan.
            if self.head.load(Ordering::SeqCst) != head {
                continue;
            }
            // Safety: the guard is published and the head still points at
            // the node, so no thread has freed it.
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break head;
            }
        };
        self.registry.clear_guard(slot);

        // Safety: the CAS above made us the unique remover of `node`.
        let value = unsafe { Node::take_value(node) };
        self.len.fetch_sub(1, Ordering::Relaxed);

        if self.registry.is_guarded(node.cast()) {
            self.defer(node);
        } else {
            // Safety: no slot guards the node and it is unreachable.
            unsafe { Node::free(node) };
        }
        self.sweep();
        Ok(Some(value))
    }

    /// Returns `true` if the stack was observed empty.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Returns a snapshot of the element count.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Parks `node` on the deferred-deletion chain.
    fn defer(&self, node: *mut Node<T>) {
        let mut cur = self.deferred.load(Ordering::SeqCst);
        loop {
            // Safety: the node is unreachable from the head; until the CAS
            // publishes it, we are its only writer.
            unsafe { (*node).next.store(cur, Ordering::Relaxed) };
            match self
                .deferred
                .compare_exchange_weak(cur, node, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(c) => cur = c,
            }
        }
    }

    /// Frees every deferred node that no slot guards any more.
    fn sweep(&self) {
        let mut cur = self.deferred.swap(ptr::null_mut(), Ordering::SeqCst);
        while !cur.is_null() {
            // Safety: the chain was detached atomically, we own its links.
            let next = unsafe { (*cur).next.load(Ordering::Relaxed) };
            if self.registry.is_guarded(cur.cast()) {
                self.defer(cur);
            } else {
                // Safety: unguarded and unreachable.
                unsafe { Node::free(cur) };
            }
            cur = next;
        }
    }
}

impl<T> Default for HazardPointerStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Stack<T> for HazardPointerStack<T> {
    fn push(&self, value: T) {
        HazardPointerStack::push(self, value);
    }
    fn pop(&self) -> Option<T> {
        HazardPointerStack::pop(self)
    }
    fn is_empty(&self) -> bool {
        HazardPointerStack::is_empty(self)
    }
    fn len(&self) -> usize {
        HazardPointerStack::len(self)
    }
}

impl<T> Drop for HazardPointerStack<T> {
    fn drop(&mut self) {
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
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn lifo_single_thread() {
        let stack = HazardPointerStack::new();
        for i in 1..=5 {
            stack.push(i);
        }
        for i in (1..=5).rev() {
            assert_eq!(stack.pop(), Some(i));
        }
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn registry_reports_capacity() {
        let registry = HazardRegistry::new(3);
        assert_eq!(registry.capacity(), 3);
    }

    #[test]
    fn slot_persists_across_pops() {
        // One slot is enough for any number of pops by one thread.
        let stack = HazardPointerStack::with_registry(HazardRegistry::new(1));
        stack.push(1);
        stack.push(2);
        assert_eq!(stack.try_pop().unwrap(), Some(2));
        assert_eq!(stack.try_pop().unwrap(), Some(1));
        assert_eq!(stack.try_pop().unwrap(), None);
    }

    #[test]
    fn exhausted_registry_is_an_error() {
        let stack = HazardPointerStack::with_registry(HazardRegistry::new(1));
        stack.push(1);

        let owner_claimed = Barrier::new(2);
        let probe_done = Barrier::new(2);
        thread::scope(|scope| {
            scope.spawn(|| {
                // Claim the only slot, then stay alive while the probe runs.
                assert_eq!(stack.try_pop().unwrap(), Some(1));
                owner_claimed.wait();
                probe_done.wait();
            });
            scope.spawn(|| {
                owner_claimed.wait();
                assert_eq!(stack.try_pop(), Err(RegistryFull));
                probe_done.wait();
            });
        });
    }

    #[test]
    fn slot_released_on_thread_exit() {
        let stack = HazardPointerStack::with_registry(HazardRegistry::new(1));
        stack.push(1);
        thread::scope(|scope| {
            scope.spawn(|| assert_eq!(stack.try_pop().unwrap(), Some(1)));
        });
        // The popping thread is gone; its slot must be claimable again.
        stack.push(2);
        assert_eq!(stack.try_pop().unwrap(), Some(2));
    }
}
