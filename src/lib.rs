//! # `talus` - Concurrent Container Primitives
//!
//! A small toolkit of shared-memory container primitives whose hard part is
//! made explicit: safely freeing memory removed from a shared linked
//! structure while other threads may still hold raw references into it.
//!
//! ## What's inside
//!
//! Three lock-free stacks that differ only in reclamation strategy:
//!
//! - [`RefCountedStack`]: a global "threads currently in pop" counter plus a
//!   deferred-deletion chain; nodes are freed at the moment a thread can
//!   prove it is the only popper.
//! - [`HazardPointerStack`]: a fixed [`HazardRegistry`] of per-thread guard
//!   slots; a node is freed only when a full table scan shows no slot
//!   watching it.
//! - [`SplitRefStack`]: an external count packed into the head word itself
//!   plus a per-node internal count; reclamation is settled by atomic
//!   arithmetic with no shared table at all.
//!
//! And three bounded circular queues that share one ring layout and differ
//! only in exclusion strategy: [`MutexQueue`] (blocking lock),
//! [`SpinQueue`] (busy-retry flag), and [`LockFreeQueue`] (two monotone
//! indices plus a committed index that publishes completed writes).
//!
//! ## Guarantees
//!
//! - **Lock-free progress** for the stacks and [`LockFreeQueue`]: a failed
//!   CAS always implies another thread's success. None of them is
//!   wait-free; retry counts are bounded only by contention.
//! - **No observable partial state**: all shared mutation happens through
//!   atomic read-modify-write operations.
//! - **Exactly-once hand-off**: every pushed value is popped at most once,
//!   and dropped exactly once (by its consumer, or by the container's
//!   `Drop`).
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use talus::RefCountedStack;
//!
//! let stack = Arc::new(RefCountedStack::new());
//! std::thread::scope(|s| {
//!     for t in 0..4 {
//!         let stack = Arc::clone(&stack);
//!         s.spawn(move || {
//!             for i in 0..100 {
//!                 stack.push(t * 100 + i);
//!             }
//!         });
//!     }
//! });
//!
//! let mut popped = 0;
//! while stack.pop().is_some() {
//!     popped += 1;
//! }
//! assert_eq!(popped, 400);
//! ```

#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod cache_padded;
pub mod queue;
pub mod stack;

pub use cache_padded::CachePadded;
pub use queue::{LockFreeQueue, MutexQueue, SpinQueue};
pub use stack::{
    HazardPointerStack, HazardRegistry, RefCountedStack, RegistryFull, SplitRefStack, Stack,
};

// Compile-time layout checks for the claims the algorithms depend on.
const _: () = {
    use core::mem;
    use core::sync::atomic::AtomicUsize;

    // The split-reference head updates pointer and counter with one CAS,
    // so the packed word must be exactly one machine word.
    assert!(mem::size_of::<AtomicUsize>() == mem::size_of::<usize>());

    // Padded indices must actually land on separate cache lines.
    assert!(mem::align_of::<CachePadded<AtomicUsize>>() == 128);
    assert!(mem::size_of::<CachePadded<AtomicUsize>>() == 128);
};
