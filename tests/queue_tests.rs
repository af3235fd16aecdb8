use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use talus::{LockFreeQueue, MutexQueue, SpinQueue};

macro_rules! queue_suite {
    ($name:ident, $ty:ident) => {
        mod $name {
            use super::*;

            #[test]
            fn fifo_order() {
                let queue = $ty::with_capacity(8);
                for i in 0..8 {
                    queue.try_push(i).unwrap();
                }
                for i in 0..8 {
                    assert_eq!(queue.try_pop(), Some(i));
                }
                assert_eq!(queue.try_pop(), None);
            }

            #[test]
            fn fullness_boundary() {
                // Exactly `capacity` pushes fit; the next one fails and
                // leaves the queue intact.
                let queue = $ty::with_capacity(5);
                assert_eq!(queue.capacity(), 5);
                for i in 0..5 {
                    queue.try_push(i).unwrap();
                }
                assert!(queue.is_full());
                assert_eq!(queue.try_push(99), Err(99));
                assert_eq!(queue.try_push(99), Err(99));
                for i in 0..5 {
                    assert_eq!(queue.try_pop(), Some(i));
                }
                assert!(queue.is_empty());
            }

            #[test]
            fn empty_boundary() {
                let queue = $ty::with_capacity(2);
                assert_eq!(queue.try_pop(), None);
                queue.try_push('x').unwrap();
                assert_eq!(queue.try_pop(), Some('x'));
                assert_eq!(queue.try_pop(), None);
            }

            #[test]
            fn wraparound_preserves_order() {
                let queue = $ty::with_capacity(3);
                let mut next_in = 0;
                let mut next_out = 0;
                for _ in 0..10 {
                    while queue.try_push(next_in).is_ok() {
                        next_in += 1;
                    }
                    assert_eq!(queue.try_pop(), Some(next_out));
                    next_out += 1;
                }
                while let Some(v) = queue.try_pop() {
                    assert_eq!(v, next_out);
                    next_out += 1;
                }
                assert_eq!(next_in, next_out);
            }

            #[test]
            fn contended_sums_match() {
                const PRODUCERS: u64 = 4;
                const PER_PRODUCER: u64 = 10_000;
                let queue = $ty::with_capacity(16);
                let pushed = AtomicU64::new(0);
                let popped = AtomicU64::new(0);
                let consumed = AtomicU64::new(0);

                thread::scope(|scope| {
                    for t in 0..PRODUCERS {
                        let queue = &queue;
                        let pushed = &pushed;
                        scope.spawn(move || {
                            for i in 0..PER_PRODUCER {
                                let mut item = t * PER_PRODUCER + i;
                                loop {
                                    match queue.try_push(item) {
                                        Ok(()) => break,
                                        Err(back) => {
                                            item = back;
                                            thread::yield_now();
                                        }
                                    }
                                }
                                pushed.fetch_add(item, Ordering::Relaxed);
                            }
                        });
                    }
                    for _ in 0..PRODUCERS {
                        let queue = &queue;
                        let popped = &popped;
                        let consumed = &consumed;
                        scope.spawn(move || {
                            loop {
                                if let Some(v) = queue.try_pop() {
                                    popped.fetch_add(v, Ordering::Relaxed);
                                    consumed.fetch_add(1, Ordering::Relaxed);
                                } else if consumed.load(Ordering::Relaxed)
                                    == PRODUCERS * PER_PRODUCER
                                {
                                    break;
                                } else {
                                    thread::yield_now();
                                }
                            }
                        });
                    }
                });

                assert_eq!(consumed.load(Ordering::Relaxed), PRODUCERS * PER_PRODUCER);
                assert_eq!(
                    pushed.load(Ordering::Relaxed),
                    popped.load(Ordering::Relaxed)
                );
                assert!(queue.is_empty());
            }
        }
    };
}

queue_suite!(mutex, MutexQueue);
queue_suite!(spin, SpinQueue);
queue_suite!(lockfree, LockFreeQueue);
