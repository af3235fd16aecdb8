use std::thread;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use talus::{
    HazardPointerStack, LockFreeQueue, MutexQueue, RefCountedStack, SpinQueue, SplitRefStack,
    Stack,
};

const OPS: usize = 10_000;

fn bench_stack_uncontended<S: Stack<usize>>(c: &mut Criterion, name: &str, make: fn() -> S) {
    c.bench_function(&format!("{name}_push_pop_uncontended"), |b| {
        b.iter(|| {
            let stack = make();
            for i in 0..OPS {
                stack.push(i);
            }
            while let Some(v) = stack.pop() {
                black_box(v);
            }
        });
    });
}

fn bench_stack_contended<S: Stack<usize> + Sync>(c: &mut Criterion, name: &str, make: fn() -> S) {
    c.bench_function(&format!("{name}_push_pop_contended"), |b| {
        b.iter(|| {
            let stack = make();
            thread::scope(|scope| {
                for t in 0..2 {
                    let stack = &stack;
                    scope.spawn(move || {
                        for i in 0..OPS / 4 {
                            stack.push(t * OPS + i);
                        }
                    });
                }
                for _ in 0..2 {
                    let stack = &stack;
                    scope.spawn(move || {
                        for _ in 0..OPS / 4 {
                            black_box(stack.pop());
                        }
                    });
                }
            });
        });
    });
}

fn stacks(c: &mut Criterion) {
    bench_stack_uncontended(c, "refcount_stack", RefCountedStack::new);
    bench_stack_uncontended(c, "hazard_stack", HazardPointerStack::new);
    bench_stack_uncontended(c, "split_stack", SplitRefStack::new);
    bench_stack_contended(c, "refcount_stack", RefCountedStack::new);
    bench_stack_contended(c, "hazard_stack", HazardPointerStack::new);
    bench_stack_contended(c, "split_stack", SplitRefStack::new);
}

macro_rules! bench_queue {
    ($fn_name:ident, $label:literal, $ty:ident) => {
        fn $fn_name(c: &mut Criterion) {
            c.bench_function(concat!($label, "_push_pop_uncontended"), |b| {
                let queue = $ty::with_capacity(1024);
                b.iter(|| {
                    for i in 0..1024_usize {
                        let _ = queue.try_push(i);
                    }
                    while let Some(v) = queue.try_pop() {
                        black_box(v);
                    }
                });
            });
        }
    };
}

bench_queue!(mutex_queue, "mutex_queue", MutexQueue);
bench_queue!(spin_queue, "spin_queue", SpinQueue);
bench_queue!(lockfree_queue, "lockfree_queue", LockFreeQueue);

criterion_group!(benches, stacks, mutex_queue, spin_queue, lockfree_queue);
criterion_main!(benches);
