//! Context switch and thread lifecycle benchmarks.
//!
//! Criterion drives the timing loop from the kernel thread, so each sample
//! enters a runtime and times the loop from inside it.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use uthread_core::{Builder, RuntimeConfig, run_with, spawn, yield_now};

fn in_runtime(f: impl FnOnce() -> Duration) -> Duration {
    run_with(RuntimeConfig::default(), f).expect("runtime")
}

fn bench_yield(c: &mut Criterion) {
    let mut group = c.benchmark_group("yield");

    group.bench_function("alone", |b| {
        b.iter_custom(|iters| {
            in_runtime(|| {
                let start = Instant::now();
                for _ in 0..iters {
                    yield_now().expect("yield");
                }
                start.elapsed()
            })
        });
    });

    for peers in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("round_robin", peers), &peers, |b, &peers| {
            b.iter_custom(|iters| {
                in_runtime(|| {
                    let stop = Rc::new(Cell::new(false));
                    let handles: Vec<_> = (0..peers)
                        .map(|_| {
                            let stop = Rc::clone(&stop);
                            spawn(move || {
                                while !stop.get() {
                                    yield_now().expect("yield");
                                }
                            })
                            .expect("spawn")
                        })
                        .collect();
                    let start = Instant::now();
                    for _ in 0..iters {
                        yield_now().expect("yield");
                    }
                    let elapsed = start.elapsed();
                    stop.set(true);
                    for h in handles {
                        h.join().expect("join");
                    }
                    elapsed
                })
            });
        });
    }
    group.finish();
}

fn bench_spawn_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_join");
    for stack in [64 * 1024usize, 2 * 1024 * 1024] {
        group.bench_with_input(BenchmarkId::new("stack", stack), &stack, |b, &stack| {
            b.iter_custom(|iters| {
                in_runtime(|| {
                    let start = Instant::now();
                    for i in 0..iters {
                        let h = Builder::new()
                            .stack_size(stack)
                            .spawn(move || criterion::black_box(i))
                            .expect("spawn");
                        criterion::black_box(h.join().expect("join"));
                    }
                    start.elapsed()
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_yield, bench_spawn_join);
criterion_main!(benches);
