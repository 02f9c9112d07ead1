//! Mutex hand-off and condition variable ping-pong.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use uthread_core::{Condvar, Mutex, RuntimeConfig, run_with, spawn, yield_now};

fn in_runtime(f: impl FnOnce() -> Duration) -> Duration {
    run_with(RuntimeConfig::default(), f).expect("runtime")
}

fn bench_uncontended(c: &mut Criterion) {
    c.bench_function("mutex/uncontended", |b| {
        b.iter_custom(|iters| {
            in_runtime(|| {
                let m = Mutex::default();
                let start = Instant::now();
                for _ in 0..iters {
                    m.lock().expect("lock");
                    m.unlock().expect("unlock");
                }
                start.elapsed()
            })
        });
    });
}

/// Every contender yields while holding the lock, so each unlock hands
/// ownership straight to the head of the wait queue.
fn bench_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutex/handoff");
    for contenders in [2usize, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(contenders),
            &contenders,
            |b, &contenders| {
                b.iter_custom(|iters| {
                    in_runtime(|| {
                        let m = Rc::new(Mutex::default());
                        let per = iters.div_ceil(contenders as u64);
                        let start = Instant::now();
                        let handles: Vec<_> = (0..contenders)
                            .map(|_| {
                                let m = Rc::clone(&m);
                                spawn(move || {
                                    for _ in 0..per {
                                        m.lock().expect("lock");
                                        yield_now().expect("yield");
                                        m.unlock().expect("unlock");
                                    }
                                })
                                .expect("spawn")
                            })
                            .collect();
                        for h in handles {
                            h.join().expect("join");
                        }
                        start.elapsed()
                    })
                });
            },
        );
    }
    group.finish();
}

struct Court {
    mutex: Mutex,
    cond: Condvar,
    turn: Cell<u8>,
}

fn play(court: &Court, me: u8, volleys: u64) {
    for _ in 0..volleys {
        court.mutex.lock().expect("lock");
        while court.turn.get() != me {
            court.cond.wait(&court.mutex).expect("wait");
        }
        court.turn.set(1 - me);
        court.cond.signal().expect("signal");
        court.mutex.unlock().expect("unlock");
    }
}

fn bench_ping_pong(c: &mut Criterion) {
    c.bench_function("condvar/ping_pong", |b| {
        b.iter_custom(|iters| {
            in_runtime(|| {
                let court = Rc::new(Court {
                    mutex: Mutex::default(),
                    cond: Condvar::new(),
                    turn: Cell::new(0),
                });
                let other = Rc::clone(&court);
                let start = Instant::now();
                let partner = spawn(move || play(&other, 1, iters)).expect("spawn");
                play(&court, 0, iters);
                partner.join().expect("join");
                start.elapsed()
            })
        });
    });
}

criterion_group!(benches, bench_uncontended, bench_handoff, bench_ping_pong);
criterion_main!(benches);
