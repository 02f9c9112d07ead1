use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use uthread_core::{
    Condvar, Mutex, MutexKind, Once, ThreadError, cancel, run, spawn, trace, yield_now,
};

#[test]
fn at_most_one_thread_in_the_critical_section() {
    run(|| {
        let m = Rc::new(Mutex::default());
        let inside = Rc::new(Cell::new(0u32));
        let peak = Rc::new(Cell::new(0u32));
        let total = Rc::new(Cell::new(0u32));
        let hs: Vec<_> = (0..8)
            .map(|_| {
                let (m, inside, peak, total) =
                    (Rc::clone(&m), Rc::clone(&inside), Rc::clone(&peak), Rc::clone(&total));
                spawn(move || {
                    for _ in 0..50 {
                        m.lock().unwrap();
                        inside.set(inside.get() + 1);
                        peak.set(peak.get().max(inside.get()));
                        yield_now().unwrap();
                        total.set(total.get() + 1);
                        inside.set(inside.get() - 1);
                        m.unlock().unwrap();
                    }
                })
                .unwrap()
            })
            .collect();
        for h in hs {
            h.join().unwrap();
        }
        assert_eq!(peak.get(), 1);
        assert_eq!(total.get(), 400);
        assert!(!m.is_locked());
    })
    .unwrap();
}

#[test]
fn contended_mutex_is_granted_in_blocking_order() {
    for n in [1usize, 2, 5, 16] {
        let before = trace::counters().handoffs;
        let order = run(|| {
            let m = Rc::new(Mutex::default());
            let order = Rc::new(RefCell::new(Vec::new()));
            m.lock().unwrap();
            let hs: Vec<_> = (0..n)
                .map(|i| {
                    let (m, order) = (Rc::clone(&m), Rc::clone(&order));
                    spawn(move || {
                        m.lock().unwrap();
                        order.borrow_mut().push(i);
                        m.unlock().unwrap();
                    })
                    .unwrap()
                })
                .collect();
            yield_now().unwrap();
            m.unlock().unwrap();
            for h in hs {
                h.join().unwrap();
            }
            Rc::try_unwrap(order).unwrap().into_inner()
        })
        .unwrap();
        assert_eq!(order, (0..n).collect::<Vec<_>>());
        assert!(trace::counters().handoffs >= before + n as u64);
    }
}

#[test]
fn timed_lock_gives_up() {
    run(|| {
        let m = Rc::new(Mutex::new(MutexKind::ErrorCheck));
        m.lock().unwrap();
        let m2 = Rc::clone(&m);
        let h = spawn(move || m2.lock_timeout(Duration::from_millis(5))).unwrap();
        assert_eq!(h.join().unwrap(), Err(ThreadError::TimedOut));
        m.unlock().unwrap();
        assert!(!m.is_locked());
    })
    .unwrap();
}

#[test]
fn unlock_by_non_owner_is_refused() {
    run(|| {
        let m = Rc::new(Mutex::default());
        m.lock().unwrap();
        let m2 = Rc::clone(&m);
        let h = spawn(move || m2.unlock()).unwrap();
        assert_eq!(h.join().unwrap(), Err(ThreadError::NotOwner));
        assert!(m.is_locked());
        m.unlock().unwrap();
    })
    .unwrap();
}

#[test]
fn signaled_waiter_holds_the_mutex_again() {
    run(|| {
        for _ in 0..200 {
            let m = Rc::new(Mutex::default());
            let cv = Rc::new(Condvar::new());
            let ready = Rc::new(Cell::new(false));

            let (m1, cv1, r1) = (Rc::clone(&m), Rc::clone(&cv), Rc::clone(&ready));
            let waiter = spawn(move || {
                m1.lock().unwrap();
                while !r1.get() {
                    cv1.wait(&m1).unwrap();
                }
                m1.unlock()
            })
            .unwrap();

            let (m2, cv2, r2) = (Rc::clone(&m), Rc::clone(&cv), Rc::clone(&ready));
            let signaler = spawn(move || {
                m2.lock().unwrap();
                r2.set(true);
                cv2.signal().unwrap();
                m2.unlock().unwrap();
            })
            .unwrap();

            assert_eq!(waiter.join().unwrap(), Ok(()));
            signaler.join().unwrap();
            assert!(!m.is_locked());
        }
    })
    .unwrap();
}

#[test]
fn broadcast_wakes_every_waiter_in_order() {
    run(|| {
        let m = Rc::new(Mutex::default());
        let cv = Rc::new(Condvar::new());
        let go = Rc::new(Cell::new(false));
        let woke = Rc::new(RefCell::new(Vec::new()));
        let hs: Vec<_> = (0..5)
            .map(|i| {
                let (m, cv, go, woke) = (Rc::clone(&m), Rc::clone(&cv), Rc::clone(&go), Rc::clone(&woke));
                spawn(move || {
                    let g = m.guard().unwrap();
                    while !go.get() {
                        cv.wait_guard(&g).unwrap();
                    }
                    woke.borrow_mut().push(i);
                })
                .unwrap()
            })
            .collect();
        yield_now().unwrap();
        assert_eq!(cv.destroy(), Err(ThreadError::Busy));
        m.lock().unwrap();
        go.set(true);
        cv.broadcast().unwrap();
        m.unlock().unwrap();
        for h in hs {
            h.join().unwrap();
        }
        assert_eq!(*woke.borrow(), vec![0, 1, 2, 3, 4]);
        cv.destroy().unwrap();
    })
    .unwrap();
}

#[test]
fn waiters_must_share_one_mutex() {
    run(|| {
        let m1 = Rc::new(Mutex::default());
        let m2 = Mutex::default();
        let cv = Rc::new(Condvar::new());
        let (wm, wcv) = (Rc::clone(&m1), Rc::clone(&cv));
        let h = spawn(move || {
            wm.lock().unwrap();
            wcv.wait(&wm).unwrap();
            wm.unlock().unwrap();
        })
        .unwrap();
        yield_now().unwrap();
        m2.lock().unwrap();
        assert!(matches!(
            cv.wait_timeout(&m2, Duration::from_millis(1)),
            Err(ThreadError::InvalidArgument(_))
        ));
        m2.unlock().unwrap();
        cv.signal().unwrap();
        h.join().unwrap();
    })
    .unwrap();
}

#[test]
fn canceled_waiter_releases_its_guard() {
    run(|| {
        let m = Rc::new(Mutex::default());
        let cv = Rc::new(Condvar::new());
        let (wm, wcv) = (Rc::clone(&m), Rc::clone(&cv));
        let h = spawn(move || -> () {
            let g = wm.guard().unwrap();
            loop {
                wcv.wait_guard(&g).unwrap();
            }
        })
        .unwrap();
        yield_now().unwrap();
        assert!(!m.is_locked());
        cancel(h.id()).unwrap();
        assert_eq!(h.join().err(), Some(ThreadError::Canceled));
        assert!(!m.is_locked());
        cv.destroy().unwrap();
    })
    .unwrap();
}

#[test]
fn once_runs_its_initializer_exactly_once() {
    run(|| {
        let once = Rc::new(Once::new());
        let runs = Rc::new(Cell::new(0u32));
        let saw_done = Rc::new(Cell::new(0u32));
        let hs: Vec<_> = (0..6)
            .map(|_| {
                let (once, runs, saw_done) = (Rc::clone(&once), Rc::clone(&runs), Rc::clone(&saw_done));
                spawn(move || {
                    once.call_once(|| {
                        runs.set(runs.get() + 1);
                        yield_now().unwrap();
                    })
                    .unwrap();
                    if once.is_completed() {
                        saw_done.set(saw_done.get() + 1);
                    }
                })
                .unwrap()
            })
            .collect();
        for h in hs {
            h.join().unwrap();
        }
        assert_eq!(runs.get(), 1);
        assert_eq!(saw_done.get(), 6);
    })
    .unwrap();
}

#[test]
fn unbounded_timeouts_wait_without_a_deadline() {
    run(|| {
        let m = Rc::new(Mutex::default());
        let cv = Rc::new(Condvar::new());
        let ready = Rc::new(Cell::new(false));
        let (m2, cv2, ready2) = (Rc::clone(&m), Rc::clone(&cv), Rc::clone(&ready));
        let signaler = spawn(move || {
            m2.lock().unwrap();
            ready2.set(true);
            cv2.signal().unwrap();
            m2.unlock().unwrap();
        })
        .unwrap();

        m.lock().unwrap();
        while !ready.get() {
            assert_eq!(cv.wait_timeout(&m, Duration::MAX), Ok(false));
        }
        m.unlock().unwrap();
        signaler.join().unwrap();

        m.lock().unwrap();
        let m3 = Rc::clone(&m);
        let locker = spawn(move || {
            m3.lock_timeout(Duration::MAX).unwrap();
            m3.unlock().unwrap();
        })
        .unwrap();
        yield_now().unwrap();
        m.unlock().unwrap();
        locker.join().unwrap();
    })
    .unwrap();
}
