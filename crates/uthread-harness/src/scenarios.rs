//! Scheduling scenarios.
//!
//! Each scenario runs inside a fresh runtime on the calling kernel thread and
//! reports how many of its rounds broke an expectation. Waits that should be
//! woken use a generous timeout, so a lost wakeup shows up as a failed round
//! instead of the runtime aborting on deadlock.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::Serialize;
use uthread_core::trace::{self, Counters};
use uthread_core::{
    Condvar, Mutex, Once, RuntimeConfig, ThreadState, run_with, spawn, state_of, yield_now,
};

use crate::HarnessError;
use crate::rng::XorShift;

/// Longest a signaled waiter may take to wake before the round counts as a
/// lost wakeup.
pub const WAKE_LIMIT: Duration = Duration::from_secs(2);

/// Names accepted by [`run_named`].
pub const SCENARIOS: &[&str] = &["condvar", "interleavings", "fairness", "once"];

#[derive(Debug, Clone)]
pub struct Options {
    pub seed: u64,
    /// Rounds for the randomized condvar scenario.
    pub rounds: u64,
    /// Upper bound on yields injected at each point.
    pub max_yields: u32,
    /// Largest contender count for the fairness sweep.
    pub fairness_max: usize,
    pub trace: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            seed: 0x5EED_0001,
            rounds: 10_000,
            max_yields: 3,
            fairness_max: 16,
            trace: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterDelta {
    pub spawns: u64,
    pub switches: u64,
    pub parks: u64,
    pub handoffs: u64,
    pub violations: u64,
}

impl CounterDelta {
    fn between(before: Counters, after: Counters) -> Self {
        Self {
            spawns: after.spawns.saturating_sub(before.spawns),
            switches: after.switches.saturating_sub(before.switches),
            parks: after.parks.saturating_sub(before.parks),
            handoffs: after.handoffs.saturating_sub(before.handoffs),
            violations: after.violations.saturating_sub(before.violations),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub seed: u64,
    pub rounds: u64,
    pub failures: u64,
    /// First failure, when there was one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<String>,
    pub duration_ms: u64,
    pub counters: CounterDelta,
}

impl ScenarioReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures == 0
    }
}

/// Failure tally shared by the rounds of one scenario.
#[derive(Default)]
struct Tally {
    rounds: u64,
    failures: u64,
    first: Option<String>,
}

impl Tally {
    fn check(&mut self, ok: bool, what: impl FnOnce() -> String) {
        self.rounds += 1;
        if !ok {
            self.failures += 1;
            if self.first.is_none() {
                self.first = Some(what());
            }
        }
    }
}

fn measured(
    name: &str,
    opts: &Options,
    body: impl FnOnce(&mut Tally) -> Result<(), HarnessError>,
) -> Result<ScenarioReport, HarnessError> {
    let config = RuntimeConfig::from_env().with_trace(opts.trace);
    let before = trace::counters();
    let started = Instant::now();
    let mut tally = Tally::default();
    run_with(config, || body(&mut tally))??;
    Ok(ScenarioReport {
        name: name.to_string(),
        seed: opts.seed,
        rounds: tally.rounds,
        failures: tally.failures,
        first_failure: tally.first,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        counters: CounterDelta::between(before, trace::counters()),
    })
}

fn yield_n(n: u32) -> uthread_core::Result<()> {
    for _ in 0..n {
        yield_now()?;
    }
    Ok(())
}

/// Run one scenario by name.
pub fn run_named(name: &str, opts: &Options) -> Result<ScenarioReport, HarnessError> {
    match name {
        "condvar" => condvar_signal(opts),
        "interleavings" => lost_wakeup_enumeration(opts),
        "fairness" => mutex_fairness(opts),
        "once" => once_idempotence(opts),
        other => Err(HarnessError::UnknownScenario(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Condition variable signal
// ---------------------------------------------------------------------------

struct SignalPair {
    mutex: Mutex,
    cond: Condvar,
    ready: Cell<bool>,
    wakes: Cell<u32>,
    timeouts: Cell<u32>,
}

/// What one waiter/signaler round observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalRound {
    pub wakes: u32,
    pub timeouts: u32,
    pub waiter_unlocked: bool,
}

impl SignalRound {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.wakes <= 1 && self.timeouts == 0 && self.waiter_unlocked
    }
}

/// One round: the waiter locks, waits for `ready` and unlocks; the signaler
/// locks, sets `ready`, signals and unlocks. `waiter` and `signaler` give the
/// yields injected at each thread's three scheduling points.
pub fn signal_round(waiter: [u32; 3], signaler: [u32; 3]) -> Result<SignalRound, HarnessError> {
    let pair = Rc::new(SignalPair {
        mutex: Mutex::default(),
        cond: Condvar::new(),
        ready: Cell::new(false),
        wakes: Cell::new(0),
        timeouts: Cell::new(0),
    });

    let p = Rc::clone(&pair);
    let t1 = spawn(move || -> uthread_core::Result<bool> {
        yield_n(waiter[0])?;
        p.mutex.lock()?;
        yield_n(waiter[1])?;
        while !p.ready.get() {
            if p.cond.wait_timeout(&p.mutex, WAKE_LIMIT)? {
                p.timeouts.set(p.timeouts.get() + 1);
            } else {
                p.wakes.set(p.wakes.get() + 1);
            }
        }
        yield_n(waiter[2])?;
        Ok(p.mutex.unlock().is_ok())
    })?;

    let p = Rc::clone(&pair);
    let t2 = spawn(move || -> uthread_core::Result<()> {
        yield_n(signaler[0])?;
        p.mutex.lock()?;
        yield_n(signaler[1])?;
        p.ready.set(true);
        p.cond.signal()?;
        yield_n(signaler[2])?;
        p.mutex.unlock()
    })?;

    let waiter_unlocked = t1.join()??;
    t2.join()??;
    Ok(SignalRound {
        wakes: pair.wakes.get(),
        timeouts: pair.timeouts.get(),
        waiter_unlocked,
    })
}

/// Randomized waiter/signaler rounds.
pub fn condvar_signal(opts: &Options) -> Result<ScenarioReport, HarnessError> {
    measured("condvar", opts, |tally| {
        let mut rng = XorShift::new(opts.seed);
        for round in 0..opts.rounds {
            let waiter = rng.yields::<3>(opts.max_yields);
            let signaler = rng.yields::<3>(opts.max_yields);
            let seen = signal_round(waiter, signaler)?;
            tally.check(seen.ok(), || {
                format!("round {round}: waiter {waiter:?} signaler {signaler:?} saw {seen:?}")
            });
        }
        Ok(())
    })
}

/// Every combination of 0..=`max_yields` yields at the six scheduling points.
pub fn lost_wakeup_enumeration(opts: &Options) -> Result<ScenarioReport, HarnessError> {
    measured("interleavings", opts, |tally| {
        let base = opts.max_yields + 1;
        let total = base.pow(6);
        for code in 0..total {
            let mut c = code;
            let mut digit = || {
                let d = c % base;
                c /= base;
                d
            };
            let waiter = [digit(), digit(), digit()];
            let signaler = [digit(), digit(), digit()];
            let seen = signal_round(waiter, signaler)?;
            tally.check(seen.ok(), || {
                format!("waiter {waiter:?} signaler {signaler:?} saw {seen:?}")
            });
        }
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Mutex fairness
// ---------------------------------------------------------------------------

/// `n` contenders block on a held mutex in a randomized order; ownership must
/// be granted in exactly that order.
pub fn fairness_round(n: usize, rng: &mut XorShift, max_yields: u32) -> Result<bool, HarnessError> {
    let mutex = Rc::new(Mutex::default());
    let blocked = Rc::new(RefCell::new(Vec::with_capacity(n)));
    let granted = Rc::new(RefCell::new(Vec::with_capacity(n)));

    mutex.lock()?;
    let mut handles = Vec::with_capacity(n);
    for i in 0..n {
        let [pre] = rng.fork().yields::<1>(max_yields);
        let (m, b, g) = (Rc::clone(&mutex), Rc::clone(&blocked), Rc::clone(&granted));
        handles.push(spawn(move || -> uthread_core::Result<()> {
            yield_n(pre)?;
            // Nothing switches between the push and parking in `lock`.
            b.borrow_mut().push(i);
            m.lock()?;
            g.borrow_mut().push(i);
            m.unlock()
        })?);
    }

    let deadline = Instant::now() + WAKE_LIMIT;
    loop {
        yield_now()?;
        let parked = handles
            .iter()
            .filter(|h| matches!(state_of(h.id()), Ok(ThreadState::BlockedOnMutex)))
            .count();
        if parked == n {
            break;
        }
        if Instant::now() > deadline {
            mutex.unlock()?;
            for h in handles {
                h.join()??;
            }
            return Ok(false);
        }
    }
    mutex.unlock()?;
    for h in handles {
        h.join()??;
    }
    let ok = *blocked.borrow() == *granted.borrow();
    Ok(ok)
}

/// Fairness for every contender count from 1 to `fairness_max`.
pub fn mutex_fairness(opts: &Options) -> Result<ScenarioReport, HarnessError> {
    measured("fairness", opts, |tally| {
        let mut rng = XorShift::new(opts.seed);
        for n in 1..=opts.fairness_max {
            let ok = fairness_round(n, &mut rng, opts.max_yields)?;
            tally.check(ok, || format!("{n} contenders were not granted in blocking order"));
        }
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Once
// ---------------------------------------------------------------------------

/// Racing callers of one `Once`: the initializer runs once and every caller
/// returns after it finished.
pub fn once_idempotence(opts: &Options) -> Result<ScenarioReport, HarnessError> {
    measured("once", opts, |tally| {
        let mut rng = XorShift::new(opts.seed);
        for round in 0..64u64 {
            let once = Rc::new(Once::new());
            let runs = Rc::new(Cell::new(0u32));
            let callers = 2 + rng.below(7) as usize;
            let mut handles = Vec::with_capacity(callers);
            for _ in 0..callers {
                let [pre, inside] = rng.yields::<2>(opts.max_yields);
                let (once, runs) = (Rc::clone(&once), Rc::clone(&runs));
                handles.push(spawn(move || -> uthread_core::Result<bool> {
                    yield_n(pre)?;
                    once.call_once(|| {
                        // Parked callers must keep waiting while this yields.
                        let _ = yield_n(inside);
                        runs.set(runs.get() + 1);
                    })?;
                    Ok(once.is_completed())
                })?);
            }
            let mut all_saw_done = true;
            for h in handles {
                all_saw_done &= h.join()??;
            }
            let n = runs.get();
            tally.check(n == 1 && all_saw_done, || {
                format!("round {round}: initializer ran {n} times, all done: {all_saw_done}")
            });
        }
        Ok(())
    })
}
