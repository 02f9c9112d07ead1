use uthread_harness::scenarios::{self, Options};

fn opts(seed: u64) -> Options {
    Options {
        seed,
        ..Options::default()
    }
}

#[test]
fn ten_thousand_randomized_condvar_rounds() {
    let report = scenarios::condvar_signal(&opts(0xC0FFEE)).unwrap();
    assert_eq!(report.rounds, 10_000);
    assert!(report.passed(), "{:?}", report.first_failure);
}

#[test]
fn no_interleaving_loses_a_wakeup() {
    let report = scenarios::lost_wakeup_enumeration(&Options {
        max_yields: 2,
        ..opts(1)
    })
    .unwrap();
    assert_eq!(report.rounds, 3u64.pow(6));
    assert!(report.passed(), "{:?}", report.first_failure);
}

#[test]
fn contenders_are_granted_in_blocking_order() {
    for seed in [1, 2, 3] {
        let report = scenarios::mutex_fairness(&opts(seed)).unwrap();
        assert_eq!(report.rounds, 16);
        assert!(report.passed(), "seed {seed}: {:?}", report.first_failure);
        assert!(report.counters.handoffs > 0);
    }
}

#[test]
fn once_initializer_runs_once_under_races() {
    let report = scenarios::once_idempotence(&opts(99)).unwrap();
    assert!(report.passed(), "{:?}", report.first_failure);
}

#[test]
fn same_seed_same_schedule() {
    let small = |seed| Options {
        rounds: 200,
        ..opts(seed)
    };
    let a = scenarios::condvar_signal(&small(5)).unwrap();
    let b = scenarios::condvar_signal(&small(5)).unwrap();
    assert_eq!(a.rounds, b.rounds);
    assert_eq!(a.failures, b.failures);
    assert!(a.passed());
}
