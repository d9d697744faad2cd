//! Blocking across processes: the tick clock and sleep locks.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mpkernel::hosted::MachineConfig;
use mpkernel::sync::SleepLock;

use common::{boot, Log, TIMEOUT};

#[test]
fn sleep_lasts_at_least_the_requested_ticks() {
    let log: Log<Vec<(bool, u64)>> = Log::new();
    let seen = log.clone();
    let config = MachineConfig {
        tick: Some(Duration::from_millis(1)),
        ..MachineConfig::default()
    };
    let machine = boot(config, move |user| {
        for ticks in [0, 1, 5, 20] {
            let start = user.uptime();
            let slept = user.sleep(ticks);
            let elapsed = user.uptime() - start;
            seen.get().push((slept, elapsed));
        }
        user.reap_forever()
    });

    assert!(machine.wait_for(TIMEOUT, |_| log.get().len() == 4));
    for ((slept, elapsed), ticks) in log.snapshot().into_iter().zip([0, 1, 5, 20]) {
        assert!(slept);
        assert!(elapsed >= ticks, "asked for {} ticks, slept {}", ticks, elapsed);
    }
}

#[test]
fn uptime_follows_the_clock() {
    let machine = boot(MachineConfig::default(), |user| user.reap_forever());
    let kernel = machine.kernel();
    let start = kernel.uptime();
    for _ in 0..3 {
        kernel.tick();
    }
    assert_eq!(kernel.uptime(), start + 3);
}

static COUNTER: SleepLock<u64> = SleepLock::new("counter", 0);

#[test]
fn sleep_lock_serializes_holders_that_yield() {
    const CHILDREN: u64 = 4;
    const ROUNDS: u64 = 50;
    let misses = std::sync::Arc::new(AtomicUsize::new(0));
    let log: Log<Option<u64>> = Log::new();
    let (seen, miss) = (log.clone(), misses.clone());
    let config = MachineConfig {
        cores: 3,
        ..MachineConfig::default()
    };
    let machine = boot(config, move |user| {
        for _ in 0..CHILDREN {
            let miss = miss.clone();
            user.fork(move |user| {
                let kernel = user.kernel();
                for _ in 0..ROUNDS {
                    let mut count = COUNTER.lock(kernel);
                    if !COUNTER.holding(kernel) {
                        miss.fetch_add(1, Ordering::SeqCst);
                    }
                    let seen = *count;
                    // Get preempted mid-update; nobody else may get in.
                    user.timer_interrupt();
                    *count = seen + 1;
                }
                if COUNTER.holding(kernel) {
                    miss.fetch_add(1, Ordering::SeqCst);
                }
                user.exit(0)
            });
        }
        for _ in 0..CHILDREN {
            user.wait();
        }
        let total = *COUNTER.lock(user.kernel());
        *seen.get() = Some(total);
        user.reap_forever()
    });

    assert!(machine.wait_for(TIMEOUT, |_| log.get().is_some()));
    assert_eq!(*log.get(), Some(CHILDREN * ROUNDS));
    assert_eq!(misses.load(Ordering::SeqCst), 0);
    assert_eq!(COUNTER.name(), "counter");
}
