//! Hooked sleeps park fibers, not worker threads: five one-second
//! sleepers on a four-thread reactor finish in about one second.

use weft_runtime::{syscall, Reactor, ScheduleTask};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn five_fibers_sleep_in_parallel() {
    let _ = env_logger::builder().is_test(true).try_init();

    let reactor = Reactor::new(4, false, "sleepers");
    let done = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    for _ in 0..5 {
        let done = done.clone();
        reactor.schedule(ScheduleTask::call(move || {
            assert_eq!(syscall::sleep(1), 0);
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while done.load(Ordering::SeqCst) < 5 {
        assert!(Instant::now() < deadline, "sleepers did not finish");
        std::thread::sleep(Duration::from_millis(5));
    }
    let elapsed = start.elapsed();
    reactor.stop();

    assert!(elapsed >= Duration::from_secs(1), "woke early: {:?}", elapsed);
    assert!(
        elapsed < Duration::from_millis(1500),
        "sleeps were serialized: {:?}",
        elapsed
    );
}

#[test]
fn usleep_parks_the_fiber() {
    let _ = env_logger::builder().is_test(true).try_init();

    let reactor = Reactor::new(1, false, "usleeper");
    let done = Arc::new(AtomicUsize::new(0));

    // Both fibers share the single worker; sleeping must not occupy it.
    let start = Instant::now();
    for _ in 0..2 {
        let done = done.clone();
        reactor.schedule(ScheduleTask::call(move || {
            assert_eq!(syscall::usleep(200_000), 0);
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }

    let deadline = Instant::now() + Duration::from_secs(3);
    while done.load(Ordering::SeqCst) < 2 {
        assert!(Instant::now() < deadline, "usleep fibers did not finish");
        std::thread::sleep(Duration::from_millis(5));
    }
    let elapsed = start.elapsed();
    reactor.stop();

    assert!(elapsed >= Duration::from_millis(200));
    assert!(
        elapsed < Duration::from_millis(390),
        "sleeps were serialized: {:?}",
        elapsed
    );
}
