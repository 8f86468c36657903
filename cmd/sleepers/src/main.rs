//! Parallel sleepers demo
//!
//! Spawns N fibers that each sleep one second through the hooked
//! syscalls. With parking working, wall-clock time stays near one second
//! no matter how many sleepers share the pool.
//!
//! Environment variables:
//! - `WEFT_WORKERS=<n>` - worker threads (default: 4)
//! - `WEFT_SLEEPERS=<n>` - fibers to spawn (default: 5)
//! - `RUST_LOG=debug` - runtime logging

use weft::{syscall, Reactor, ScheduleTask};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn env_get(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn main() {
    env_logger::init();

    let workers = env_get("WEFT_WORKERS", 4);
    let sleepers = env_get("WEFT_SLEEPERS", 5);

    println!("=== weft sleepers ===");
    println!("workers: {}, sleepers: {}", workers, sleepers);

    let reactor = Reactor::new(workers, false, "sleepers");
    let done = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    for i in 0..sleepers {
        let done = done.clone();
        reactor.schedule(ScheduleTask::call(move || {
            log::info!("sleeper {} parks", i);
            syscall::sleep(1);
            log::info!("sleeper {} woke", i);
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }

    while done.load(Ordering::SeqCst) < sleepers {
        std::thread::sleep(Duration::from_millis(10));
    }
    let elapsed = start.elapsed();
    reactor.stop();

    println!(
        "{} sleepers x 1s finished in {:.3}s",
        sleepers,
        elapsed.as_secs_f64()
    );
}
