//! Deadline-ordered timers with rollover handling
//!
//! `TimerManager` keeps timers in an ordered set keyed by absolute
//! deadline (milliseconds on a monotonic scale) with an identity
//! tie-break, so equal deadlines never lose entries. Whoever owns the
//! manager registers a front-insertion callback; it fires at most once per
//! poll window and is how the reactor learns its wait deadline shrank.

use crate::config::{NO_TIMER, ROLLOVER_THRESHOLD_MS};

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

/// Timer callback; recurring timers invoke it once per period
pub type TimerFn = Arc<dyn Fn() + Send + Sync>;

static TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Source of monotonic milliseconds. The seam exists so tests can drive
/// time by hand, including backward jumps.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

/// Milliseconds elapsed since the clock was created
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// A scheduled callback. Identity is the shared handle returned by the
/// manager; `cancel`, `refresh` and `reset` act through it.
pub struct Timer {
    id: u64,
    /// Period in milliseconds
    ms: Mutex<u64>,
    /// Absolute next-fire time in clock milliseconds
    next: Mutex<u64>,
    recurring: bool,
    /// Cleared on cancellation and after a one-shot fires
    cb: Mutex<Option<TimerFn>>,
    manager: Weak<TimerManager>,
}

impl Timer {
    /// Remove the timer and null its callable. Returns false if already
    /// cancelled or fired; no side effects in that case.
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = manager.inner.write().unwrap();

        let mut cb = self.cb.lock().unwrap();
        if cb.is_none() {
            return false;
        }
        *cb = None;

        let key = (*self.next.lock().unwrap(), self.id);
        inner.timers.remove(&key);
        true
    }

    /// Push the deadline out to now + period. Forward only; never fires
    /// the notification hook.
    pub fn refresh(self: &Arc<Self>) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = manager.inner.write().unwrap();

        if self.cb.lock().unwrap().is_none() {
            return false;
        }

        let mut next = self.next.lock().unwrap();
        if inner.timers.remove(&(*next, self.id)).is_none() {
            return false;
        }
        *next = manager.clock.now_ms() + *self.ms.lock().unwrap();
        inner.timers.insert((*next, self.id), self.clone());
        true
    }

    /// Change the period and recompute the deadline, from now or from the
    /// previous start.
    pub fn reset(self: &Arc<Self>, ms: u64, from_now: bool) -> bool {
        if ms == *self.ms.lock().unwrap() && !from_now {
            return true;
        }
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };

        {
            let mut inner = manager.inner.write().unwrap();

            if self.cb.lock().unwrap().is_none() {
                return false;
            }

            let mut next = self.next.lock().unwrap();
            if inner.timers.remove(&(*next, self.id)).is_none() {
                return false;
            }

            let mut period = self.ms.lock().unwrap();
            let start = if from_now {
                manager.clock.now_ms()
            } else {
                next.saturating_sub(*period)
            };
            *period = ms;
            *next = start + ms;
        }

        // Reinsert through the manager so a new earliest deadline
        // notifies the owner.
        manager.insert(self.clone());
        true
    }
}

struct TimerInner {
    timers: BTreeMap<(u64, u64), Arc<Timer>>,
    /// Last observed clock value, for rollover detection
    previous_ms: u64,
}

/// Time-ordered set of timers with condition timers and clock-rollover
/// handling.
pub struct TimerManager {
    inner: RwLock<TimerInner>,
    clock: Box<dyn Clock>,
    /// Coalesces earliest-changed notifications until the next poll
    tickled: AtomicBool,
    on_front: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Self::with_clock(Box::new(MonotonicClock::new()))
    }

    pub fn with_clock(clock: Box<dyn Clock>) -> Arc<TimerManager> {
        let previous_ms = clock.now_ms();
        Arc::new(TimerManager {
            inner: RwLock::new(TimerInner {
                timers: BTreeMap::new(),
                previous_ms,
            }),
            clock,
            tickled: AtomicBool::new(false),
            on_front: Mutex::new(None),
        })
    }

    /// Install the callback invoked when a newly added timer becomes the
    /// earliest deadline.
    pub fn set_front_notify(&self, f: Box<dyn Fn() + Send + Sync>) {
        *self.on_front.lock().unwrap() = Some(f);
    }

    /// Add a timer firing `ms` milliseconds from now
    pub fn add_timer(self: &Arc<Self>, ms: u64, cb: TimerFn, recurring: bool) -> Arc<Timer> {
        let timer = Arc::new(Timer {
            id: TIMER_ID.fetch_add(1, Ordering::Relaxed),
            ms: Mutex::new(ms),
            next: Mutex::new(self.clock.now_ms() + ms),
            recurring,
            cb: Mutex::new(Some(cb)),
            manager: Arc::downgrade(self),
        });
        self.insert(timer.clone());
        timer
    }

    /// Add a timer whose callback only runs if `cond` is still alive at
    /// fire time. Lets an I/O deadline become a no-op once the operation
    /// it guards has completed and dropped its witness.
    pub fn add_condition_timer(
        self: &Arc<Self>,
        ms: u64,
        cb: TimerFn,
        cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Arc<Timer> {
        let wrapped: TimerFn = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(ms, wrapped, recurring)
    }

    /// Milliseconds until the earliest deadline: 0 if one is already due,
    /// `NO_TIMER` if the set is empty. Re-arms the front notification.
    pub fn next_timer_ms(&self) -> u64 {
        self.tickled.store(false, Ordering::Release);

        let inner = self.inner.read().unwrap();
        match inner.timers.keys().next() {
            None => NO_TIMER,
            Some(&(next, _)) => {
                let now = self.clock.now_ms();
                if now >= next {
                    0
                } else {
                    next - now
                }
            }
        }
    }

    /// Extract the callables of every due timer. Recurring timers are
    /// reinserted at now + period; one-shot timers drop their callable.
    /// A detected clock rollover expires everything.
    pub fn list_expired(&self, cbs: &mut Vec<TimerFn>) {
        let now = self.clock.now_ms();
        let mut inner = self.inner.write().unwrap();

        let rollover = {
            let stepped_back = now < inner.previous_ms.saturating_sub(ROLLOVER_THRESHOLD_MS);
            inner.previous_ms = now;
            stepped_back
        };

        // Reinsertions are applied after the drain; a recurring timer
        // expired by this pass must not be re-selected by it.
        let mut requeue = Vec::new();
        loop {
            let Some((&key, _)) = inner.timers.iter().next() else {
                break;
            };
            if !rollover && key.0 > now {
                break;
            }

            let timer = inner.timers.remove(&key).unwrap();
            if timer.recurring {
                if let Some(cb) = timer.cb.lock().unwrap().clone() {
                    cbs.push(cb);
                }
                let next = now + *timer.ms.lock().unwrap();
                *timer.next.lock().unwrap() = next;
                requeue.push((next, timer));
            } else if let Some(cb) = timer.cb.lock().unwrap().take() {
                cbs.push(cb);
            }
        }
        for (next, timer) in requeue {
            inner.timers.insert((next, timer.id), timer);
        }
    }

    /// True if any timer is scheduled
    pub fn has_timer(&self) -> bool {
        !self.inner.read().unwrap().timers.is_empty()
    }

    fn insert(self: &Arc<Self>, timer: Arc<Timer>) {
        let at_front = {
            let mut inner = self.inner.write().unwrap();
            let key = (*timer.next.lock().unwrap(), timer.id);
            inner.timers.insert(key, timer);

            inner.timers.keys().next() == Some(&key)
                && self
                    .tickled
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
        };

        if at_front {
            if let Some(f) = self.on_front.lock().unwrap().as_ref() {
                f();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Hand-driven clock for deterministic expiry tests
    struct TestClock {
        ms: AtomicU64,
    }

    impl TestClock {
        fn shared(start: u64) -> Arc<TestClock> {
            Arc::new(TestClock { ms: AtomicU64::new(start) })
        }

        fn set(&self, ms: u64) {
            self.ms.store(ms, Ordering::SeqCst);
        }
    }

    impl Clock for Arc<TestClock> {
        fn now_ms(&self) -> u64 {
            self.ms.load(Ordering::SeqCst)
        }
    }

    fn counting_cb(counter: &Arc<AtomicUsize>) -> TimerFn {
        let counter = counter.clone();
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn fire_expired(manager: &Arc<TimerManager>) -> usize {
        let mut cbs = Vec::new();
        manager.list_expired(&mut cbs);
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    #[test]
    fn test_one_shot_fires_once() {
        let clock = TestClock::shared(0);
        let manager = TimerManager::with_clock(Box::new(clock.clone()));
        let fired = Arc::new(AtomicUsize::new(0));

        manager.add_timer(50, counting_cb(&fired), false);
        assert_eq!(manager.next_timer_ms(), 50);

        clock.set(49);
        assert_eq!(fire_expired(&manager), 0);

        clock.set(50);
        assert_eq!(fire_expired(&manager), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!manager.has_timer());

        clock.set(500);
        assert_eq!(fire_expired(&manager), 0);
    }

    #[test]
    fn test_recurring_reinserts() {
        let clock = TestClock::shared(0);
        let manager = TimerManager::with_clock(Box::new(clock.clone()));
        let fired = Arc::new(AtomicUsize::new(0));

        manager.add_timer(50, counting_cb(&fired), true);

        clock.set(60);
        fire_expired(&manager);
        clock.set(115);
        fire_expired(&manager);

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(manager.has_timer());
        // Reinserted relative to the observation time, not the deadline
        assert_eq!(manager.next_timer_ms(), 165 - 115);
    }

    #[test]
    fn test_refresh_pushes_deadline_out() {
        // Recurring 50 ms timer; two firings, refresh at 120, next firing
        // lands no earlier than 170.
        let clock = TestClock::shared(0);
        let manager = TimerManager::with_clock(Box::new(clock.clone()));
        let fired = Arc::new(AtomicUsize::new(0));

        let timer = manager.add_timer(50, counting_cb(&fired), true);

        clock.set(55);
        fire_expired(&manager);
        clock.set(110);
        fire_expired(&manager);
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        clock.set(120);
        assert!(timer.refresh());

        clock.set(169);
        fire_expired(&manager);
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        clock.set(170);
        fire_expired(&manager);
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let clock = TestClock::shared(0);
        let manager = TimerManager::with_clock(Box::new(clock.clone()));
        let fired = Arc::new(AtomicUsize::new(0));

        let timer = manager.add_timer(50, counting_cb(&fired), false);
        assert!(timer.cancel());
        assert!(!timer.cancel());

        clock.set(100);
        assert_eq!(fire_expired(&manager), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_fire_returns_false() {
        let clock = TestClock::shared(0);
        let manager = TimerManager::with_clock(Box::new(clock.clone()));
        let fired = Arc::new(AtomicUsize::new(0));

        let timer = manager.add_timer(10, counting_cb(&fired), false);
        clock.set(10);
        assert_eq!(fire_expired(&manager), 1);
        assert!(!timer.cancel());
    }

    #[test]
    fn test_reset_from_now() {
        let clock = TestClock::shared(0);
        let manager = TimerManager::with_clock(Box::new(clock.clone()));
        let fired = Arc::new(AtomicUsize::new(0));

        let timer = manager.add_timer(100, counting_cb(&fired), false);

        clock.set(80);
        assert!(timer.reset(100, true)); // now due at 180

        clock.set(150);
        assert_eq!(fire_expired(&manager), 0);
        clock.set(180);
        assert_eq!(fire_expired(&manager), 1);
    }

    #[test]
    fn test_reset_keeps_start_when_not_from_now() {
        let clock = TestClock::shared(0);
        let manager = TimerManager::with_clock(Box::new(clock.clone()));
        let fired = Arc::new(AtomicUsize::new(0));

        let timer = manager.add_timer(100, counting_cb(&fired), false);

        clock.set(40);
        // Same start (0), longer period: due at 150
        assert!(timer.reset(150, false));
        assert_eq!(manager.next_timer_ms(), 110);
    }

    #[test]
    fn test_identical_deadlines_all_fire() {
        let clock = TestClock::shared(0);
        let manager = TimerManager::with_clock(Box::new(clock.clone()));
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            manager.add_timer(25, counting_cb(&fired), false);
        }
        clock.set(25);
        assert_eq!(fire_expired(&manager), 8);
    }

    #[test]
    fn test_condition_timer_skips_dead_witness() {
        let clock = TestClock::shared(0);
        let manager = TimerManager::with_clock(Box::new(clock.clone()));
        let fired = Arc::new(AtomicUsize::new(0));

        let witness: Arc<dyn Any + Send + Sync> = Arc::new(());
        manager.add_condition_timer(10, counting_cb(&fired), Arc::downgrade(&witness), false);
        drop(witness);

        clock.set(20);
        // The wrapper is extracted but does nothing.
        assert_eq!(fire_expired(&manager), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_condition_timer_runs_with_live_witness() {
        let clock = TestClock::shared(0);
        let manager = TimerManager::with_clock(Box::new(clock.clone()));
        let fired = Arc::new(AtomicUsize::new(0));

        let witness: Arc<dyn Any + Send + Sync> = Arc::new(());
        manager.add_condition_timer(10, counting_cb(&fired), Arc::downgrade(&witness), false);

        clock.set(20);
        fire_expired(&manager);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(witness);
    }

    #[test]
    fn test_front_notify_coalesced() {
        let clock = TestClock::shared(1_000);
        let manager = TimerManager::with_clock(Box::new(clock.clone()));
        let notified = Arc::new(AtomicUsize::new(0));

        let n = notified.clone();
        manager.set_front_notify(Box::new(move || {
            n.fetch_add(1, Ordering::SeqCst);
        }));

        manager.add_timer(100, Arc::new(|| {}), false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // Earlier head, but the flag is still armed: coalesced.
        manager.add_timer(50, Arc::new(|| {}), false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // A poll re-arms the notification.
        manager.next_timer_ms();
        manager.add_timer(10, Arc::new(|| {}), false);
        assert_eq!(notified.load(Ordering::SeqCst), 2);

        // Not the new head: no notification.
        manager.next_timer_ms();
        manager.add_timer(500, Arc::new(|| {}), false);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rollover_expires_everything() {
        // Clock jumps back two hours: every timer fires; recurring ones
        // are reinserted relative to the new now.
        let start = 3 * 60 * 60 * 1000u64;
        let clock = TestClock::shared(start);
        let manager = TimerManager::with_clock(Box::new(clock.clone()));
        let fired = Arc::new(AtomicUsize::new(0));

        manager.add_timer(60_000, counting_cb(&fired), false);
        manager.add_timer(120_000, counting_cb(&fired), true);

        // Normal poll records the pre-jump observation.
        assert_eq!(fire_expired(&manager), 0);

        let jumped = start - 2 * 60 * 60 * 1000;
        clock.set(jumped);
        assert_eq!(fire_expired(&manager), 2);
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // The recurring timer came back with a deadline at or after now.
        assert!(manager.has_timer());
        assert_eq!(manager.next_timer_ms(), 120_000);
    }

    #[test]
    fn test_small_backward_jitter_is_not_rollover() {
        let clock = TestClock::shared(100_000);
        let manager = TimerManager::with_clock(Box::new(clock.clone()));
        let fired = Arc::new(AtomicUsize::new(0));

        manager.add_timer(60_000, counting_cb(&fired), false);
        assert_eq!(fire_expired(&manager), 0);

        clock.set(99_000); // 1 s backward: tolerated
        assert_eq!(fire_expired(&manager), 0);
        assert!(manager.has_timer());
    }

    #[test]
    fn test_next_timer_ms_empty() {
        let manager = TimerManager::new();
        assert_eq!(manager.next_timer_ms(), NO_TIMER);
    }
}
