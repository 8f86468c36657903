//! Runtime tuning constants

/// Default fiber stack size in bytes
pub const DEFAULT_STACK_SIZE: usize = 128_000;

/// Maximum readiness events drained per epoll_wait call
pub const MAX_POLL_EVENTS: usize = 256;

/// Upper bound on the reactor's poll timeout in milliseconds
pub const MAX_IDLE_POLL_MS: u64 = 5_000;

/// Nap taken by the base scheduler's idle fiber between queue polls
pub const BASE_IDLE_NAP_MS: u64 = 2;

/// Backward clock steps larger than this are treated as a rollover
pub const ROLLOVER_THRESHOLD_MS: u64 = 60 * 60 * 1000;

/// Sentinel deadline meaning "no timer pending"
pub const NO_TIMER: u64 = u64::MAX;

/// Sentinel timeout meaning "wait forever"
pub const NO_TIMEOUT: u64 = u64::MAX;
