pub mod action;
pub mod auth;
pub mod auto_arm;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod io;
pub mod machine;
pub mod signal;
pub mod types;

pub use error::{GuardError, Result};
pub use machine::{Guard, GuardSettings};

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Roughly thirty years, the same horizon `tokio::time::sleep` uses for
/// durations too large to add to an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Every lock in this crate guards plain bookkeeping that stays consistent
/// between statements, so a panic elsewhere never leaves it half-written.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `start + duration` without the overflow panic. Configured and
/// user-entered durations can be arbitrarily large.
pub(crate) fn deadline_after(start: Instant, duration: Duration) -> Instant {
    start
        .checked_add(duration)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}
