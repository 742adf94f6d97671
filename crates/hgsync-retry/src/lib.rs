//! Bounded retry helper for hgsync.
//!
//! A deliberately small surface: run a callback up to `tries` times with a
//! fixed delay between failed attempts, logging every failure with the
//! action label, and return the last error when all attempts are spent.
//! Callers must bind any loop-carried arguments into the closure at the
//! call site.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! let mut calls = 0;
//! let value = hgsync_retry::retry_with("counting", 3, Duration::ZERO, || {
//!     calls += 1;
//!     if calls < 2 {
//!         anyhow::bail!("not yet");
//!     }
//!     Ok(calls)
//! })
//! .expect("retry");
//! assert_eq!(value, 2);
//! ```

use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, warn};

/// Default number of attempts.
pub const DEFAULT_TRIES: u32 = 2;

/// Default delay between attempts.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(250);

/// Run `callback` with the default attempt budget (2 tries, 250ms apart).
pub fn retry<T>(action: &str, callback: impl FnMut() -> Result<T>) -> Result<T> {
    retry_with(action, DEFAULT_TRIES, DEFAULT_DELAY, callback)
}

/// Run `callback` up to `tries` times, sleeping `delay` between failures.
///
/// Each failed attempt short of the last logs a warning with the attempt
/// number; the final failure logs an error with the full error chain and is
/// returned to the caller.
pub fn retry_with<T>(
    action: &str,
    tries: u32,
    delay: Duration,
    callback: impl FnMut() -> Result<T>,
) -> Result<T> {
    retry_with_classification(action, tries, delay, |_| false, callback)
}

/// Like [`retry_with`], except that errors `is_permanent` classifies as
/// permanent are returned immediately, without spending the remaining
/// attempt budget.
pub fn retry_with_classification<T>(
    action: &str,
    tries: u32,
    delay: Duration,
    mut is_permanent: impl FnMut(&anyhow::Error) -> bool,
    mut callback: impl FnMut() -> Result<T>,
) -> Result<T> {
    debug!(action, "starting");
    let tries = tries.max(1);

    let mut attempt = 1;
    loop {
        match callback() {
            Ok(value) => return Ok(value),
            Err(err) if is_permanent(&err) => {
                error!(action, attempt, tries, error = ?err, "permanent failure, not retrying");
                return Err(err);
            }
            Err(err) if attempt < tries => {
                warn!(action, attempt, tries, error = %err, "attempt failed, retrying");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(err) => {
                error!(action, attempt, tries, error = ?err, "final attempt failed, aborting");
                return Err(err);
            }
        }
    }
}
