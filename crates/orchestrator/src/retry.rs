#![forbid(unsafe_code)]

//! Bounded, fixed-interval retries for procfs reads that race with process
//! startup.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep between two attempts.
    pub interval: Duration,
    /// No attempt is started after this much time has elapsed.
    pub deadline: Duration,
    /// Upper bound on the number of attempts, if any.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry every `interval` until `deadline` has elapsed.
    pub const fn until(deadline: Duration, interval: Duration) -> Self {
        Self {
            interval,
            deadline,
            max_attempts: None,
        }
    }

    /// Retry at most `attempts` times, `interval` apart.
    pub const fn attempts(attempts: u32, interval: Duration) -> Self {
        Self {
            interval,
            deadline: Duration::MAX,
            max_attempts: Some(attempts),
        }
    }
}

#[derive(Debug)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub elapsed: Duration,
    pub last: E,
}

/// Run `op` until it succeeds or the policy runs out. The operation always
/// runs at least once.
pub fn retry<T, E>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, Exhausted<E>> {
    let start = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let last = match op() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let elapsed = start.elapsed();
        let out_of_attempts = policy.max_attempts.is_some_and(|max| attempts >= max);
        let out_of_time = elapsed.saturating_add(policy.interval) > policy.deadline;
        if out_of_attempts || out_of_time {
            return Err(Exhausted {
                attempts,
                elapsed,
                last,
            });
        }
        std::thread::sleep(policy.interval);
    }
}
