// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Bounded polling.
//!
//! Everything appkeep waits on, e.g., a service reporting healthy, is polled
//! through a [`RetryPolicy`] so tests can shrink the budget to nothing.

use crate::config::HealthSettings;

use std::{
    thread,
    time::{Duration, Instant},
};
use tracing::debug;

/// Budget for polling a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of checks. Zero still checks once.
    pub attempts: u32,

    /// Pause between failed checks.
    pub interval: Duration,

    /// Overall time budget across all checks.
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Construct new retry policy without overall timeout.
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval,
            timeout: None,
        }
    }

    /// Bound total time spent polling.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Poll condition until it holds or the budget runs out.
    ///
    /// The check receives the one-based attempt number. Returns `true` as soon
    /// as a check passes.
    pub fn poll(&self, mut check: impl FnMut(u32) -> bool) -> bool {
        let started = Instant::now();
        let attempts = self.attempts.max(1);

        for attempt in 1..=attempts {
            if check(attempt) {
                return true;
            }

            if attempt == attempts {
                break;
            }

            // INVARIANT: Never sleep past the overall timeout.
            if let Some(timeout) = self.timeout {
                if started.elapsed() + self.interval > timeout {
                    debug!("retry budget of {timeout:?} exhausted after {attempt} attempts");
                    return false;
                }
            }

            debug!("attempt {attempt}/{attempts} failed, retry in {:?}", self.interval);
            thread::sleep(self.interval);
        }

        false
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&HealthSettings::default())
    }
}

impl From<&HealthSettings> for RetryPolicy {
    fn from(settings: &HealthSettings) -> Self {
        Self {
            attempts: settings.attempts,
            interval: Duration::from_millis(settings.interval_ms),
            timeout: settings.timeout_ms.map(Duration::from_millis),
        }
    }
}
