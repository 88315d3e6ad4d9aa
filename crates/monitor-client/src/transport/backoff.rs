// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Exponential retry delay of a single delivery: `base * 2^(attempt-1)`, capped.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempts: 0,
        }
    }

    /// Registers a failed attempt and returns the delay before the next one.
    pub(crate) fn register_failure(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        // Past 2^63 the cap always applies.
        let exponent = self.attempts.saturating_sub(1).min(63) as i32;
        let delay = self.base.as_secs_f64() * 2f64.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}
