// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-category rate limits reported by the ingestion endpoint.
//!
//! The `X-Monitor-Rate-Limits` header is a comma separated list of
//! `retry_after:categories:scope[:reason]` entries, where `categories` is a `;`
//! separated list and an empty list applies to every category.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::outcomes::DataCategory;

pub const RATE_LIMITS_HEADER: &str = "x-monitor-rate-limits";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Longest back-off honored for a single limit; larger server values are clamped.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Deadlines until which categories, or everything, must not be sent.
#[derive(Clone, Debug, Default)]
pub struct RateLimits {
    all: Option<Instant>,
    categories: HashMap<DataCategory, Instant>,
}

impl RateLimits {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_limited(&self, category: DataCategory, now: Instant) -> bool {
        if self.all.is_some_and(|until| until > now) {
            return true;
        }
        self.categories.get(&category).is_some_and(|until| *until > now)
    }

    /// Earliest time at which `category` may be sent again.
    #[must_use]
    pub fn limited_until(&self, category: DataCategory, now: Instant) -> Option<Instant> {
        let all = self.all.filter(|until| *until > now);
        let own = self.categories.get(&category).copied().filter(|until| *until > now);
        all.max(own)
    }

    /// Applies the limits carried by a response.
    ///
    /// Returns `true` when any limit was added or extended.
    pub fn update_from_response(
        &mut self,
        status: u16,
        rate_limits: Option<&str>,
        retry_after: Option<&str>,
        default_retry_after: Duration,
        now: Instant,
    ) -> bool {
        if let Some(header) = rate_limits.filter(|h| !h.trim().is_empty()) {
            return self.apply_header(header, default_retry_after, now);
        }
        if status == 429 || status == 529 {
            let delay = retry_after
                .and_then(parse_retry_after)
                .unwrap_or(default_retry_after);
            debug!("Rate limited without category header, backing off for {delay:?}");
            let Some(until) = deadline(now, delay, default_retry_after) else {
                return false;
            };
            return self.extend_all(until);
        }
        false
    }

    fn apply_header(&mut self, header: &str, default_retry_after: Duration, now: Instant) -> bool {
        let mut changed = false;
        for entry in header.split(',') {
            let mut parts = entry.trim().split(':');
            let Some(seconds) = parts.next().and_then(parse_retry_after) else {
                debug!("Ignoring malformed rate limit entry {entry:?}");
                continue;
            };
            let Some(until) = deadline(now, seconds, default_retry_after) else {
                continue;
            };
            let categories = parts.next().unwrap_or_default();
            if categories.trim().is_empty() {
                changed |= self.extend_all(until);
                continue;
            }
            for name in categories.split(';') {
                // Categories this client never sends are skipped.
                if let Some(category) = DataCategory::from_header_name(name.trim()) {
                    changed |= self.extend(category, until);
                }
            }
        }
        changed
    }

    fn extend_all(&mut self, until: Instant) -> bool {
        if self.all.is_some_and(|current| current >= until) {
            return false;
        }
        self.all = Some(until);
        true
    }

    fn extend(&mut self, category: DataCategory, until: Instant) -> bool {
        match self.categories.get_mut(&category) {
            Some(current) if *current >= until => false,
            Some(current) => {
                *current = until;
                true
            }
            None => {
                self.categories.insert(category, until);
                true
            }
        }
    }
}

/// Parses a delay in seconds, clamped to [`MAX_RETRY_AFTER`].
fn parse_retry_after(value: &str) -> Option<Duration> {
    let seconds = value.trim().parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let seconds = seconds.ceil().min(MAX_RETRY_AFTER.as_secs_f64());
    Duration::try_from_secs_f64(seconds).ok()
}

/// `now + delay`, or `now + fallback` when the clock cannot represent it.
fn deadline(now: Instant, delay: Duration, fallback: Duration) -> Option<Instant> {
    now.checked_add(delay).or_else(|| now.checked_add(fallback))
}
