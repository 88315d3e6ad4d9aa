// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Accounting of data the client decided not to deliver.
//!
//! Every irrecoverable loss (sampling, processors, queue overflow, rate limits,
//! network failures, shutdown) is counted per `(reason, category)` pair. Counts
//! accumulate for inspection and are also buffered until the next client report is
//! taken, at which point the buffer is reset.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

/// Kind of data an envelope item represents, used for rate limits and outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    Error,
    Transaction,
    Span,
    Session,
    Monitor,
    Internal,
}

impl DataCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::Error => "error",
            DataCategory::Transaction => "transaction",
            DataCategory::Span => "span",
            DataCategory::Session => "session",
            DataCategory::Monitor => "monitor",
            DataCategory::Internal => "internal",
        }
    }

    /// Parses a category as named in rate-limit headers.
    ///
    /// `default` is the historical name of the error category.
    #[must_use]
    pub fn from_header_name(name: &str) -> Option<Self> {
        match name {
            "error" | "default" => Some(DataCategory::Error),
            "transaction" => Some(DataCategory::Transaction),
            "span" => Some(DataCategory::Span),
            "session" => Some(DataCategory::Session),
            "monitor" => Some(DataCategory::Monitor),
            "internal" => Some(DataCategory::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why data was dropped, as reported in client reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    QueueOverflow,
    #[serde(rename = "ratelimit_backoff")]
    RateLimitBackoff,
    NetworkError,
    SendError,
    SampleRate,
    EventProcessor,
    InternalSdkError,
    ClientClosed,
}

impl DiscardReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::QueueOverflow => "queue_overflow",
            DiscardReason::RateLimitBackoff => "ratelimit_backoff",
            DiscardReason::NetworkError => "network_error",
            DiscardReason::SendError => "send_error",
            DiscardReason::SampleRate => "sample_rate",
            DiscardReason::EventProcessor => "event_processor",
            DiscardReason::InternalSdkError => "internal_sdk_error",
            DiscardReason::ClientClosed => "client_closed",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardedEvent {
    pub reason: DiscardReason,
    pub category: DataCategory,
    pub quantity: u64,
}

/// Summary of everything dropped since the previous report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientReport {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub discarded_events: Vec<DiscardedEvent>,
}

type Counts = BTreeMap<(DiscardReason, DataCategory), u64>;

#[derive(Debug, Default)]
struct Ledger {
    totals: Counts,
    unreported: Counts,
}

/// Thread-safe dropped-event counter shared by the pipeline and the transport.
#[derive(Debug, Default)]
pub struct Outcomes {
    ledger: Mutex<Ledger>,
}

impl Outcomes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)]
    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().expect("lock poisoned")
    }

    pub fn record_dropped_event(
        &self,
        reason: DiscardReason,
        category: DataCategory,
        quantity: u64,
    ) {
        if quantity == 0 {
            return;
        }
        debug!(
            "Dropped {} {} item(s), reason: {}",
            quantity, category, reason
        );
        let mut ledger = self.ledger();
        *ledger.totals.entry((reason, category)).or_default() += quantity;
        *ledger.unreported.entry((reason, category)).or_default() += quantity;
    }

    /// Total dropped for `(reason, category)` since creation.
    #[must_use]
    pub fn count(&self, reason: DiscardReason, category: DataCategory) -> u64 {
        self.ledger()
            .totals
            .get(&(reason, category))
            .copied()
            .unwrap_or(0)
    }

    /// Total dropped across every reason and category since creation.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.ledger().totals.values().sum()
    }

    /// Drains the unreported counts into a client report, `None` when nothing was dropped.
    #[must_use]
    pub fn take_report(&self) -> Option<ClientReport> {
        let unreported = std::mem::take(&mut self.ledger().unreported);
        if unreported.is_empty() {
            return None;
        }
        let discarded_events = unreported
            .into_iter()
            .map(|((reason, category), quantity)| DiscardedEvent {
                reason,
                category,
                quantity,
            })
            .collect();
        Some(ClientReport {
            timestamp: OffsetDateTime::now_utc(),
            discarded_events,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_count() {
        let outcomes = Outcomes::new();
        outcomes.record_dropped_event(DiscardReason::QueueOverflow, DataCategory::Error, 2);
        outcomes.record_dropped_event(DiscardReason::QueueOverflow, DataCategory::Error, 1);
        outcomes.record_dropped_event(DiscardReason::SampleRate, DataCategory::Transaction, 1);
        outcomes.record_dropped_event(DiscardReason::SendError, DataCategory::Error, 0);

        assert_eq!(outcomes.count(DiscardReason::QueueOverflow, DataCategory::Error), 3);
        assert_eq!(outcomes.count(DiscardReason::SampleRate, DataCategory::Transaction), 1);
        assert_eq!(outcomes.count(DiscardReason::SendError, DataCategory::Error), 0);
        assert_eq!(outcomes.total(), 4);
    }

    #[test]
    fn test_take_report_resets_buffer_but_keeps_totals() {
        let outcomes = Outcomes::new();
        assert!(outcomes.take_report().is_none());

        outcomes.record_dropped_event(DiscardReason::EventProcessor, DataCategory::Error, 1);
        let report = outcomes.take_report().expect("report");
        assert_eq!(
            report.discarded_events,
            vec![DiscardedEvent {
                reason: DiscardReason::EventProcessor,
                category: DataCategory::Error,
                quantity: 1,
            }]
        );

        assert!(outcomes.take_report().is_none());
        assert_eq!(outcomes.count(DiscardReason::EventProcessor, DataCategory::Error), 1);
    }

    #[test]
    fn test_report_wire_names() {
        let report = ClientReport {
            timestamp: OffsetDateTime::UNIX_EPOCH,
            discarded_events: vec![DiscardedEvent {
                reason: DiscardReason::RateLimitBackoff,
                category: DataCategory::Monitor,
                quantity: 5,
            }],
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["discarded_events"][0]["reason"], "ratelimit_backoff");
        assert_eq!(value["discarded_events"][0]["category"], "monitor");
        assert_eq!(value["timestamp"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_category_header_names() {
        assert_eq!(DataCategory::from_header_name("default"), Some(DataCategory::Error));
        assert_eq!(
            DataCategory::from_header_name("transaction"),
            Some(DataCategory::Transaction)
        );
        assert_eq!(DataCategory::from_header_name("profile"), None);
    }
}
