// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Release-health sessions and cron monitor check-ins.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::protocol::{EventId, Map};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Ok,
    Exited,
    Crashed,
    Abnormal,
}

impl SessionStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Ok)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionAttributes {
    pub release: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// A single application session in its current state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub sid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
    /// `true` until the first update of the session was sent.
    pub init: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub status: SessionStatus,
    pub errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub attrs: SessionAttributes,
}

impl Session {
    #[must_use]
    pub fn new(
        release: impl Into<String>,
        environment: Option<String>,
        did: Option<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            sid: Uuid::new_v4(),
            did,
            init: true,
            started: now,
            timestamp: now,
            status: SessionStatus::Ok,
            errors: 0,
            duration: None,
            attrs: SessionAttributes {
                release: release.into(),
                environment,
                ..Default::default()
            },
        }
    }

    /// Counts an error captured during the session.
    ///
    /// An unhandled error crashes the session. Returns `false` once the session ended.
    pub fn record_error(&mut self, crashed: bool) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.errors += 1;
        if crashed {
            self.status = SessionStatus::Crashed;
            self.finalize();
        } else {
            self.timestamp = OffsetDateTime::now_utc();
        }
        true
    }

    /// Ends the session. A crashed or abnormal session keeps its status.
    pub fn close(&mut self, status: SessionStatus) {
        if self.status == SessionStatus::Ok {
            self.status = match status {
                SessionStatus::Ok => SessionStatus::Exited,
                other => other,
            };
        }
        self.finalize();
    }

    fn finalize(&mut self) {
        self.timestamp = OffsetDateTime::now_utc();
        let elapsed = self.timestamp - self.started;
        self.duration = Some(elapsed.as_seconds_f64().max(0.0));
    }

    pub(crate) fn mark_sent(&mut self) {
        self.init = false;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateBucket {
    #[serde(with = "time::serde::rfc3339")]
    pub started: OffsetDateTime,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub exited: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub errored: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub crashed: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub abnormal: u32,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Request-mode sessions counted in one-minute buckets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionAggregates {
    pub aggregates: Vec<AggregateBucket>,
    pub attrs: SessionAttributes,
}

/// Buffers request-mode session outcomes until the next flush.
#[derive(Debug)]
pub struct SessionAggregator {
    attrs: SessionAttributes,
    buckets: Mutex<BTreeMap<i64, AggregateBucket>>,
}

impl SessionAggregator {
    #[must_use]
    pub fn new(release: impl Into<String>, environment: Option<String>) -> Self {
        Self {
            attrs: SessionAttributes {
                release: release.into(),
                environment,
                ..Default::default()
            },
            buckets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Counts one finished request. `errored` is ignored for crashed requests.
    pub fn record(&self, status: SessionStatus, errored: bool) {
        self.record_at(OffsetDateTime::now_utc(), status, errored);
    }

    #[allow(clippy::expect_used)]
    fn record_at(&self, at: OffsetDateTime, status: SessionStatus, errored: bool) {
        let minute = at.unix_timestamp() - at.unix_timestamp().rem_euclid(60);
        let mut buckets = self.buckets.lock().expect("lock poisoned");
        let bucket = buckets.entry(minute).or_insert_with(|| AggregateBucket {
            started: OffsetDateTime::from_unix_timestamp(minute).unwrap_or(at),
            exited: 0,
            errored: 0,
            crashed: 0,
            abnormal: 0,
        });
        match status {
            SessionStatus::Crashed => bucket.crashed += 1,
            SessionStatus::Abnormal => bucket.abnormal += 1,
            SessionStatus::Ok | SessionStatus::Exited if errored => bucket.errored += 1,
            SessionStatus::Ok | SessionStatus::Exited => bucket.exited += 1,
        }
    }

    /// Drains the buffered buckets, `None` when nothing was recorded.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn take(&self) -> Option<SessionAggregates> {
        let buckets = std::mem::take(&mut *self.buckets.lock().expect("lock poisoned"));
        if buckets.is_empty() {
            return None;
        }
        Some(SessionAggregates {
            aggregates: buckets.into_values().collect(),
            attrs: self.attrs.clone(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInStatus {
    InProgress,
    Ok,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorSchedule {
    Crontab { value: String },
    Interval { value: u64, unit: IntervalUnit },
}

impl MonitorSchedule {
    /// A crontab needs five whitespace-separated fields; an interval must be non-zero.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self {
            MonitorSchedule::Crontab { value } => value.split_whitespace().count() == 5,
            MonitorSchedule::Interval { value, .. } => *value > 0,
        }
    }
}

/// Monitor definition sent along with a check-in to create or update the monitor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub schedule: MonitorSchedule,
    /// Minutes after the expected time before a missed check-in is reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkin_margin: Option<u64>,
    /// Minutes an in-progress check-in may run before it is marked as timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_runtime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckIn {
    pub check_in_id: EventId,
    pub monitor_slug: String,
    pub status: CheckInStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_config: Option<MonitorConfig>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub contexts: Map<Value>,
}

impl CheckIn {
    #[must_use]
    pub fn new(monitor_slug: impl Into<String>, status: CheckInStatus) -> Self {
        Self {
            check_in_id: EventId::new(),
            monitor_slug: monitor_slug.into(),
            status,
            duration: None,
            release: None,
            environment: None,
            monitor_config: None,
            contexts: Map::new(),
        }
    }

    /// Follow-up check-in closing the run identified by `check_in_id`.
    #[must_use]
    pub fn finish(&self, status: CheckInStatus, duration: Option<f64>) -> Self {
        Self {
            status,
            duration,
            monitor_config: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_session_error_and_crash() {
        let mut session = Session::new("1.0.0", Some("production".into()), None);
        assert!(session.init);
        assert!(session.record_error(false));
        assert_eq!(session.status, SessionStatus::Ok);
        assert!(session.record_error(true));
        assert_eq!(session.status, SessionStatus::Crashed);
        assert_eq!(session.errors, 2);
        assert!(session.duration.is_some());

        assert!(!session.record_error(false));
        assert_eq!(session.errors, 2);
    }

    #[test]
    fn test_close_keeps_crashed_status() {
        let mut session = Session::new("1.0.0", None, None);
        session.close(SessionStatus::Ok);
        assert_eq!(session.status, SessionStatus::Exited);

        let mut crashed = Session::new("1.0.0", None, None);
        crashed.record_error(true);
        crashed.close(SessionStatus::Exited);
        assert_eq!(crashed.status, SessionStatus::Crashed);
    }

    #[test]
    fn test_session_wire_format() {
        let mut session = Session::new("1.0.0", Some("staging".into()), Some("user-1".into()));
        session.mark_sent();
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["init"], false);
        assert_eq!(value["status"], "ok");
        assert_eq!(value["did"], "user-1");
        assert_eq!(value["attrs"]["release"], "1.0.0");
        assert_eq!(value["attrs"]["environment"], "staging");
        assert!(value["sid"].as_str().unwrap().contains('-'));
    }

    #[test]
    fn test_aggregator_buckets_per_minute() {
        let aggregator = SessionAggregator::new("1.0.0", None);
        assert!(aggregator.take().is_none());

        aggregator.record_at(datetime!(2024-05-01 10:00:05 UTC), SessionStatus::Exited, false);
        aggregator.record_at(datetime!(2024-05-01 10:00:59 UTC), SessionStatus::Ok, true);
        aggregator.record_at(datetime!(2024-05-01 10:01:00 UTC), SessionStatus::Crashed, true);

        let aggregates = aggregator.take().unwrap();
        assert_eq!(aggregates.aggregates.len(), 2);
        let first = &aggregates.aggregates[0];
        assert_eq!(first.started, datetime!(2024-05-01 10:00:00 UTC));
        assert_eq!((first.exited, first.errored, first.crashed), (1, 1, 0));
        assert_eq!(aggregates.aggregates[1].crashed, 1);

        let value = serde_json::to_value(&aggregates).unwrap();
        assert!(value["aggregates"][1].get("exited").is_none());
        assert!(aggregator.take().is_none());
    }

    #[test]
    fn test_check_in_wire_format() {
        let check_in = CheckIn {
            monitor_config: Some(MonitorConfig {
                schedule: MonitorSchedule::Crontab {
                    value: "0 * * * *".into(),
                },
                checkin_margin: Some(5),
                max_runtime: Some(30),
                timezone: Some("UTC".into()),
            }),
            ..CheckIn::new("nightly-backup", CheckInStatus::InProgress)
        };
        let value = serde_json::to_value(&check_in).unwrap();
        assert_eq!(value["status"], "in_progress");
        assert_eq!(value["monitor_slug"], "nightly-backup");
        assert_eq!(value["monitor_config"]["schedule"]["type"], "crontab");
        assert_eq!(value["monitor_config"]["schedule"]["value"], "0 * * * *");
        assert_eq!(value["check_in_id"].as_str().unwrap().len(), 32);

        let done = check_in.finish(CheckInStatus::Ok, Some(12.5));
        assert_eq!(done.check_in_id, check_in.check_in_id);
        assert!(done.monitor_config.is_none());
    }

    #[test]
    fn test_schedule_validation() {
        assert!(MonitorSchedule::Crontab {
            value: "*/5 * * * *".into()
        }
        .is_valid());
        assert!(!MonitorSchedule::Crontab {
            value: "every day".into()
        }
        .is_valid());
        assert!(!MonitorSchedule::Interval {
            value: 0,
            unit: IntervalUnit::Hour
        }
        .is_valid());
        let interval = serde_json::to_value(MonitorSchedule::Interval {
            value: 2,
            unit: IntervalUnit::Hour,
        })
        .unwrap();
        assert_eq!(interval["unit"], "hour");
    }
}
