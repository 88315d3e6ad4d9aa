// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::dsn::Dsn;
use crate::error::ConfigError;
use crate::pipeline::{DEFAULT_MAX_EVENT_BYTES, DEFAULT_MAX_VALUE_LENGTH, DEFAULT_NORMALIZE_DEPTH};
use crate::sampling::{is_valid_rate, TracesSampler};
use crate::scope::DEFAULT_MAX_BREADCRUMBS;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// What happens to a new envelope when the transport queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Reject the incoming envelope.
    #[default]
    DropNewest,
    /// Evict the oldest queued envelope to make room.
    DropOldest,
}

/// Queue, concurrency and retry knobs of the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportOptions {
    /// Maximum number of queued plus in-flight envelopes
    pub max_queue_size: usize,
    pub overflow_policy: OverflowPolicy,
    /// Maximum number of concurrent deliveries
    pub max_concurrent_requests: usize,
    /// Delivery attempts per envelope, including the first one
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Timeout of a single delivery attempt
    pub attempt_timeout: Duration,
    /// Backoff applied to every category on a 429 without usable headers
    pub default_retry_after: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_queue_size: 64,
            overflow_policy: OverflowPolicy::DropNewest,
            max_concurrent_requests: 4,
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(5),
            default_retry_after: Duration::from_secs(60),
        }
    }
}

/// Configuration of a [`crate::Client`].
#[derive(Clone)]
pub struct ClientOptions {
    /// Endpoint descriptor; without one envelopes are accepted and discarded locally
    pub dsn: Option<Dsn>,
    pub release: Option<String>,
    /// Defaults to `production` on events
    pub environment: Option<String>,
    pub server_name: Option<String>,
    pub dist: Option<String>,
    /// Probability of sending an error event
    pub sample_rate: f64,
    /// Probability of sampling a new trace; `None` disables tracing
    pub traces_sample_rate: Option<f64>,
    /// Takes precedence over `traces_sample_rate` when set
    pub traces_sampler: Option<Arc<TracesSampler>>,
    pub max_breadcrumbs: usize,
    pub normalize_depth: usize,
    pub max_value_length: usize,
    pub max_event_bytes: usize,
    pub send_client_reports: bool,
    /// How long [`Client::shutdown`](crate::Client::shutdown) waits for pending envelopes
    pub shutdown_timeout: Duration,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    /// Installs the client's own diagnostics subscriber at `log_level`
    pub debug: bool,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    pub transport: TransportOptions,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("dsn", &self.dsn)
            .field("release", &self.release)
            .field("environment", &self.environment)
            .field("server_name", &self.server_name)
            .field("dist", &self.dist)
            .field("sample_rate", &self.sample_rate)
            .field("traces_sample_rate", &self.traces_sample_rate)
            .field("traces_sampler", &self.traces_sampler.is_some())
            .field("max_breadcrumbs", &self.max_breadcrumbs)
            .field("normalize_depth", &self.normalize_depth)
            .field("max_value_length", &self.max_value_length)
            .field("max_event_bytes", &self.max_event_bytes)
            .field("send_client_reports", &self.send_client_reports)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("https_proxy", &self.https_proxy)
            .field("debug", &self.debug)
            .field("log_level", &self.log_level)
            .field("transport", &self.transport)
            .finish()
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dsn: None,
            release: None,
            environment: None,
            server_name: None,
            dist: None,
            sample_rate: 1.0,
            traces_sample_rate: None,
            traces_sampler: None,
            max_breadcrumbs: DEFAULT_MAX_BREADCRUMBS,
            normalize_depth: DEFAULT_NORMALIZE_DEPTH,
            max_value_length: DEFAULT_MAX_VALUE_LENGTH,
            max_event_bytes: DEFAULT_MAX_EVENT_BYTES,
            send_client_reports: true,
            shutdown_timeout: Duration::from_secs(2),
            https_proxy: None,
            debug: false,
            log_level: "info".to_string(),
            transport: TransportOptions::default(),
        }
    }
}

impl ClientOptions {
    /// Create options from `MONITOR_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let dsn = non_empty("MONITOR_DSN").map(|v| v.parse::<Dsn>()).transpose()?;
        let sample_rate = match non_empty("MONITOR_SAMPLE_RATE") {
            Some(value) => parse_rate("MONITOR_SAMPLE_RATE", &value)?,
            None => defaults.sample_rate,
        };
        let traces_sample_rate = non_empty("MONITOR_TRACES_SAMPLE_RATE")
            .map(|value| parse_rate("MONITOR_TRACES_SAMPLE_RATE", &value))
            .transpose()?;
        let max_breadcrumbs = non_empty("MONITOR_MAX_BREADCRUMBS")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(defaults.max_breadcrumbs);
        let debug = non_empty("MONITOR_DEBUG")
            .map(|val| matches!(val.to_lowercase().as_str(), "true" | "1"))
            .unwrap_or(defaults.debug);
        let https_proxy = non_empty("MONITOR_PROXY_HTTPS").or_else(|| non_empty("HTTPS_PROXY"));
        let log_level = non_empty("MONITOR_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level.clone());

        let options = Self {
            dsn,
            release: non_empty("MONITOR_RELEASE"),
            environment: non_empty("MONITOR_ENVIRONMENT"),
            server_name: non_empty("MONITOR_SERVER_NAME"),
            sample_rate,
            traces_sample_rate,
            max_breadcrumbs,
            debug,
            https_proxy,
            log_level,
            ..defaults
        };

        options.validate()?;
        Ok(options)
    }

    /// Validate the options
    /// Filter of the diagnostics logger to install, `None` unless `debug` is set.
    #[must_use]
    pub fn diagnostics_filter(&self) -> Option<&str> {
        self.debug.then_some(self.log_level.as_str())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_rate(self.sample_rate) {
            return Err(ConfigError::InvalidConfig(format!(
                "sample_rate must be within [0, 1], got {}",
                self.sample_rate
            )));
        }
        if let Some(rate) = self.traces_sample_rate.filter(|r| !is_valid_rate(*r)) {
            return Err(ConfigError::InvalidConfig(format!(
                "traces_sample_rate must be within [0, 1], got {rate}"
            )));
        }
        if self.transport.max_queue_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_queue_size must be greater than 0".to_string(),
            ));
        }
        if self.transport.max_concurrent_requests == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_concurrent_requests must be greater than 0".to_string(),
            ));
        }
        if self.transport.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_attempts must be greater than 0".to_string(),
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        Ok(())
    }
}

fn parse_rate(key: &str, value: &str) -> Result<f64, ConfigError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| ConfigError::InvalidConfig(format!("{key} is not a number: {value}")))
}
