// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace sampling decisions and the dynamic sampling context.
//!
//! A trace is sampled once, at its root. The root draws a `sample_rand` in `[0, 1)`
//! that travels with the trace (including across services through `baggage`), and the
//! trace is kept when `sample_rand < rate`. Children inherit the root decision.
//!
//! `BeforeSampling` listeners see the candidate decision and may overwrite it, with one
//! exception: a child of a sampled-out parent stays sampled-out.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::hooks::{HookEvent, HookRegistry};
use crate::protocol::Map;

/// Prefix of every baggage entry owned by this client.
pub const BAGGAGE_PREFIX: &str = "monitor-";

/// User-provided sampling function returning a rate in `[0, 1]`.
pub type TracesSampler = dyn Fn(&SamplingContext<'_>) -> f64 + Send + Sync;

/// What is known about a span when its sampling decision is taken.
#[derive(Debug, Clone, Copy)]
pub struct SamplingContext<'a> {
    pub span_name: &'a str,
    pub span_attributes: &'a Map<Value>,
    pub parent_sampled: Option<bool>,
    pub parent_context: Option<&'a DynamicSamplingContext>,
    /// Trace-scoped random value the rate is compared against.
    pub sample_rand: f64,
}

/// In/out decision record handed to `BeforeSampling` listeners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingDecision {
    pub sampled: bool,
    pub sample_rate: Option<f64>,
}

/// Draws the trace-scoped random value used for every decision of a trace.
#[must_use]
pub fn generate_sample_rand() -> f64 {
    fastrand::f64()
}

/// `true` when `rate` is a usable probability.
#[must_use]
pub fn is_valid_rate(rate: f64) -> bool {
    (0.0..=1.0).contains(&rate)
}

/// Compares a random value against a rate; invalid rates never sample.
#[must_use]
pub fn sample_by_rate(rate: f64, sample_rand: f64) -> bool {
    if !is_valid_rate(rate) {
        warn!("Ignoring invalid sample rate {}, dropping", rate);
        return false;
    }
    sample_rand < rate
}

#[derive(Clone, Default)]
pub struct Sampler {
    traces_sample_rate: Option<f64>,
    traces_sampler: Option<Arc<TracesSampler>>,
}

impl fmt::Debug for Sampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sampler")
            .field("traces_sample_rate", &self.traces_sample_rate)
            .field("traces_sampler", &self.traces_sampler.is_some())
            .finish()
    }
}

impl Sampler {
    #[must_use]
    pub fn new(
        traces_sample_rate: Option<f64>,
        traces_sampler: Option<Arc<TracesSampler>>,
    ) -> Self {
        Self {
            traces_sample_rate,
            traces_sampler,
        }
    }

    /// `true` when spans can ever be sampled in.
    #[must_use]
    pub fn tracing_enabled(&self) -> bool {
        self.traces_sample_rate.is_some() || self.traces_sampler.is_some()
    }

    /// Decides whether the span described by `context` is recorded.
    pub fn decide(&self, context: &SamplingContext<'_>, hooks: &HookRegistry) -> SamplingDecision {
        let mut decision = self.candidate(context);
        hooks.emit(HookEvent::BeforeSampling(context, &mut decision));

        if context.parent_sampled == Some(false) && decision.sampled {
            debug!(
                "Span {} has a sampled-out parent, ignoring sampled-in override",
                context.span_name
            );
            decision.sampled = false;
        }
        decision
    }

    fn candidate(&self, context: &SamplingContext<'_>) -> SamplingDecision {
        if let Some(parent_sampled) = context.parent_sampled {
            let sample_rate = context
                .parent_context
                .and_then(|dsc| dsc.sample_rate)
                .or(self.traces_sample_rate);
            return SamplingDecision {
                sampled: parent_sampled,
                sample_rate,
            };
        }

        let rate = match (&self.traces_sampler, self.traces_sample_rate) {
            (Some(sampler), _) => sampler(context),
            (None, Some(rate)) => rate,
            (None, None) => {
                return SamplingDecision {
                    sampled: false,
                    sample_rate: None,
                }
            }
        };

        if !is_valid_rate(rate) {
            warn!(
                "Sample rate {} for span {} is outside [0, 1], dropping",
                rate, context.span_name
            );
            return SamplingDecision {
                sampled: false,
                sample_rate: None,
            };
        }

        SamplingDecision {
            sampled: sample_by_rate(rate, context.sample_rand),
            sample_rate: Some(rate),
        }
    }
}

/// Trace-level metadata propagated to downstream services and attached to envelopes.
///
/// Created once per trace root and never modified afterwards.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicSamplingContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rand: Option<f64>,
}

impl DynamicSamplingContext {
    /// Renders the context as `baggage` entries.
    #[must_use]
    pub fn to_baggage(&self) -> String {
        let mut entries = Vec::new();
        let mut push = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                entries.push(format!("{BAGGAGE_PREFIX}{key}={}", escape_baggage(&value)));
            }
        };
        push("trace_id", self.trace_id.clone());
        push("public_key", self.public_key.clone());
        push("release", self.release.clone());
        push("environment", self.environment.clone());
        push("transaction", self.transaction.clone());
        push("sample_rate", self.sample_rate.map(|r| r.to_string()));
        push("sampled", self.sampled.map(|s| s.to_string()));
        // Truncated rather than rounded so the value stays below 1.
        push(
            "sample_rand",
            self.sample_rand
                .map(|r| format!("{:.6}", (r * 1_000_000.0).floor() / 1_000_000.0)),
        );
        entries.join(",")
    }

    /// Parses the entries of a `baggage` header owned by this client.
    ///
    /// Third-party entries are ignored. Returns `None` when no owned entry is present.
    #[must_use]
    pub fn from_baggage(header: &str) -> Option<Self> {
        let mut dsc = Self::default();
        let mut found = false;
        for entry in header.split(',') {
            // Entry properties after ';' are not part of the value.
            let entry = entry.split(';').next().unwrap_or_default().trim();
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            let Some(key) = key.trim().strip_prefix(BAGGAGE_PREFIX) else {
                continue;
            };
            let value = unescape_baggage(value.trim());
            found = true;
            match key {
                "trace_id" => dsc.trace_id = Some(value),
                "public_key" => dsc.public_key = Some(value),
                "release" => dsc.release = Some(value),
                "environment" => dsc.environment = Some(value),
                "transaction" => dsc.transaction = Some(value),
                "sample_rate" => {
                    dsc.sample_rate = value.parse::<f64>().ok().filter(|r| is_valid_rate(*r));
                }
                "sampled" => dsc.sampled = value.parse::<bool>().ok(),
                "sample_rand" => {
                    dsc.sample_rand = value.parse::<f64>().ok().filter(|r| (0.0..1.0).contains(r));
                }
                _ => {}
            }
        }
        found.then_some(dsc)
    }
}

fn escape_baggage(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' | ',' | ';' | '=' | '"' | '\\' => escaped.push_str(&format!("%{:02X}", c as u32)),
            c if c.is_whitespace() || c.is_control() => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    escaped.push_str(&format!("%{byte:02X}"));
                }
            }
            c => escaped.push(c),
        }
    }
    escaped
}

fn unescape_baggage(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let byte = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = byte {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hooks::Listener;
    use proptest::prelude::*;

    fn context<'a>(
        attributes: &'a Map<Value>,
        parent_sampled: Option<bool>,
        sample_rand: f64,
    ) -> SamplingContext<'a> {
        SamplingContext {
            span_name: "GET /health",
            span_attributes: attributes,
            parent_sampled,
            parent_context: None,
            sample_rand,
        }
    }

    #[test]
    fn test_no_rate_means_drop() {
        let hooks = HookRegistry::new();
        let attributes = Map::new();
        let decision = Sampler::default().decide(&context(&attributes, None, 0.0), &hooks);
        assert!(!decision.sampled);
        assert_eq!(decision.sample_rate, None);
    }

    #[test]
    fn test_rate_compared_against_sample_rand() {
        let hooks = HookRegistry::new();
        let attributes = Map::new();
        let sampler = Sampler::new(Some(0.25), None);
        assert!(sampler.decide(&context(&attributes, None, 0.1), &hooks).sampled);
        assert!(!sampler.decide(&context(&attributes, None, 0.25), &hooks).sampled);
        assert!(!sampler.decide(&context(&attributes, None, 0.9), &hooks).sampled);
    }

    #[test]
    fn test_traces_sampler_takes_precedence() {
        let hooks = HookRegistry::new();
        let mut attributes = Map::new();
        attributes.insert("http.route".into(), Value::from("/health"));
        let sampler = Sampler::new(
            Some(1.0),
            Some(Arc::new(|ctx: &SamplingContext<'_>| {
                if ctx.span_attributes.contains_key("http.route") {
                    0.0
                } else {
                    1.0
                }
            })),
        );
        let decision = sampler.decide(&context(&attributes, None, 0.5), &hooks);
        assert!(!decision.sampled);
        assert_eq!(decision.sample_rate, Some(0.0));
    }

    #[test]
    fn test_invalid_rate_drops() {
        let hooks = HookRegistry::new();
        let attributes = Map::new();
        for rate in [f64::NAN, -0.1, 1.5] {
            let sampler = Sampler::new(Some(rate), None);
            assert!(!sampler.decide(&context(&attributes, None, 0.0), &hooks).sampled);
        }
    }

    #[test]
    fn test_parent_decision_is_inherited() {
        let hooks = HookRegistry::new();
        let attributes = Map::new();
        let sampler = Sampler::new(Some(0.0), None);
        assert!(sampler.decide(&context(&attributes, Some(true), 0.9), &hooks).sampled);
        let sampler = Sampler::new(Some(1.0), None);
        assert!(!sampler.decide(&context(&attributes, Some(false), 0.0), &hooks).sampled);
    }

    #[test]
    fn test_listener_override_is_authoritative_for_roots() {
        let hooks = HookRegistry::new();
        hooks.on(Listener::before_sampling(|ctx, decision| {
            if ctx.span_name == "GET /health" {
                decision.sampled = true;
            }
        }));
        let attributes = Map::new();
        let decision =
            Sampler::new(Some(0.0), None).decide(&context(&attributes, None, 0.5), &hooks);
        assert!(decision.sampled);
    }

    #[test]
    fn test_listener_cannot_resurrect_sampled_out_parent() {
        let hooks = HookRegistry::new();
        hooks.on(Listener::before_sampling(|_, decision| decision.sampled = true));
        let attributes = Map::new();
        let decision =
            Sampler::new(Some(1.0), None).decide(&context(&attributes, Some(false), 0.0), &hooks);
        assert!(!decision.sampled);
    }

    #[test]
    fn test_rate_zero_and_one_over_many_trials() {
        let hooks = HookRegistry::new();
        let attributes = Map::new();
        let never = Sampler::new(Some(0.0), None);
        let always = Sampler::new(Some(1.0), None);
        for _ in 0..10_000 {
            let rand = generate_sample_rand();
            assert!(!never.decide(&context(&attributes, None, rand), &hooks).sampled);
            assert!(always.decide(&context(&attributes, None, rand), &hooks).sampled);
        }
    }

    #[test]
    fn test_baggage_round_trip() {
        let dsc = DynamicSamplingContext {
            trace_id: Some("771a43a4192642f0b136d5159a501700".into()),
            public_key: Some("49d0f7386ad645858ae85020e393bef3".into()),
            release: Some("1.0.0".into()),
            environment: Some("production".into()),
            transaction: Some("GET /users, page=2".into()),
            sample_rate: Some(0.5),
            sampled: Some(true),
            sample_rand: Some(0.123_456),
        };
        let baggage = dsc.to_baggage();
        assert!(baggage.contains("monitor-transaction=GET%20/users%2C%20page%3D2"));
        assert_eq!(DynamicSamplingContext::from_baggage(&baggage), Some(dsc));
    }

    #[test]
    fn test_from_baggage_ignores_foreign_entries() {
        let header = "other-vendor=abc, monitor-sampled=false;prop=1 ,monitor-sample_rate=2.0";
        let dsc = DynamicSamplingContext::from_baggage(header).unwrap();
        assert_eq!(dsc.sampled, Some(false));
        assert_eq!(dsc.sample_rate, None);
        assert!(DynamicSamplingContext::from_baggage("other-vendor=abc").is_none());
    }

    proptest! {
        #[test]
        fn prop_children_of_sampled_out_parents_are_sampled_out(
            rate in 0.0f64..=1.0,
            rand in 0.0f64..1.0,
            force in any::<bool>(),
        ) {
            let hooks = HookRegistry::new();
            hooks.on(Listener::before_sampling(move |_, decision| {
                if force {
                    decision.sampled = true;
                }
            }));
            let attributes = Map::new();
            let decision = Sampler::new(Some(rate), None)
                .decide(&context(&attributes, Some(false), rand), &hooks);
            prop_assert!(!decision.sampled);
        }

        #[test]
        fn prop_decision_is_monotonic_in_rate(rate in 0.0f64..=1.0, rand in 0.0f64..1.0) {
            let hooks = HookRegistry::new();
            let attributes = Map::new();
            let decision = Sampler::new(Some(rate), None)
                .decide(&context(&attributes, None, rand), &hooks);
            prop_assert_eq!(decision.sampled, rand < rate);
        }
    }
}
