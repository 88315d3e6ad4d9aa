// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Spans, the per-trace state they share, and trace propagation.
//!
//! Every span of a trace started in this process points at one [`TraceState`] holding
//! the root's sampling decision, the lazily created dynamic sampling context, and the
//! finished children waiting for their root to be sent as a transaction.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::Value;
use time::OffsetDateTime;

use crate::protocol::{Map, SpanId, SpanRecord, SpanStatus, TraceContext, TraceId};
use crate::sampling::{generate_sample_rand, DynamicSamplingContext};

/// Header carrying `trace_id-span_id[-sampled]` to downstream services.
pub const TRACE_HEADER: &str = "monitor-trace";

/// W3C baggage header carrying the dynamic sampling context.
pub const BAGGAGE_HEADER: &str = "baggage";

pub(crate) struct TraceState {
    pub(crate) trace_id: TraceId,
    pub(crate) sampled: bool,
    pub(crate) sample_rate: Option<f64>,
    pub(crate) sample_rand: f64,
    pub(crate) root_name: String,
    pub(crate) dsc: OnceLock<Arc<DynamicSamplingContext>>,
    pub(crate) finished: Mutex<Vec<SpanRecord>>,
}

impl TraceState {
    pub(crate) fn new(
        trace_id: TraceId,
        sampled: bool,
        sample_rate: Option<f64>,
        sample_rand: f64,
        root_name: String,
        inherited_dsc: Option<Arc<DynamicSamplingContext>>,
    ) -> Self {
        let dsc = OnceLock::new();
        if let Some(inherited) = inherited_dsc {
            let _ = dsc.set(inherited);
        }
        Self {
            trace_id,
            sampled,
            sample_rate,
            sample_rand,
            root_name,
            dsc,
            finished: Mutex::new(Vec::new()),
        }
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn push_finished(&self, record: SpanRecord) {
        self.finished.lock().expect("lock poisoned").push(record);
    }

    #[allow(clippy::expect_used)]
    pub(crate) fn take_finished(&self) -> Vec<SpanRecord> {
        std::mem::take(&mut *self.finished.lock().expect("lock poisoned"))
    }
}

impl fmt::Debug for TraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceState")
            .field("trace_id", &self.trace_id)
            .field("sampled", &self.sampled)
            .field("sample_rate", &self.sample_rate)
            .field("root_name", &self.root_name)
            .finish_non_exhaustive()
    }
}

/// A unit of timed work.
///
/// The sampling decision is fixed at creation; a span is owned by whoever started it
/// and consumed by `Client::finish_span`.
#[derive(Debug)]
pub struct Span {
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
    name: String,
    op: Option<String>,
    attributes: Map<Value>,
    start_timestamp: OffsetDateTime,
    end_timestamp: Option<OffsetDateTime>,
    status: Option<SpanStatus>,
    sampled: bool,
    segment: bool,
    trace: Arc<TraceState>,
}

impl Span {
    pub(crate) fn new(
        name: String,
        attributes: Map<Value>,
        parent_span_id: Option<SpanId>,
        sampled: bool,
        segment: bool,
        trace: Arc<TraceState>,
    ) -> Self {
        Self {
            span_id: SpanId::random(),
            parent_span_id,
            name,
            op: None,
            attributes,
            start_timestamp: OffsetDateTime::now_utc(),
            end_timestamp: None,
            status: None,
            sampled,
            segment,
            trace,
        }
    }

    #[must_use]
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    #[must_use]
    pub fn trace_id(&self) -> TraceId {
        self.trace.trace_id
    }

    #[must_use]
    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn op(&self) -> Option<&str> {
        self.op.as_deref()
    }

    #[must_use]
    pub fn attributes(&self) -> &Map<Value> {
        &self.attributes
    }

    #[must_use]
    pub fn start_timestamp(&self) -> OffsetDateTime {
        self.start_timestamp
    }

    #[must_use]
    pub fn end_timestamp(&self) -> Option<OffsetDateTime> {
        self.end_timestamp
    }

    #[must_use]
    pub fn status(&self) -> Option<SpanStatus> {
        self.status
    }

    #[must_use]
    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// `true` for the local root of a trace, the span sent as a transaction.
    #[must_use]
    pub fn is_segment(&self) -> bool {
        self.segment
    }

    pub fn set_op(&mut self, op: impl Into<String>) {
        self.op = Some(op.into());
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        self.status = Some(status);
    }

    pub(crate) fn trace(&self) -> &Arc<TraceState> {
        &self.trace
    }

    pub(crate) fn finish(&mut self) {
        if self.end_timestamp.is_none() {
            self.end_timestamp = Some(OffsetDateTime::now_utc());
        }
    }

    pub(crate) fn to_record(&self) -> SpanRecord {
        SpanRecord {
            span_id: self.span_id,
            trace_id: self.trace.trace_id,
            parent_span_id: self.parent_span_id,
            op: self.op.clone(),
            description: self.name.clone(),
            start_timestamp: self.start_timestamp,
            timestamp: self.end_timestamp.unwrap_or_else(OffsetDateTime::now_utc),
            status: self.status,
            data: self.attributes.clone(),
        }
    }

    #[must_use]
    pub fn trace_context(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            op: self.op.clone(),
            status: self.status,
            data: Map::new(),
        }
    }

    /// Value of the [`TRACE_HEADER`] for requests made while this span is active.
    #[must_use]
    pub fn trace_header(&self) -> String {
        format_trace_header(self.trace.trace_id, self.span_id, Some(self.sampled))
    }

    /// Lightweight reference stored on a scope as its active span.
    #[must_use]
    pub fn handle(&self) -> SpanHandle {
        SpanHandle {
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            op: self.op.clone(),
            sampled: self.sampled,
            trace: Arc::clone(&self.trace),
        }
    }
}

/// Reference to a running span, cheap to clone into scopes.
#[derive(Clone, Debug)]
pub struct SpanHandle {
    span_id: SpanId,
    parent_span_id: Option<SpanId>,
    op: Option<String>,
    sampled: bool,
    trace: Arc<TraceState>,
}

impl SpanHandle {
    #[must_use]
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    #[must_use]
    pub fn trace_id(&self) -> TraceId {
        self.trace.trace_id
    }

    #[must_use]
    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Name of the root of the trace this span belongs to.
    #[must_use]
    pub fn root_name(&self) -> &str {
        &self.trace.root_name
    }

    pub(crate) fn trace(&self) -> &Arc<TraceState> {
        &self.trace
    }

    #[must_use]
    pub fn trace_context(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            op: self.op.clone(),
            status: None,
            data: Map::new(),
        }
    }

    #[must_use]
    pub fn trace_header(&self) -> String {
        format_trace_header(self.trace.trace_id, self.span_id, Some(self.sampled))
    }
}

/// Trace identity used when no span is active, continued from upstream when available.
#[derive(Clone, Debug)]
pub struct PropagationContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub sampled: Option<bool>,
    pub sample_rand: f64,
    pub dsc: Option<Arc<DynamicSamplingContext>>,
}

impl Default for PropagationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PropagationContext {
    /// Starts a fresh trace.
    #[must_use]
    pub fn new() -> Self {
        Self {
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            parent_span_id: None,
            sampled: None,
            sample_rand: generate_sample_rand(),
            dsc: None,
        }
    }

    /// Continues the trace described by incoming [`TRACE_HEADER`] and `baggage` values.
    ///
    /// Falls back to a fresh trace when the trace header is missing or malformed.
    #[must_use]
    pub fn from_headers(trace_header: Option<&str>, baggage: Option<&str>) -> Self {
        let Some((trace_id, parent_span_id, sampled)) = trace_header.and_then(parse_trace_header)
        else {
            return Self::new();
        };
        let dsc = baggage.and_then(DynamicSamplingContext::from_baggage);
        let sample_rand = dsc
            .as_ref()
            .and_then(|dsc| dsc.sample_rand)
            .unwrap_or_else(|| {
                derive_sample_rand(sampled, dsc.as_ref().and_then(|dsc| dsc.sample_rate))
            });
        Self {
            trace_id,
            span_id: SpanId::random(),
            parent_span_id: Some(parent_span_id),
            sampled,
            sample_rand,
            dsc: dsc.map(Arc::new),
        }
    }

    #[must_use]
    pub fn trace_context(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            op: None,
            status: None,
            data: Map::new(),
        }
    }

    #[must_use]
    pub fn trace_header(&self) -> String {
        format_trace_header(self.trace_id, self.span_id, self.sampled)
    }
}

/// Draws a `sample_rand` consistent with an upstream decision taken at `sample_rate`.
fn derive_sample_rand(sampled: Option<bool>, sample_rate: Option<f64>) -> f64 {
    let rand = generate_sample_rand();
    match (sampled, sample_rate) {
        (Some(true), Some(rate)) if rate > 0.0 => rand * rate,
        (Some(false), Some(rate)) if rate < 1.0 => rate + rand * (1.0 - rate),
        _ => rand,
    }
}

#[must_use]
pub fn format_trace_header(trace_id: TraceId, span_id: SpanId, sampled: Option<bool>) -> String {
    match sampled {
        Some(true) => format!("{trace_id}-{span_id}-1"),
        Some(false) => format!("{trace_id}-{span_id}-0"),
        None => format!("{trace_id}-{span_id}"),
    }
}

/// Parses `trace_id-span_id[-sampled]`.
#[must_use]
pub fn parse_trace_header(value: &str) -> Option<(TraceId, SpanId, Option<bool>)> {
    let mut parts = value.trim().split('-');
    let trace_id = parts.next()?.parse().ok()?;
    let span_id = parts.next()?.parse().ok()?;
    let sampled = match parts.next() {
        None => None,
        Some("1") => Some(true),
        Some("0") => Some(false),
        Some(_) => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((trace_id, span_id, sampled))
}
