// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The capture facade tying hooks, scopes, sampling, the event pipeline, envelopes and
//! the transport together.
//!
//! Capturing is synchronous: events are processed and enqueued before the capture call
//! returns. Only [`Client::flush`] and [`Client::close`] wait on delivery.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use crate::config::ClientOptions;
use crate::envelope::{EnvelopeBuilder, Item};
use crate::error::{ClientClosedError, ConfigError, Discard, TransportError};
use crate::hooks::{HookEvent, HookRegistry, Listener};
use crate::logger;
use crate::outcomes::{DataCategory, DiscardReason, Outcomes};
use crate::pipeline::{EventPipeline, EventProcessor, Hint, RawInput, DEFAULT_ENVIRONMENT};
use crate::protocol::{Breadcrumb, ClientSdkInfo, Event, EventId, Exception, Level, Map, SpanId};
use crate::sampling::{sample_by_rate, DynamicSamplingContext, Sampler, SamplingContext};
use crate::scope::Scope;
use crate::session::{CheckIn, MonitorConfig, Session, SessionAggregator, SessionStatus};
use crate::span::{PropagationContext, Span, TraceState, BAGGAGE_HEADER, TRACE_HEADER};
use crate::transport::http::{HttpBackend, NoopBackend};
use crate::transport::{Backend, Transport};

/// Cheaply cloneable handle to a configured client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    options: ClientOptions,
    hooks: Arc<HookRegistry>,
    pipeline: EventPipeline,
    sampler: Sampler,
    envelopes: EnvelopeBuilder,
    transport: Transport,
    outcomes: Arc<Outcomes>,
    aggregator: Option<SessionAggregator>,
    closed: AtomicBool,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.inner.options)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client delivering to the configured DSN.
    ///
    /// Must be called from within a Tokio runtime, which runs the transport worker.
    pub fn new(options: ClientOptions) -> Result<Client, ConfigError> {
        let backend: Arc<dyn Backend> = match &options.dsn {
            Some(dsn) => Arc::new(HttpBackend::new(dsn, &options)),
            None => {
                debug!("No DSN configured, envelopes will be discarded locally");
                Arc::new(NoopBackend)
            }
        };
        Client::with_backend(options, backend)
    }

    /// Creates a client delivering through `backend`.
    pub fn with_backend(
        options: ClientOptions,
        backend: Arc<dyn Backend>,
    ) -> Result<Client, ConfigError> {
        options.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        if let Some(filter) = options.diagnostics_filter() {
            // The host may already have installed its own subscriber.
            if let Err(e) = logger::init(filter) {
                debug!("Diagnostics logger not installed: {}", e);
            }
        }

        let hooks = Arc::new(HookRegistry::new());
        let outcomes = Arc::new(Outcomes::new());
        let transport = Transport::spawn(
            backend,
            options.transport.clone(),
            outcomes.clone(),
            &runtime,
        );
        let aggregator = options
            .release
            .as_ref()
            .map(|release| SessionAggregator::new(release.clone(), options.environment.clone()));

        let inner = ClientInner {
            pipeline: EventPipeline::new(&options, hooks.clone()),
            sampler: Sampler::new(options.traces_sample_rate, options.traces_sampler.clone()),
            envelopes: EnvelopeBuilder::new(
                ClientSdkInfo::default(),
                options.dsn.as_ref().map(ToString::to_string),
            ),
            hooks,
            transport,
            outcomes,
            aggregator,
            closed: AtomicBool::new(false),
            options,
        };
        debug!(
            "Client initialized, tracing enabled: {}",
            inner.sampler.tracing_enabled()
        );
        Ok(Client {
            inner: Arc::new(inner),
        })
    }

    /// Options the client was created with.
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.inner.hooks
    }

    /// Counts of everything the client decided not to deliver.
    #[must_use]
    pub fn outcomes(&self) -> &Arc<Outcomes> {
        &self.inner.outcomes
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Registers a hook listener for the lifetime of the client.
    pub fn on(&self, listener: Listener) {
        self.inner.hooks.on(listener);
    }

    /// Registers a processor running on every event before scope-local processors.
    pub fn add_event_processor(&self, processor: EventProcessor) {
        self.inner.pipeline.add_event_processor(processor);
    }

    /// Scope holding at most `max_breadcrumbs` breadcrumbs.
    #[must_use]
    pub fn new_scope(&self) -> Scope {
        Scope::with_max_breadcrumbs(self.inner.options.max_breadcrumbs)
    }

    /// Records `breadcrumb` on `scope`. Returns `false` when a listener dropped it.
    pub fn add_breadcrumb(&self, scope: &mut Scope, breadcrumb: Breadcrumb) -> bool {
        scope.add_breadcrumb(breadcrumb, &self.inner.hooks)
    }

    /// Captures an exception chain, outermost exception first.
    ///
    /// Returns the event id even when the event is sampled out or dropped by a processor;
    /// such losses are counted in [`Client::outcomes`]. Fails only once the client is
    /// closed.
    pub fn capture_exception(
        &self,
        chain: Vec<Exception>,
        hint: Option<&Hint>,
        scope: Option<&Scope>,
    ) -> Result<EventId, ClientClosedError> {
        self.capture(RawInput::Exception(chain), hint, scope)
    }

    /// Captures `error` and its sources as an exception chain.
    pub fn capture_error(
        &self,
        error: &(dyn std::error::Error + 'static),
        hint: Option<&Hint>,
        scope: Option<&Scope>,
    ) -> Result<EventId, ClientClosedError> {
        self.capture_exception(Exception::chain_from_error(error), hint, scope)
    }

    /// Captures a plain message at `level`.
    pub fn capture_message(
        &self,
        text: impl Into<String>,
        level: Level,
        hint: Option<&Hint>,
        scope: Option<&Scope>,
    ) -> Result<EventId, ClientClosedError> {
        let input = RawInput::Message {
            text: text.into(),
            level,
        };
        self.capture(input, hint, scope)
    }

    /// Captures a prebuilt event; events typed `transaction` are sent as transactions.
    pub fn capture_event(
        &self,
        event: Event,
        hint: Option<&Hint>,
        scope: Option<&Scope>,
    ) -> Result<EventId, ClientClosedError> {
        let input = if event.is_transaction() {
            RawInput::Transaction(Box::new(event))
        } else {
            RawInput::Event(Box::new(event))
        };
        self.capture(input, hint, scope)
    }

    fn capture(
        &self,
        input: RawInput,
        hint: Option<&Hint>,
        scope: Option<&Scope>,
    ) -> Result<EventId, ClientClosedError> {
        self.ensure_open()?;
        let dsc = scope.and_then(|scope| self.scope_dsc(scope));
        self.capture_with_dsc(input, hint, scope, dsc)
    }

    fn capture_with_dsc(
        &self,
        input: RawInput,
        hint: Option<&Hint>,
        scope: Option<&Scope>,
        dsc: Option<Arc<DynamicSamplingContext>>,
    ) -> Result<EventId, ClientClosedError> {
        let is_transaction = matches!(input, RawInput::Transaction(_));
        let category = if is_transaction {
            DataCategory::Transaction
        } else {
            DataCategory::Error
        };
        let event_id = hint
            .and_then(|hint| hint.event_id)
            .or(match &input {
                RawInput::Event(event) | RawInput::Transaction(event)
                    if !event.event_id.is_nil() =>
                {
                    Some(event.event_id)
                }
                _ => None,
            })
            .unwrap_or_else(EventId::new);
        let hint = Hint {
            event_id: Some(event_id),
            ..hint.cloned().unwrap_or_default()
        };

        let expected = hint.expected && matches!(input, RawInput::Exception(_));
        let rate = self.inner.options.sample_rate;
        if !is_transaction && !expected && rate < 1.0 && !sample_by_rate(rate, fastrand::f64()) {
            debug!("Event {} sampled out at rate {}", event_id, rate);
            self.record_discard(&Discard::SampledOut, category);
            return Ok(event_id);
        }

        let default_scope;
        let scope = match scope {
            Some(scope) => scope,
            None => {
                default_scope = self.new_scope();
                &default_scope
            }
        };

        let event = match self.inner.pipeline.process(input, &hint, scope) {
            Ok(event) => event,
            Err(discard) => {
                self.record_discard(&discard, category);
                return Ok(event_id);
            }
        };

        let mut items = Vec::with_capacity(2);
        let session_item = if is_transaction {
            None
        } else {
            scope.session().and_then(|session| session_update(session, &event))
        };
        if is_transaction {
            items.push(Item::Transaction(Box::new(event)));
        } else {
            items.push(Item::Event(Box::new(event)));
        }
        items.extend(session_item);

        let result = self.dispatch(&items, dsc.as_deref());
        if let Some(event) = items.first().and_then(Item::event) {
            self.inner
                .hooks
                .emit(HookEvent::AfterSendEvent(event, result.as_ref().err()));
        }
        Ok(event_id)
    }

    fn record_discard(&self, discard: &Discard, category: DataCategory) {
        if let Some(reason) = discard.reason() {
            self.inner.outcomes.record_dropped_event(reason, category, 1);
        }
    }

    /// Builds and enqueues one envelope holding `items`.
    fn dispatch(
        &self,
        items: &[Item],
        dsc: Option<&DynamicSamplingContext>,
    ) -> Result<(), TransportError> {
        let hooks = &self.inner.hooks;
        hooks.emit(HookEvent::BeforeEnvelope(items));
        let envelope = match self.inner.envelopes.build(items, dsc) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Failed to build envelope: {}", e);
                for item in items {
                    self.inner.outcomes.record_dropped_event(
                        DiscardReason::InternalSdkError,
                        item.item_type().data_category(),
                        1,
                    );
                }
                return Err(TransportError::Delivery(e.to_string()));
            }
        };
        hooks.emit(HookEvent::AfterEnvelope(&envelope));
        // Outcomes are tracked by the transport; the delivery handle is not needed.
        self.inner.transport.send(envelope).map(|_| ())
    }

    fn ensure_open(&self) -> Result<(), ClientClosedError> {
        if self.is_closed() {
            return Err(ClientClosedError);
        }
        Ok(())
    }

    /// Starts a span, as a child of the scope's active span when there is one.
    ///
    /// A new root continues the scope's propagation context and takes the trace's
    /// sampling decision.
    pub fn start_span(
        &self,
        name: impl Into<String>,
        attributes: Map<Value>,
        scope: &Scope,
    ) -> Span {
        let name = name.into();
        if let Some(parent) = scope.span() {
            return self.start_span_in(
                parent.trace().clone(),
                parent.span_id(),
                parent.is_sampled(),
                name,
                attributes,
            );
        }

        let propagation = scope.propagation_context();
        let context = SamplingContext {
            span_name: &name,
            span_attributes: &attributes,
            parent_sampled: propagation.sampled,
            parent_context: propagation.dsc.as_deref(),
            sample_rand: propagation.sample_rand,
        };
        let decision = self.inner.sampler.decide(&context, &self.inner.hooks);
        let trace = Arc::new(TraceState::new(
            propagation.trace_id,
            decision.sampled,
            decision.sample_rate,
            propagation.sample_rand,
            name.clone(),
            propagation.dsc.clone(),
        ));
        let span = Span::new(
            name,
            attributes,
            propagation.parent_span_id,
            decision.sampled,
            true,
            trace,
        );
        self.inner.hooks.emit(HookEvent::SpanStart(&span));
        span
    }

    /// Starts a child of `parent` in the same trace.
    pub fn start_child(
        &self,
        parent: &Span,
        name: impl Into<String>,
        attributes: Map<Value>,
    ) -> Span {
        self.start_span_in(
            parent.trace().clone(),
            parent.span_id(),
            parent.is_sampled(),
            name.into(),
            attributes,
        )
    }

    fn start_span_in(
        &self,
        trace: Arc<TraceState>,
        parent_span_id: SpanId,
        parent_sampled: bool,
        name: String,
        attributes: Map<Value>,
    ) -> Span {
        let context = SamplingContext {
            span_name: &name,
            span_attributes: &attributes,
            parent_sampled: Some(parent_sampled),
            parent_context: trace.dsc.get().map(|dsc| &**dsc),
            sample_rand: trace.sample_rand,
        };
        let decision = self.inner.sampler.decide(&context, &self.inner.hooks);
        let span = Span::new(
            name,
            attributes,
            Some(parent_span_id),
            decision.sampled,
            false,
            trace,
        );
        self.inner.hooks.emit(HookEvent::SpanStart(&span));
        span
    }

    /// Ends `span`.
    ///
    /// A sampled child is buffered on its trace; a sampled root is sent as a transaction
    /// carrying every buffered child.
    pub fn finish_span(&self, mut span: Span, scope: Option<&Scope>) {
        span.finish();
        self.inner.hooks.emit(HookEvent::SpanEnd(&span));

        if !span.is_sampled() {
            if span.is_segment() {
                self.inner.outcomes.record_dropped_event(
                    DiscardReason::SampleRate,
                    DataCategory::Transaction,
                    1,
                );
            }
            return;
        }
        if !span.is_segment() {
            span.trace().push_finished(span.to_record());
            return;
        }
        if self.is_closed() {
            debug!("Client closed, not sending transaction {}", span.name());
            self.inner.outcomes.record_dropped_event(
                DiscardReason::ClientClosed,
                DataCategory::Transaction,
                1,
            );
            return;
        }

        let trace = span.trace().clone();
        let mut trace_context = span.trace_context();
        trace_context.data = span.attributes().clone();
        let mut event = Event {
            ty: Some(Event::TRANSACTION_TYPE.to_string()),
            level: Level::Info,
            transaction: Some(span.name().to_string()),
            start_timestamp: Some(span.start_timestamp()),
            timestamp: span.end_timestamp().unwrap_or_else(OffsetDateTime::now_utc),
            spans: trace.take_finished(),
            ..Default::default()
        };
        event.set_trace_context(&trace_context);

        let dsc = self.trace_dsc(&trace);
        let _ = self.capture_with_dsc(
            RawInput::Transaction(Box::new(event)),
            None,
            scope,
            Some(dsc),
        );
    }

    /// Dynamic sampling context of the span's trace, created on first use.
    #[must_use]
    pub fn dynamic_sampling_context(&self, span: &Span) -> Arc<DynamicSamplingContext> {
        self.trace_dsc(span.trace())
    }

    fn trace_dsc(&self, trace: &TraceState) -> Arc<DynamicSamplingContext> {
        if let Some(dsc) = trace.dsc.get() {
            return dsc.clone();
        }
        let dsc = DynamicSamplingContext {
            trace_id: Some(trace.trace_id.to_string()),
            transaction: Some(trace.root_name.clone()),
            sample_rate: trace.sample_rate,
            sampled: Some(trace.sampled),
            sample_rand: Some(trace.sample_rand),
            ..self.base_dsc()
        };
        // Emitted outside the cell so listeners may read the context themselves.
        self.inner.hooks.emit(HookEvent::CreateDsc(&dsc));
        trace.dsc.get_or_init(|| Arc::new(dsc)).clone()
    }

    fn propagation_dsc(&self, propagation: &PropagationContext) -> Arc<DynamicSamplingContext> {
        if let Some(dsc) = &propagation.dsc {
            return dsc.clone();
        }
        let dsc = DynamicSamplingContext {
            trace_id: Some(propagation.trace_id.to_string()),
            sample_rand: Some(propagation.sample_rand),
            ..self.base_dsc()
        };
        self.inner.hooks.emit(HookEvent::CreateDsc(&dsc));
        Arc::new(dsc)
    }

    fn base_dsc(&self) -> DynamicSamplingContext {
        let options = &self.inner.options;
        DynamicSamplingContext {
            public_key: options.dsn.as_ref().map(|dsn| dsn.public_key().to_string()),
            release: options.release.clone(),
            environment: Some(
                options
                    .environment
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            ),
            ..Default::default()
        }
    }

    /// Context attached to error envelopes: the active trace's, or one received upstream.
    fn scope_dsc(&self, scope: &Scope) -> Option<Arc<DynamicSamplingContext>> {
        match scope.span() {
            Some(span) => Some(self.trace_dsc(span.trace())),
            None => scope.propagation_context().dsc.clone(),
        }
    }

    /// Headers to attach to outgoing requests so downstream services continue the trace.
    #[must_use]
    pub fn trace_headers(&self, scope: &Scope) -> Vec<(&'static str, String)> {
        let (trace_header, dsc) = match scope.span() {
            Some(span) => (span.trace_header(), self.trace_dsc(span.trace())),
            None => {
                let propagation = scope.propagation_context();
                (propagation.trace_header(), self.propagation_dsc(propagation))
            }
        };
        vec![(TRACE_HEADER, trace_header), (BAGGAGE_HEADER, dsc.to_baggage())]
    }

    /// Starts a session on `scope`, ending the previous one.
    ///
    /// Sessions need a release; returns `false` without one.
    pub fn start_session(&self, scope: &mut Scope) -> bool {
        let Some(release) = self.inner.options.release.clone() else {
            debug!("No release configured, not starting a session");
            return false;
        };
        self.end_session(scope, SessionStatus::Exited);
        let did = scope.user().and_then(|user| user.id.clone());
        scope.set_session(Some(Session::new(
            release,
            self.inner.options.environment.clone(),
            did,
        )));
        true
    }

    /// Closes the session of `scope` with `status` and sends its final update.
    pub fn end_session(&self, scope: &mut Scope, status: SessionStatus) {
        let Some(session) = scope.take_session() else {
            return;
        };
        let update = {
            let mut session = lock_session(&session);
            session.close(status);
            let update = session.clone();
            session.mark_sent();
            update
        };
        if let Err(e) = self.capture_session(&update) {
            debug!("Session {} not sent: {}", update.sid, e);
        }
    }

    /// Sends a snapshot of `session`.
    pub fn capture_session(&self, session: &Session) -> Result<(), ClientClosedError> {
        self.ensure_open()?;
        let _ = self.dispatch(&[Item::Session(session.clone())], None);
        Ok(())
    }

    /// Counts one finished request into the aggregated session buckets sent on flush.
    pub fn record_request_session(&self, status: SessionStatus, errored: bool) {
        match &self.inner.aggregator {
            Some(aggregator) => aggregator.record(status, errored),
            None => debug!("No release configured, not recording request session"),
        }
    }

    /// Sends a cron monitor check-in, creating or updating the monitor with `monitor_config`.
    pub fn capture_check_in(
        &self,
        mut check_in: CheckIn,
        monitor_config: Option<MonitorConfig>,
        scope: Option<&Scope>,
    ) -> Result<EventId, ClientClosedError> {
        self.ensure_open()?;
        let check_in_id = check_in.check_in_id;
        if let Some(config) = monitor_config {
            if !config.schedule.is_valid() {
                warn!(
                    "Invalid schedule for monitor {}, dropping check-in",
                    check_in.monitor_slug
                );
                self.inner.outcomes.record_dropped_event(
                    DiscardReason::InternalSdkError,
                    DataCategory::Monitor,
                    1,
                );
                return Ok(check_in_id);
            }
            check_in.monitor_config = Some(config);
        }
        let options = &self.inner.options;
        if check_in.release.is_none() {
            check_in.release.clone_from(&options.release);
        }
        if check_in.environment.is_none() {
            check_in.environment = Some(
                options
                    .environment
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            );
        }
        if let Some(scope) = scope {
            if let Ok(trace) = serde_json::to_value(scope.trace_context()) {
                check_in.contexts.insert("trace".to_string(), trace);
            }
        }
        let _ = self.dispatch(&[Item::CheckIn(check_in)], None);
        Ok(check_in_id)
    }

    /// Sends pending session aggregates and the client report, then waits for the
    /// transport to drain. Returns `false` on timeout.
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.inner.hooks.emit(HookEvent::Flush);
        self.send_pending_reports();
        self.inner.transport.flush(timeout).await
    }

    /// Flushes, then refuses every further capture.
    pub async fn close(&self, timeout: Duration) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return self.inner.transport.pending() == 0;
        }
        self.inner.hooks.emit(HookEvent::Close);
        self.send_pending_reports();
        let flushed = self.inner.transport.close(timeout).await;
        debug!("Client closed, flushed: {}", flushed);
        flushed
    }

    /// Closes the client, waiting at most the configured `shutdown_timeout`.
    pub async fn shutdown(&self) -> bool {
        self.close(self.inner.options.shutdown_timeout).await
    }

    fn send_pending_reports(&self) {
        let mut items = Vec::new();
        if let Some(aggregates) = self.inner.aggregator.as_ref().and_then(SessionAggregator::take) {
            items.push(Item::SessionAggregates(aggregates));
        }
        if self.inner.options.send_client_reports {
            if let Some(report) = self.inner.outcomes.take_report() {
                items.push(Item::ClientReport(report));
            }
        }
        if !items.is_empty() {
            let _ = self.dispatch(&items, None);
        }
    }
}

#[allow(clippy::expect_used)]
fn lock_session(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().expect("lock poisoned")
}

/// Counts the error on the scope's session and returns the update to send with it.
fn session_update(session: &Mutex<Session>, event: &Event) -> Option<Item> {
    let errored = !event.exception.is_empty() || event.level >= Level::Error;
    if !errored {
        return None;
    }
    let crashed = event
        .exception
        .values
        .iter()
        .any(|exception| exception.mechanism.as_ref().and_then(|m| m.handled) == Some(false));
    let mut session = lock_session(session);
    if !session.record_error(crashed) {
        return None;
    }
    let update = session.clone();
    session.mark_sent();
    Some(Item::Session(update))
}
