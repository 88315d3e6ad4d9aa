// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns raw captures into finalized events.
//!
//! # Stages
//!
//! ```text
//!   RawInput ─> normalize ─> merge scope ─> PreprocessEvent ─> processors ─> BeforeSendEvent
//!                  │                                               │
//!            MalformedInput                                 ProcessorDropped
//! ```
//!
//! 1. **Normalize**: build an [`Event`] from an exception chain, a message, a prebuilt
//!    event or a finished transaction.
//! 2. **Merge**: scope data fills gaps, then option defaults (release, environment,
//!    server name, SDK) fill what is still missing. Deep values are then replaced by
//!    `"[Object]"` or `"[Array]"`, long strings are truncated, and an event still
//!    larger than `max_event_bytes` is rejected.
//! 3. **Process**: global processors run first, then scope-local ones, in registration
//!    order. Returning `None` drops the event; a panic leaves it unchanged.
//!
//! No stage performs I/O.

use std::borrow::Cow;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::ClientOptions;
use crate::error::Discard;
use crate::hooks::{HookEvent, HookRegistry};
use crate::protocol::{ClientSdkInfo, Event, EventId, Exception, Level, Map, Mechanism};
use crate::scope::Scope;

pub const DEFAULT_NORMALIZE_DEPTH: usize = 3;
pub const DEFAULT_MAX_VALUE_LENGTH: usize = 8192;
pub const DEFAULT_MAX_EVENT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_ENVIRONMENT: &str = "production";

const MAX_TAG_VALUE_LENGTH: usize = 200;

/// Out-of-band information about a capture.
#[derive(Clone, Debug, Default)]
pub struct Hint {
    /// Id to assign to the resulting event instead of a random one.
    pub event_id: Option<EventId>,
    /// The exception is part of normal control flow and must not become an event.
    pub expected: bool,
    /// How the exception was caught, applied to the outermost exception.
    pub mechanism: Option<Mechanism>,
    /// Free-form data visible to processors and hooks.
    pub data: Map<Value>,
}

impl Hint {
    #[must_use]
    pub fn expected() -> Self {
        Self {
            expected: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_mechanism(mechanism: Mechanism) -> Self {
        Self {
            mechanism: Some(mechanism),
            ..Default::default()
        }
    }
}

/// Raw material handed to the pipeline.
#[derive(Clone, Debug)]
pub enum RawInput {
    /// Exception chain, root cause first.
    Exception(Vec<Exception>),
    Message { text: String, level: Level },
    Event(Box<Event>),
    Transaction(Box<Event>),
}

type ProcessorFn = dyn Fn(Event, &Hint) -> Option<Event> + Send + Sync;

/// Named event transformation. Returning `None` drops the event.
#[derive(Clone)]
pub struct EventProcessor {
    name: Cow<'static, str>,
    f: Arc<ProcessorFn>,
}

impl EventProcessor {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, f: F) -> Self
    where
        F: Fn(Event, &Hint) -> Option<Event> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventProcessor").field(&self.name).finish()
    }
}

#[derive(Clone, Debug)]
struct PipelineDefaults {
    release: Option<String>,
    environment: String,
    server_name: Option<String>,
    dist: Option<String>,
    sdk: ClientSdkInfo,
    max_breadcrumbs: usize,
    normalize_depth: usize,
    max_value_length: usize,
    max_event_bytes: usize,
}

pub struct EventPipeline {
    defaults: PipelineDefaults,
    processors: RwLock<Vec<EventProcessor>>,
    hooks: Arc<HookRegistry>,
}

impl fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPipeline")
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl EventPipeline {
    #[must_use]
    pub fn new(options: &ClientOptions, hooks: Arc<HookRegistry>) -> Self {
        Self {
            defaults: PipelineDefaults {
                release: options.release.clone(),
                environment: options
                    .environment
                    .clone()
                    .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
                server_name: options.server_name.clone(),
                dist: options.dist.clone(),
                sdk: ClientSdkInfo::default(),
                max_breadcrumbs: options.max_breadcrumbs,
                normalize_depth: options.normalize_depth,
                max_value_length: options.max_value_length,
                max_event_bytes: options.max_event_bytes,
            },
            processors: RwLock::new(Vec::new()),
            hooks,
        }
    }

    /// Registers a processor that runs for every event, before scope-local processors.
    pub fn add_event_processor(&self, processor: EventProcessor) {
        #[allow(clippy::expect_used)]
        self.processors
            .write()
            .expect("lock poisoned")
            .push(processor);
    }

    pub fn process(&self, input: RawInput, hint: &Hint, scope: &Scope) -> Result<Event, Discard> {
        if hint.expected && matches!(input, RawInput::Exception(_)) {
            debug!("Exception marked as expected, not creating an event");
            return Err(Discard::Expected);
        }

        let mut event = self.normalize(input, hint, scope)?;
        scope.apply_to_event(&mut event, self.defaults.max_breadcrumbs);
        self.apply_defaults(&mut event);
        self.bound_values(&mut event);
        self.check_size(&event)?;

        self.hooks.emit(HookEvent::PreprocessEvent(&mut event, hint));

        #[allow(clippy::expect_used)]
        let global = self.processors.read().expect("lock poisoned").clone();
        for processor in global.iter().chain(scope.processors()) {
            event = run_processor(processor, event, hint)?;
        }

        self.hooks.emit(HookEvent::BeforeSendEvent(&event, hint));
        Ok(event)
    }

    fn normalize(&self, input: RawInput, hint: &Hint, scope: &Scope) -> Result<Event, Discard> {
        let mut event = match input {
            RawInput::Exception(mut chain) => {
                if chain.is_empty() || chain.iter().any(Exception::is_blank) {
                    warn!("Dropping exception without type or value");
                    return Err(Discard::MalformedInput(
                        "exception has neither type nor value".to_string(),
                    ));
                }
                if let (Some(mechanism), Some(outermost)) = (&hint.mechanism, chain.last_mut()) {
                    if outermost.mechanism.is_none() {
                        outermost.mechanism = Some(mechanism.clone());
                    }
                }
                Event {
                    level: scope.level().unwrap_or(Level::Error),
                    exception: chain.into(),
                    ..Default::default()
                }
            }
            RawInput::Message { text, level } => Event {
                level,
                message: Some(text),
                ..Default::default()
            },
            RawInput::Event(event) => *event,
            RawInput::Transaction(mut event) => {
                event.ty = Some(Event::TRANSACTION_TYPE.to_string());
                event.level = Level::Info;
                *event
            }
        };

        if let Some(event_id) = hint.event_id {
            event.event_id = event_id;
        } else if event.event_id.is_nil() {
            event.event_id = EventId::new();
        }
        Ok(event)
    }

    /// Applied after the scope merge so scope-provided values are bounded too.
    fn bound_values(&self, event: &mut Event) {
        let depth = self.defaults.normalize_depth;
        let max_len = self.defaults.max_value_length;
        for value in event.extra.values_mut().chain(event.contexts.values_mut()) {
            *value = normalize_value(std::mem::take(value), depth, max_len);
        }
        for value in event.tags.values_mut() {
            truncate_in_place(value, MAX_TAG_VALUE_LENGTH);
        }
        if let Some(message) = event.message.as_mut() {
            truncate_in_place(message, max_len);
        }
        for exception in &mut event.exception.values {
            if let Some(value) = exception.value.as_mut() {
                truncate_in_place(value, max_len);
            }
        }
        for crumb in &mut event.breadcrumbs.values {
            if let Some(message) = crumb.message.as_mut() {
                truncate_in_place(message, max_len);
            }
        }
    }

    fn apply_defaults(&self, event: &mut Event) {
        let defaults = &self.defaults;
        if event.release.is_none() {
            event.release.clone_from(&defaults.release);
        }
        if event.environment.is_none() {
            event.environment = Some(defaults.environment.clone());
        }
        if event.server_name.is_none() {
            event.server_name.clone_from(&defaults.server_name);
        }
        if event.dist.is_none() {
            event.dist.clone_from(&defaults.dist);
        }
        if event.sdk.is_none() {
            event.sdk = Some(defaults.sdk.clone());
        }
        if event.platform.is_empty() {
            event.platform = "native".to_string();
        }
    }

    fn check_size(&self, event: &Event) -> Result<(), Discard> {
        let size = serde_json::to_vec(event)
            .map_err(|e| Discard::MalformedInput(format!("event is not serializable: {e}")))?
            .len();
        if size > self.defaults.max_event_bytes {
            warn!(
                "Dropping event {}: {} bytes exceeds the limit of {} bytes",
                event.event_id, size, self.defaults.max_event_bytes
            );
            return Err(Discard::MalformedInput(format!(
                "event of {size} bytes exceeds {} bytes",
                self.defaults.max_event_bytes
            )));
        }
        Ok(())
    }
}

fn run_processor(processor: &EventProcessor, event: Event, hint: &Hint) -> Result<Event, Discard> {
    let event_id = event.event_id;
    let snapshot = event.clone();
    match catch_unwind(AssertUnwindSafe(|| (processor.f)(snapshot, hint))) {
        Ok(Some(processed)) => Ok(processed),
        Ok(None) => {
            debug!(
                "Event {} dropped by event processor {}",
                event_id,
                processor.name()
            );
            Err(Discard::ProcessorDropped(processor.name().to_string()))
        }
        Err(_) => {
            error!(
                "Event processor {} panicked, keeping event {} unchanged",
                processor.name(),
                event_id
            );
            Ok(event)
        }
    }
}

/// Replaces containers nested deeper than `depth` and truncates strings.
#[must_use]
pub fn normalize_value(value: Value, depth: usize, max_len: usize) -> Value {
    match value {
        Value::String(mut s) => {
            truncate_in_place(&mut s, max_len);
            Value::String(s)
        }
        Value::Array(_) if depth == 0 => Value::String("[Array]".to_string()),
        Value::Object(_) if depth == 0 => Value::String("[Object]".to_string()),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| normalize_value(item, depth - 1, max_len))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, normalize_value(item, depth - 1, max_len)))
                .collect(),
        ),
        other => other,
    }
}

fn truncate_in_place(value: &mut String, max_chars: usize) {
    if value.chars().count() <= max_chars {
        return;
    }
    let keep = max_chars.saturating_sub(3);
    let cut = value
        .char_indices()
        .nth(keep)
        .map_or(value.len(), |(index, _)| index);
    value.truncate(cut);
    value.push_str("...");
}
