// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ambient context attached to everything captured through a scope.
//!
//! Collections are held behind `Arc` and cloned on first write, so [`Scope::fork`] is
//! cheap and a forked child never observes (or causes) mutations of its parent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

use crate::hooks::{HookEvent, HookFlow, HookRegistry};
use crate::pipeline::EventProcessor;
use crate::protocol::{Breadcrumb, Event, Level, Map, Request, TraceContext, User};
use crate::session::Session;
use crate::span::{PropagationContext, SpanHandle};

pub const DEFAULT_MAX_BREADCRUMBS: usize = 100;

#[derive(Clone, Debug)]
pub struct Scope {
    max_breadcrumbs: usize,
    breadcrumbs: Arc<VecDeque<Breadcrumb>>,
    tags: Arc<Map<String>>,
    contexts: Arc<Map<Value>>,
    extra: Arc<Map<Value>>,
    user: Option<Arc<User>>,
    request: Option<Arc<Request>>,
    level: Option<Level>,
    fingerprint: Option<Arc<Vec<String>>>,
    transaction: Option<String>,
    span: Option<SpanHandle>,
    propagation_context: PropagationContext,
    processors: Arc<Vec<EventProcessor>>,
    session: Option<Arc<Mutex<Session>>>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::with_max_breadcrumbs(DEFAULT_MAX_BREADCRUMBS)
    }
}

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_breadcrumbs(max_breadcrumbs: usize) -> Self {
        Self {
            max_breadcrumbs,
            breadcrumbs: Arc::default(),
            tags: Arc::default(),
            contexts: Arc::default(),
            extra: Arc::default(),
            user: None,
            request: None,
            level: None,
            fingerprint: None,
            transaction: None,
            span: None,
            propagation_context: PropagationContext::new(),
            processors: Arc::default(),
            session: None,
        }
    }

    /// Independent child sharing storage until either side writes.
    ///
    /// The current session is shared: it belongs to the unit of work, not to the scope.
    #[must_use]
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Records a breadcrumb unless a breadcrumb hook drops it.
    ///
    /// Returns `true` when the breadcrumb was stored.
    pub fn add_breadcrumb(&mut self, mut breadcrumb: Breadcrumb, hooks: &HookRegistry) -> bool {
        if self.max_breadcrumbs == 0 {
            return false;
        }
        if breadcrumb.timestamp.is_none() {
            breadcrumb.timestamp = Some(OffsetDateTime::now_utc());
        }
        if hooks.emit(HookEvent::PreprocessAddBreadcrumb(&mut breadcrumb)) == HookFlow::Drop
            || hooks.emit(HookEvent::BeforeAddBreadcrumb(&mut breadcrumb)) == HookFlow::Drop
        {
            debug!("Breadcrumb dropped by hook");
            return false;
        }

        let breadcrumbs = Arc::make_mut(&mut self.breadcrumbs);
        breadcrumbs.push_back(breadcrumb);
        while breadcrumbs.len() > self.max_breadcrumbs {
            breadcrumbs.pop_front();
        }
        if let Some(stored) = breadcrumbs.back() {
            hooks.emit(HookEvent::AfterAddBreadcrumb(stored));
        }
        true
    }

    pub fn clear_breadcrumbs(&mut self) {
        self.breadcrumbs = Arc::default();
    }

    pub fn breadcrumbs(&self) -> impl Iterator<Item = &Breadcrumb> {
        self.breadcrumbs.iter()
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        Arc::make_mut(&mut self.tags).insert(key.into(), value.into());
    }

    pub fn remove_tag(&mut self, key: &str) {
        if self.tags.contains_key(key) {
            Arc::make_mut(&mut self.tags).remove(key);
        }
    }

    #[must_use]
    pub fn tags(&self) -> &Map<String> {
        &self.tags
    }

    pub fn set_context(&mut self, key: impl Into<String>, value: Value) {
        Arc::make_mut(&mut self.contexts).insert(key.into(), value);
    }

    pub fn remove_context(&mut self, key: &str) {
        if self.contexts.contains_key(key) {
            Arc::make_mut(&mut self.contexts).remove(key);
        }
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) {
        Arc::make_mut(&mut self.extra).insert(key.into(), value);
    }

    pub fn set_user(&mut self, user: Option<User>) {
        self.user = user.map(Arc::new);
    }

    #[must_use]
    pub fn user(&self) -> Option<&User> {
        self.user.as_deref()
    }

    pub fn set_request(&mut self, request: Option<Request>) {
        self.request = request.map(Arc::new);
    }

    pub fn set_level(&mut self, level: Option<Level>) {
        self.level = level;
    }

    #[must_use]
    pub fn level(&self) -> Option<Level> {
        self.level
    }

    pub fn set_fingerprint(&mut self, fingerprint: Option<Vec<String>>) {
        self.fingerprint = fingerprint.map(Arc::new);
    }

    pub fn set_transaction(&mut self, transaction: Option<String>) {
        self.transaction = transaction;
    }

    pub fn set_span(&mut self, span: Option<SpanHandle>) {
        self.span = span;
    }

    #[must_use]
    pub fn span(&self) -> Option<&SpanHandle> {
        self.span.as_ref()
    }

    pub fn set_propagation_context(&mut self, context: PropagationContext) {
        self.propagation_context = context;
    }

    #[must_use]
    pub fn propagation_context(&self) -> &PropagationContext {
        &self.propagation_context
    }

    pub fn add_event_processor(&mut self, processor: EventProcessor) {
        Arc::make_mut(&mut self.processors).push(processor);
    }

    pub(crate) fn processors(&self) -> &[EventProcessor] {
        &self.processors
    }

    pub fn set_session(&mut self, session: Option<Session>) {
        self.session = session.map(|session| Arc::new(Mutex::new(session)));
    }

    pub(crate) fn session(&self) -> Option<&Arc<Mutex<Session>>> {
        self.session.as_ref()
    }

    pub(crate) fn take_session(&mut self) -> Option<Arc<Mutex<Session>>> {
        self.session.take()
    }

    /// Trace context of the active span, or of the propagation context.
    #[must_use]
    pub fn trace_context(&self) -> TraceContext {
        match &self.span {
            Some(span) => span.trace_context(),
            None => self.propagation_context.trace_context(),
        }
    }

    /// Fills the event's gaps with scope data. Values already on the event win.
    pub(crate) fn apply_to_event(&self, event: &mut Event, max_breadcrumbs: usize) {
        for (key, value) in self.tags.iter() {
            event.tags.entry(key.clone()).or_insert_with(|| value.clone());
        }
        for (key, value) in self.extra.iter() {
            event.extra.entry(key.clone()).or_insert_with(|| value.clone());
        }
        for (key, value) in self.contexts.iter() {
            event.contexts.entry(key.clone()).or_insert_with(|| value.clone());
        }
        if !event.contexts.contains_key("trace") {
            event.set_trace_context(&self.trace_context());
        }
        if event.user.is_none() {
            event.user = self.user.as_deref().cloned();
        }
        if event.request.is_none() {
            event.request = self.request.as_deref().cloned();
        }
        if event.fingerprint.is_empty() {
            if let Some(fingerprint) = &self.fingerprint {
                event.fingerprint = fingerprint.to_vec();
            }
        }
        if event.transaction.is_none() {
            event.transaction = self
                .transaction
                .clone()
                .or_else(|| self.span.as_ref().map(|span| span.root_name().to_string()));
        }

        let own = std::mem::take(&mut event.breadcrumbs.values);
        let mut merged: Vec<Breadcrumb> = self.breadcrumbs.iter().cloned().chain(own).collect();
        if merged.len() > max_breadcrumbs {
            merged.drain(..merged.len() - max_breadcrumbs);
        }
        event.breadcrumbs.values = merged;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hooks::Listener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fork_is_isolated_from_parent() {
        let mut parent = Scope::new();
        parent.set_tag("region", "eu");
        parent.set_extra("attempt", Value::from(1));

        let mut child = parent.fork();
        child.set_tag("region", "us");
        child.set_tag("handler", "users");
        child.remove_tag("missing");
        child.set_user(Some(User {
            id: Some("42".into()),
            ..Default::default()
        }));

        assert_eq!(parent.tags().get("region").map(String::as_str), Some("eu"));
        assert!(parent.tags().get("handler").is_none());
        assert!(parent.user().is_none());
        assert_eq!(child.tags().get("region").map(String::as_str), Some("us"));
    }

    #[test]
    fn test_breadcrumbs_evict_oldest() {
        let hooks = HookRegistry::new();
        let mut scope = Scope::with_max_breadcrumbs(2);
        for i in 0..3 {
            assert!(scope.add_breadcrumb(Breadcrumb::new("test", format!("crumb {i}")), &hooks));
        }
        let messages: Vec<_> = scope
            .breadcrumbs()
            .map(|b| b.message.clone().unwrap())
            .collect();
        assert_eq!(messages, vec!["crumb 1", "crumb 2"]);
        assert!(scope.breadcrumbs().all(|b| b.timestamp.is_some()));
    }

    #[test]
    fn test_breadcrumb_hooks_order_and_drop() {
        let hooks = HookRegistry::new();
        let after = Arc::new(AtomicUsize::new(0));
        hooks.on(Listener::preprocess_add_breadcrumb(|crumb| {
            crumb.data.insert("preprocessed".into(), Value::Bool(true));
            HookFlow::Continue
        }));
        hooks.on(Listener::before_add_breadcrumb(|crumb| {
            assert!(crumb.data.contains_key("preprocessed"));
            if crumb.category.as_deref() == Some("console") {
                HookFlow::Drop
            } else {
                HookFlow::Continue
            }
        }));
        let counter = Arc::clone(&after);
        hooks.on(Listener::after_add_breadcrumb(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut scope = Scope::new();
        assert!(!scope.add_breadcrumb(Breadcrumb::new("console", "log line"), &hooks));
        assert!(scope.add_breadcrumb(Breadcrumb::new("http", "GET /"), &hooks));
        assert_eq!(scope.breadcrumbs().count(), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forked_breadcrumbs_do_not_leak() {
        let hooks = HookRegistry::new();
        let mut parent = Scope::new();
        parent.add_breadcrumb(Breadcrumb::new("nav", "home"), &hooks);
        let mut child = parent.fork();
        child.add_breadcrumb(Breadcrumb::new("nav", "settings"), &hooks);
        child.clear_breadcrumbs();
        assert_eq!(parent.breadcrumbs().count(), 1);
        assert_eq!(child.breadcrumbs().count(), 0);
    }

    #[test]
    fn test_apply_to_event_never_overwrites_event_values() {
        let hooks = HookRegistry::new();
        let mut scope = Scope::new();
        scope.set_tag("handler", "users");
        scope.set_tag("region", "eu");
        scope.set_transaction(Some("GET /users".into()));
        scope.set_request(Some(Request {
            method: Some("GET".into()),
            ..Default::default()
        }));
        scope.set_fingerprint(Some(vec!["{{ default }}".into(), "users".into()]));
        scope.add_breadcrumb(Breadcrumb::new("scope", "first"), &hooks);

        let mut event = Event::default();
        event.tags.insert("region".into(), "us".into());
        event.transaction = Some("explicit".into());
        event.breadcrumbs.values.push(Breadcrumb::new("event", "own"));

        scope.apply_to_event(&mut event, 100);

        assert_eq!(event.tags["region"], "us");
        assert_eq!(event.tags["handler"], "users");
        assert_eq!(event.transaction.as_deref(), Some("explicit"));
        assert_eq!(event.request.as_ref().unwrap().method.as_deref(), Some("GET"));
        assert_eq!(event.fingerprint.len(), 2);
        assert_eq!(event.breadcrumbs.len(), 2);
        assert_eq!(event.breadcrumbs.values[1].category.as_deref(), Some("event"));
        assert_eq!(
            event.trace_context().unwrap().trace_id,
            scope.propagation_context().trace_id
        );
    }

    #[test]
    fn test_apply_to_event_caps_breadcrumbs_keeping_newest() {
        let hooks = HookRegistry::new();
        let mut scope = Scope::new();
        for i in 0..5 {
            scope.add_breadcrumb(Breadcrumb::new("loop", format!("{i}")), &hooks);
        }
        let mut event = Event::default();
        scope.apply_to_event(&mut event, 3);
        let messages: Vec<_> = event
            .breadcrumbs
            .values
            .iter()
            .map(|b| b.message.clone().unwrap())
            .collect();
        assert_eq!(messages, vec!["2", "3", "4"]);
    }
}
