// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Synchronous lifecycle hooks.
//!
//! The registry maps every [`HookName`] to an ordered list of listeners. Each listener
//! variant carries its own argument types, so a listener for `SpanEnd` can only ever be
//! handed a span and a `BeforeSampling` listener always receives the decision record it
//! may overwrite.
//!
//! # Dispatch rules
//!
//! - Listeners run synchronously on the emitting thread, in registration order.
//! - A panicking listener is logged and skipped; the remaining listeners still run.
//! - Breadcrumb listeners return a [`HookFlow`]. [`HookFlow::Drop`] discards the
//!   breadcrumb and stops dispatch for that hook.
//! - Listeners live as long as the registry.
//!
//! # Example
//!
//! ```rust,ignore
//! let hooks = HookRegistry::new();
//! hooks.on(Listener::before_add_breadcrumb(|crumb| {
//!     if crumb.category.as_deref() == Some("console") {
//!         HookFlow::Drop
//!     } else {
//!         HookFlow::Continue
//!     }
//! }));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use tracing::{debug, error};

use crate::envelope::{Envelope, Item};
use crate::error::{HookError, TransportError};
use crate::pipeline::Hint;
use crate::protocol::{Breadcrumb, Event};
use crate::sampling::{DynamicSamplingContext, SamplingContext, SamplingDecision};
use crate::span::Span;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookName {
    PreprocessAddBreadcrumb,
    BeforeAddBreadcrumb,
    AfterAddBreadcrumb,
    BeforeSampling,
    SpanStart,
    SpanEnd,
    CreateDsc,
    PreprocessEvent,
    BeforeSendEvent,
    AfterSendEvent,
    BeforeEnvelope,
    AfterEnvelope,
    Flush,
    Close,
}

impl HookName {
    pub const ALL: [HookName; 14] = [
        HookName::PreprocessAddBreadcrumb,
        HookName::BeforeAddBreadcrumb,
        HookName::AfterAddBreadcrumb,
        HookName::BeforeSampling,
        HookName::SpanStart,
        HookName::SpanEnd,
        HookName::CreateDsc,
        HookName::PreprocessEvent,
        HookName::BeforeSendEvent,
        HookName::AfterSendEvent,
        HookName::BeforeEnvelope,
        HookName::AfterEnvelope,
        HookName::Flush,
        HookName::Close,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HookName::PreprocessAddBreadcrumb => "preprocessAddBreadcrumb",
            HookName::BeforeAddBreadcrumb => "beforeAddBreadcrumb",
            HookName::AfterAddBreadcrumb => "afterAddBreadcrumb",
            HookName::BeforeSampling => "beforeSampling",
            HookName::SpanStart => "spanStart",
            HookName::SpanEnd => "spanEnd",
            HookName::CreateDsc => "createDsc",
            HookName::PreprocessEvent => "preprocessEvent",
            HookName::BeforeSendEvent => "beforeSendEvent",
            HookName::AfterSendEvent => "afterSendEvent",
            HookName::BeforeEnvelope => "beforeEnvelope",
            HookName::AfterEnvelope => "afterEnvelope",
            HookName::Flush => "flush",
            HookName::Close => "close",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookName {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| HookError::UnknownHook(s.to_string()))
    }
}

/// Whether a breadcrumb keeps flowing through the remaining listeners.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HookFlow {
    #[default]
    Continue,
    Drop,
}

type BreadcrumbFn = dyn Fn(&mut Breadcrumb) -> HookFlow + Send + Sync;
type BreadcrumbObserverFn = dyn Fn(&Breadcrumb) + Send + Sync;
type SamplingFn = dyn Fn(&SamplingContext<'_>, &mut SamplingDecision) + Send + Sync;
type SpanFn = dyn Fn(&Span) + Send + Sync;
type DscFn = dyn Fn(&DynamicSamplingContext) + Send + Sync;
type EventFn = dyn Fn(&mut Event, &Hint) + Send + Sync;
type EventObserverFn = dyn Fn(&Event, &Hint) + Send + Sync;
type SentFn = dyn Fn(&Event, Option<&TransportError>) + Send + Sync;
type ItemsFn = dyn Fn(&[Item]) + Send + Sync;
type EnvelopeFn = dyn Fn(&Envelope) + Send + Sync;
type SignalFn = dyn Fn() + Send + Sync;

/// A listener bound to exactly one hook.
#[derive(Clone)]
pub enum Listener {
    PreprocessAddBreadcrumb(Arc<BreadcrumbFn>),
    BeforeAddBreadcrumb(Arc<BreadcrumbFn>),
    AfterAddBreadcrumb(Arc<BreadcrumbObserverFn>),
    BeforeSampling(Arc<SamplingFn>),
    SpanStart(Arc<SpanFn>),
    SpanEnd(Arc<SpanFn>),
    CreateDsc(Arc<DscFn>),
    PreprocessEvent(Arc<EventFn>),
    BeforeSendEvent(Arc<EventObserverFn>),
    AfterSendEvent(Arc<SentFn>),
    BeforeEnvelope(Arc<ItemsFn>),
    AfterEnvelope(Arc<EnvelopeFn>),
    Flush(Arc<SignalFn>),
    Close(Arc<SignalFn>),
}

impl Listener {
    pub fn preprocess_add_breadcrumb<F>(f: F) -> Self
    where
        F: Fn(&mut Breadcrumb) -> HookFlow + Send + Sync + 'static,
    {
        Listener::PreprocessAddBreadcrumb(Arc::new(f))
    }

    pub fn before_add_breadcrumb<F>(f: F) -> Self
    where
        F: Fn(&mut Breadcrumb) -> HookFlow + Send + Sync + 'static,
    {
        Listener::BeforeAddBreadcrumb(Arc::new(f))
    }

    pub fn after_add_breadcrumb<F>(f: F) -> Self
    where
        F: Fn(&Breadcrumb) + Send + Sync + 'static,
    {
        Listener::AfterAddBreadcrumb(Arc::new(f))
    }

    pub fn before_sampling<F>(f: F) -> Self
    where
        F: Fn(&SamplingContext<'_>, &mut SamplingDecision) + Send + Sync + 'static,
    {
        Listener::BeforeSampling(Arc::new(f))
    }

    pub fn span_start<F>(f: F) -> Self
    where
        F: Fn(&Span) + Send + Sync + 'static,
    {
        Listener::SpanStart(Arc::new(f))
    }

    pub fn span_end<F>(f: F) -> Self
    where
        F: Fn(&Span) + Send + Sync + 'static,
    {
        Listener::SpanEnd(Arc::new(f))
    }

    pub fn create_dsc<F>(f: F) -> Self
    where
        F: Fn(&DynamicSamplingContext) + Send + Sync + 'static,
    {
        Listener::CreateDsc(Arc::new(f))
    }

    pub fn preprocess_event<F>(f: F) -> Self
    where
        F: Fn(&mut Event, &Hint) + Send + Sync + 'static,
    {
        Listener::PreprocessEvent(Arc::new(f))
    }

    pub fn before_send_event<F>(f: F) -> Self
    where
        F: Fn(&Event, &Hint) + Send + Sync + 'static,
    {
        Listener::BeforeSendEvent(Arc::new(f))
    }

    pub fn after_send_event<F>(f: F) -> Self
    where
        F: Fn(&Event, Option<&TransportError>) + Send + Sync + 'static,
    {
        Listener::AfterSendEvent(Arc::new(f))
    }

    pub fn before_envelope<F>(f: F) -> Self
    where
        F: Fn(&[Item]) + Send + Sync + 'static,
    {
        Listener::BeforeEnvelope(Arc::new(f))
    }

    pub fn after_envelope<F>(f: F) -> Self
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        Listener::AfterEnvelope(Arc::new(f))
    }

    pub fn flush<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Listener::Flush(Arc::new(f))
    }

    pub fn close<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Listener::Close(Arc::new(f))
    }

    #[must_use]
    pub fn hook(&self) -> HookName {
        match self {
            Listener::PreprocessAddBreadcrumb(_) => HookName::PreprocessAddBreadcrumb,
            Listener::BeforeAddBreadcrumb(_) => HookName::BeforeAddBreadcrumb,
            Listener::AfterAddBreadcrumb(_) => HookName::AfterAddBreadcrumb,
            Listener::BeforeSampling(_) => HookName::BeforeSampling,
            Listener::SpanStart(_) => HookName::SpanStart,
            Listener::SpanEnd(_) => HookName::SpanEnd,
            Listener::CreateDsc(_) => HookName::CreateDsc,
            Listener::PreprocessEvent(_) => HookName::PreprocessEvent,
            Listener::BeforeSendEvent(_) => HookName::BeforeSendEvent,
            Listener::AfterSendEvent(_) => HookName::AfterSendEvent,
            Listener::BeforeEnvelope(_) => HookName::BeforeEnvelope,
            Listener::AfterEnvelope(_) => HookName::AfterEnvelope,
            Listener::Flush(_) => HookName::Flush,
            Listener::Close(_) => HookName::Close,
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener").field(&self.hook()).finish()
    }
}

/// Arguments of one hook emission.
pub enum HookEvent<'a> {
    PreprocessAddBreadcrumb(&'a mut Breadcrumb),
    BeforeAddBreadcrumb(&'a mut Breadcrumb),
    AfterAddBreadcrumb(&'a Breadcrumb),
    BeforeSampling(&'a SamplingContext<'a>, &'a mut SamplingDecision),
    SpanStart(&'a Span),
    SpanEnd(&'a Span),
    CreateDsc(&'a DynamicSamplingContext),
    PreprocessEvent(&'a mut Event, &'a Hint),
    BeforeSendEvent(&'a Event, &'a Hint),
    AfterSendEvent(&'a Event, Option<&'a TransportError>),
    BeforeEnvelope(&'a [Item]),
    AfterEnvelope(&'a Envelope),
    Flush,
    Close,
}

impl HookEvent<'_> {
    #[must_use]
    pub fn hook(&self) -> HookName {
        match self {
            HookEvent::PreprocessAddBreadcrumb(_) => HookName::PreprocessAddBreadcrumb,
            HookEvent::BeforeAddBreadcrumb(_) => HookName::BeforeAddBreadcrumb,
            HookEvent::AfterAddBreadcrumb(_) => HookName::AfterAddBreadcrumb,
            HookEvent::BeforeSampling(..) => HookName::BeforeSampling,
            HookEvent::SpanStart(_) => HookName::SpanStart,
            HookEvent::SpanEnd(_) => HookName::SpanEnd,
            HookEvent::CreateDsc(_) => HookName::CreateDsc,
            HookEvent::PreprocessEvent(..) => HookName::PreprocessEvent,
            HookEvent::BeforeSendEvent(..) => HookName::BeforeSendEvent,
            HookEvent::AfterSendEvent(..) => HookName::AfterSendEvent,
            HookEvent::BeforeEnvelope(_) => HookName::BeforeEnvelope,
            HookEvent::AfterEnvelope(_) => HookName::AfterEnvelope,
            HookEvent::Flush => HookName::Flush,
            HookEvent::Close => HookName::Close,
        }
    }
}

/// Typed multi-listener dispatcher.
#[derive(Default)]
pub struct HookRegistry {
    listeners: RwLock<HashMap<HookName, Vec<Listener>>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<HookName, usize> = self
            .read()
            .iter()
            .map(|(name, listeners)| (*name, listeners.len()))
            .collect();
        f.debug_struct("HookRegistry")
            .field("listeners", &counts)
            .finish()
    }
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)]
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<HookName, Vec<Listener>>> {
        self.listeners.read().expect("lock poisoned")
    }

    /// Registers `listener` under the hook its variant names.
    pub fn on(&self, listener: Listener) {
        let hook = listener.hook();
        #[allow(clippy::expect_used)]
        let mut listeners = self.listeners.write().expect("lock poisoned");
        listeners.entry(hook).or_default().push(listener);
        debug!("Registered listener for hook {}", hook);
    }

    /// Registers `listener` under a hook given by its string name.
    ///
    /// Fails when the name is unknown or names a different hook than the listener.
    pub fn on_named(&self, name: &str, listener: Listener) -> Result<(), HookError> {
        let expected: HookName = name.parse()?;
        let actual = listener.hook();
        if expected != actual {
            return Err(HookError::ListenerMismatch { expected, actual });
        }
        self.on(listener);
        Ok(())
    }

    #[must_use]
    pub fn listener_count(&self, hook: HookName) -> usize {
        self.read().get(&hook).map_or(0, Vec::len)
    }

    /// Invokes every listener of the event's hook in registration order.
    ///
    /// Returns [`HookFlow::Drop`] when a breadcrumb listener dropped the breadcrumb.
    pub fn emit(&self, mut event: HookEvent<'_>) -> HookFlow {
        let hook = event.hook();
        // Snapshot so listeners may register further listeners without deadlocking.
        let listeners = match self.read().get(&hook) {
            Some(listeners) if !listeners.is_empty() => listeners.clone(),
            _ => return HookFlow::Continue,
        };

        for listener in &listeners {
            match catch_unwind(AssertUnwindSafe(|| dispatch(listener, &mut event))) {
                Ok(HookFlow::Continue) => {}
                Ok(HookFlow::Drop) => {
                    debug!("Listener for hook {} dropped the breadcrumb", hook);
                    return HookFlow::Drop;
                }
                Err(_) => {
                    error!("Listener for hook {} panicked, skipping it", hook);
                }
            }
        }
        HookFlow::Continue
    }
}

fn dispatch(listener: &Listener, event: &mut HookEvent<'_>) -> HookFlow {
    match (listener, event) {
        (Listener::PreprocessAddBreadcrumb(f), HookEvent::PreprocessAddBreadcrumb(crumb))
        | (Listener::BeforeAddBreadcrumb(f), HookEvent::BeforeAddBreadcrumb(crumb)) => {
            f(&mut **crumb)
        }
        (Listener::AfterAddBreadcrumb(f), HookEvent::AfterAddBreadcrumb(crumb)) => {
            f(*crumb);
            HookFlow::Continue
        }
        (Listener::BeforeSampling(f), HookEvent::BeforeSampling(context, decision)) => {
            f(*context, &mut **decision);
            HookFlow::Continue
        }
        (Listener::SpanStart(f), HookEvent::SpanStart(span))
        | (Listener::SpanEnd(f), HookEvent::SpanEnd(span)) => {
            f(*span);
            HookFlow::Continue
        }
        (Listener::CreateDsc(f), HookEvent::CreateDsc(dsc)) => {
            f(*dsc);
            HookFlow::Continue
        }
        (Listener::PreprocessEvent(f), HookEvent::PreprocessEvent(event, hint)) => {
            f(&mut **event, *hint);
            HookFlow::Continue
        }
        (Listener::BeforeSendEvent(f), HookEvent::BeforeSendEvent(event, hint)) => {
            f(*event, *hint);
            HookFlow::Continue
        }
        (Listener::AfterSendEvent(f), HookEvent::AfterSendEvent(event, error)) => {
            f(*event, *error);
            HookFlow::Continue
        }
        (Listener::BeforeEnvelope(f), HookEvent::BeforeEnvelope(items)) => {
            f(*items);
            HookFlow::Continue
        }
        (Listener::AfterEnvelope(f), HookEvent::AfterEnvelope(envelope)) => {
            f(*envelope);
            HookFlow::Continue
        }
        (Listener::Flush(f), HookEvent::Flush) | (Listener::Close(f), HookEvent::Close) => {
            f();
            HookFlow::Continue
        }
        // Listeners are stored under their own hook, so this arm is unreachable.
        _ => HookFlow::Continue,
    }
}
