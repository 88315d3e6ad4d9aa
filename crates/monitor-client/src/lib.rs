// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Monitor Client
//!
//! Client dispatch engine for application monitoring. It captures errors, messages,
//! spans, sessions and check-ins from an instrumented process, decides what to keep,
//! packages the result into envelopes and delivers them asynchronously to an ingestion
//! endpoint, without ever surfacing a delivery failure to the host application.
//!
//! ## Architecture
//!
//! ```text
//!  capture_* ──> EventPipeline ──> EnvelopeBuilder ──> Transport ──> Backend (HTTP)
//!      │              │                                   │
//!    Scope       HookRegistry  <── SamplingEngine        RateLimits / Outcomes
//! ```
//!
//! - [`hooks`]: typed, registration-ordered lifecycle hooks
//! - [`scope`]: forkable ambient context (tags, breadcrumbs, user, trace)
//! - [`sampling`]: trace sampling decisions and the dynamic sampling context
//! - [`pipeline`]: event normalization, scope merge and event processors
//! - [`envelope`]: multi-item payload builder and parser
//! - [`transport`]: bounded queue, concurrent delivery, retry and rate limiting
//! - [`client`]: the capture API tying everything together
//!
//! There is no global client: a [`Client`] handle is created explicitly and passed to
//! whoever captures, and concurrent request handling isolates its context by forking a
//! [`Scope`].

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod dsn;
pub mod envelope;
pub mod error;
pub mod hooks;
pub mod logger;
pub mod outcomes;
pub mod pipeline;
pub mod protocol;
pub mod rate_limit;
pub mod sampling;
pub mod scope;
pub mod session;
pub mod span;
pub mod transport;

pub use client::Client;
pub use config::{ClientOptions, OverflowPolicy, TransportOptions};
pub use dsn::Dsn;
pub use envelope::{Envelope, EnvelopeBuilder, Item, ItemType};
pub use error::{ClientClosedError, Discard, TransportError};
pub use hooks::{HookEvent, HookFlow, HookName, HookRegistry, Listener};
pub use outcomes::{DataCategory, DiscardReason, Outcomes};
pub use pipeline::{EventPipeline, EventProcessor, Hint, RawInput};
pub use protocol::{Breadcrumb, Event, EventId, Exception, Level, Request, User};
pub use sampling::{DynamicSamplingContext, Sampler, SamplingContext, SamplingDecision};
pub use scope::Scope;
pub use session::{CheckIn, CheckInStatus, MonitorConfig, Session, SessionStatus};
pub use span::{PropagationContext, Span};
pub use transport::{
    Backend, BackendResponse, DeliveryHandle, DeliveryOutcome, Transport, TransportWorker,
};

/// Name reported in the SDK metadata of every envelope.
pub const SDK_NAME: &str = "monitor.rust";

/// Version reported in the SDK metadata of every envelope.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
