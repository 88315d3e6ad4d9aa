// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, rate-limit aware delivery of envelopes.
//!
//! [`Transport::send`] never blocks: it enqueues the envelope and returns a
//! [`DeliveryHandle`] that resolves to the terminal [`DeliveryOutcome`]. A single
//! [`TransportWorker`] pops entries and spawns deliveries, bounded by a semaphore of
//! `max_concurrent_requests` permits.
//!
//! ```text
//! queued -> in-flight -> delivered
//!                     -> retrying -> in-flight
//!                     -> rate-limited
//!                     -> discarded
//! ```

pub mod backoff;
pub mod http;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch, Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{OverflowPolicy, TransportOptions};
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::outcomes::{DiscardReason, Outcomes};
use crate::rate_limit::RateLimits;

use backoff::Backoff;

/// Status and rate-limit headers of a delivery attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendResponse {
    pub status: u16,
    /// Raw `X-Monitor-Rate-Limits` header value
    pub rate_limits: Option<String>,
    /// Raw `Retry-After` header value, in seconds
    pub retry_after: Option<String>,
}

/// Performs one delivery attempt of a serialized envelope.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn deliver(&self, envelope: &Envelope) -> Result<BackendResponse, TransportError>;
}

/// Terminal state of an envelope handed to [`Transport::send`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The endpoint answered with a 2xx status.
    Delivered,
    /// Dropped because its categories are rate limited, locally or by the server.
    RateLimited,
    /// Dropped for good; the loss was recorded under the reason.
    Discarded(DiscardReason),
}

/// Resolves once the envelope reached a terminal state.
#[derive(Debug)]
pub struct DeliveryHandle {
    receiver: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryHandle {
    /// Waits for the terminal outcome.
    pub async fn outcome(self) -> DeliveryOutcome {
        // The sender only disappears when the worker is torn down.
        self.receiver
            .await
            .unwrap_or(DeliveryOutcome::Discarded(DiscardReason::ClientClosed))
    }
}

struct QueueEntry {
    envelope: Envelope,
    enqueued_at: Instant,
    attempts: u32,
    reply: oneshot::Sender<DeliveryOutcome>,
}

impl QueueEntry {
    fn resolve(self, outcome: DeliveryOutcome) {
        // The caller may have dropped its handle.
        let _ = self.reply.send(outcome);
    }
}

struct QueueState {
    queue: VecDeque<QueueEntry>,
    in_flight: usize,
    closed: bool,
    rate_limits: RateLimits,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.queue.len() + self.in_flight
    }
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    pending: watch::Sender<usize>,
    permits: Arc<Semaphore>,
    backend: Arc<dyn Backend>,
    options: TransportOptions,
    outcomes: Arc<Outcomes>,
    cancel: CancellationToken,
}

/// Handle to the delivery queue. Clones share the same queue and worker.
///
/// Envelopes are accepted while fewer than `max_queue_size` are queued or in flight.
/// Losses are recorded in the shared [`Outcomes`].
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

/// Drives deliveries; must be polled on a Tokio runtime.
pub struct TransportWorker {
    shared: Arc<Shared>,
}

impl Transport {
    /// Creates a transport and the worker that must be spawned to drive it.
    #[must_use]
    pub fn new(
        backend: Arc<dyn Backend>,
        options: TransportOptions,
        outcomes: Arc<Outcomes>,
    ) -> (Transport, TransportWorker) {
        let (pending, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::with_capacity(options.max_queue_size),
                in_flight: 0,
                closed: false,
                rate_limits: RateLimits::new(),
            }),
            notify: Notify::new(),
            pending,
            permits: Arc::new(Semaphore::new(options.max_concurrent_requests)),
            backend,
            options,
            outcomes,
            cancel: CancellationToken::new(),
        });
        (
            Transport {
                shared: shared.clone(),
            },
            TransportWorker { shared },
        )
    }

    /// Creates a transport and spawns its worker on `runtime`.
    #[must_use]
    pub fn spawn(
        backend: Arc<dyn Backend>,
        options: TransportOptions,
        outcomes: Arc<Outcomes>,
        runtime: &tokio::runtime::Handle,
    ) -> Transport {
        let (transport, worker) = Transport::new(backend, options, outcomes);
        runtime.spawn(worker.run());
        transport
    }

    /// Enqueues `envelope` without waiting for delivery.
    ///
    /// Items of rate-limited categories are removed first; an envelope with nothing left
    /// is rejected with [`TransportError::RateLimited`].
    pub fn send(&self, envelope: Envelope) -> Result<DeliveryHandle, TransportError> {
        let shared = &self.shared;
        let mut state = shared.state();
        if state.closed {
            drop(state);
            shared.record(&envelope, DiscardReason::ClientClosed);
            return Err(TransportError::ClientClosed);
        }

        let Some(envelope) = shared.without_limited(&state.rate_limits, &envelope) else {
            let now = Instant::now();
            let until = envelope
                .items()
                .iter()
                .filter_map(|item| state.rate_limits.limited_until(item.data_category(), now))
                .max();
            debug!(
                "TRANSPORT | Envelope rate limited for another {:?}, not sending it",
                until.map(|until| until - now).unwrap_or_default()
            );
            return Err(TransportError::RateLimited);
        };

        if state.pending() >= shared.options.max_queue_size {
            let evicted = match shared.options.overflow_policy {
                OverflowPolicy::DropOldest => state.queue.pop_front(),
                OverflowPolicy::DropNewest => None,
            };
            match evicted {
                Some(oldest) => {
                    warn!("TRANSPORT | Queue full, evicting the oldest envelope");
                    shared.record(&oldest.envelope, DiscardReason::QueueOverflow);
                    oldest.resolve(DeliveryOutcome::Discarded(DiscardReason::QueueOverflow));
                }
                None => {
                    drop(state);
                    warn!("TRANSPORT | Queue full, dropping envelope");
                    shared.record(&envelope, DiscardReason::QueueOverflow);
                    return Err(TransportError::QueueOverflow);
                }
            }
        }

        let (reply, receiver) = oneshot::channel();
        state.queue.push_back(QueueEntry {
            envelope,
            enqueued_at: Instant::now(),
            attempts: 0,
            reply,
        });
        shared.pending.send_replace(state.pending());
        drop(state);
        shared.notify.notify_one();
        Ok(DeliveryHandle { receiver })
    }

    /// Waits until nothing is queued or in flight. Returns `false` on timeout.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let mut pending = self.shared.pending.subscribe();
        let result = tokio::time::timeout(timeout, pending.wait_for(|count| *count == 0)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Flushes, then refuses new envelopes and discards what is still queued.
    pub async fn close(&self, timeout: Duration) -> bool {
        let flushed = self.flush(timeout).await;
        let leftovers: Vec<QueueEntry> = {
            let mut state = self.shared.state();
            state.closed = true;
            let leftovers = state.queue.drain(..).collect();
            self.shared.pending.send_replace(state.pending());
            leftovers
        };
        if !leftovers.is_empty() {
            debug!(
                "TRANSPORT | Discarding {} queued envelopes on close",
                leftovers.len()
            );
        }
        for entry in leftovers {
            self.shared.record(&entry.envelope, DiscardReason::ClientClosed);
            entry.resolve(DeliveryOutcome::Discarded(DiscardReason::ClientClosed));
        }
        self.shared.cancel.cancel();
        flushed
    }

    /// Whether [`Transport::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    /// Number of envelopes queued or in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.shared.pending.borrow()
    }
}

impl TransportWorker {
    /// Delivers queued envelopes until the transport is closed.
    pub async fn run(self) {
        let shared = self.shared;
        loop {
            let permit = tokio::select! {
                () = shared.cancel.cancelled() => break,
                permit = shared.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let entry = loop {
                let notified = shared.notify.notified();
                if let Some(entry) = shared.pop() {
                    break Some(entry);
                }
                tokio::select! {
                    () = shared.cancel.cancelled() => break None,
                    () = notified => {}
                }
            };
            let Some(entry) = entry else {
                break;
            };

            let shared = shared.clone();
            tokio::spawn(async move {
                let mut entry = entry;
                debug!(
                    "TRANSPORT | Delivering envelope queued {:?} ago",
                    entry.enqueued_at.elapsed()
                );
                let outcome = shared.deliver(&mut entry).await;
                shared.complete();
                entry.resolve(outcome);
                drop(permit);
            });
        }
        debug!("TRANSPORT | Worker stopped");
    }
}

impl Shared {
    #[allow(clippy::expect_used)]
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("lock poisoned")
    }

    fn record(&self, envelope: &Envelope, reason: DiscardReason) {
        for item in envelope.items() {
            self.outcomes
                .record_dropped_event(reason, item.data_category(), 1);
        }
    }

    /// Copy of `envelope` without rate-limited items, recording each removed item.
    fn without_limited(&self, limits: &RateLimits, envelope: &Envelope) -> Option<Envelope> {
        let now = Instant::now();
        envelope.filter(|item| {
            let limited = limits.is_limited(item.data_category(), now);
            if limited {
                self.outcomes.record_dropped_event(
                    DiscardReason::RateLimitBackoff,
                    item.data_category(),
                    1,
                );
            }
            !limited
        })
    }

    fn pop(&self) -> Option<QueueEntry> {
        let mut state = self.state();
        let entry = state.queue.pop_front()?;
        state.in_flight += 1;
        Some(entry)
    }

    fn complete(&self) {
        let mut state = self.state();
        state.in_flight = state.in_flight.saturating_sub(1);
        self.pending.send_replace(state.pending());
    }

    async fn deliver(&self, entry: &mut QueueEntry) -> DeliveryOutcome {
        let options = &self.options;
        let mut backoff = Backoff::new(options.retry_base_delay, options.retry_max_delay);
        loop {
            entry.attempts += 1;
            let attempt = entry.attempts;
            // Limits may have been learned while this envelope waited.
            let filtered = {
                let state = self.state();
                self.without_limited(&state.rate_limits, &entry.envelope)
            };
            match filtered {
                Some(remaining) => entry.envelope = remaining,
                None => return DeliveryOutcome::RateLimited,
            }
            let envelope = &entry.envelope;

            let result =
                match tokio::time::timeout(options.attempt_timeout, self.backend.deliver(envelope))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Delivery(format!(
                        "attempt timed out after {:?}",
                        options.attempt_timeout
                    ))),
                };

            match result {
                Ok(response) => {
                    self.apply_rate_limits(&response);
                    match response.status {
                        200..=299 => {
                            debug!("TRANSPORT | Envelope delivered");
                            return DeliveryOutcome::Delivered;
                        }
                        429 | 529 => {
                            warn!(
                                "TRANSPORT | Rate limited by the server with status {}",
                                response.status
                            );
                            self.record(envelope, DiscardReason::RateLimitBackoff);
                            return DeliveryOutcome::RateLimited;
                        }
                        500..=599 => {
                            debug!(
                                "TRANSPORT | Attempt {} failed with status {}",
                                attempt, response.status
                            );
                        }
                        status => {
                            error!("TRANSPORT | Envelope rejected with status {}", status);
                            self.record(envelope, DiscardReason::SendError);
                            return DeliveryOutcome::Discarded(DiscardReason::SendError);
                        }
                    }
                }
                Err(e) => {
                    debug!("TRANSPORT | Attempt {} failed: {}", attempt, e);
                }
            }

            if attempt >= options.max_attempts {
                error!(
                    "TRANSPORT | Failed to deliver envelope after {} attempts",
                    attempt
                );
                self.record(envelope, DiscardReason::NetworkError);
                return DeliveryOutcome::Discarded(DiscardReason::NetworkError);
            }

            let delay = backoff.register_failure();
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.record(envelope, DiscardReason::ClientClosed);
                    return DeliveryOutcome::Discarded(DiscardReason::ClientClosed);
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Updates the limit table and purges queued entries that became limited.
    fn apply_rate_limits(&self, response: &BackendResponse) {
        let mut purged = Vec::new();
        {
            let mut state = self.state();
            let changed = state.rate_limits.update_from_response(
                response.status,
                response.rate_limits.as_deref(),
                response.retry_after.as_deref(),
                self.options.default_retry_after,
                Instant::now(),
            );
            if !changed {
                return;
            }
            let queued: Vec<QueueEntry> = state.queue.drain(..).collect();
            for mut entry in queued {
                match self.without_limited(&state.rate_limits, &entry.envelope) {
                    Some(remaining) => {
                        entry.envelope = remaining;
                        state.queue.push_back(entry);
                    }
                    None => purged.push(entry),
                }
            }
            self.pending.send_replace(state.pending());
        }
        for entry in purged {
            entry.resolve(DeliveryOutcome::RateLimited);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeBuilder, Item};
    use crate::outcomes::DataCategory;
    use crate::protocol::Event;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockBackend {
        responses: Mutex<VecDeque<Result<BackendResponse, TransportError>>>,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
    }

    impl MockBackend {
        fn with_responses(responses: Vec<Result<BackendResponse, TransportError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        async fn deliver(&self, _envelope: &Envelope) -> Result<BackendResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(status(200)))
        }
    }

    fn status(status: u16) -> BackendResponse {
        BackendResponse {
            status,
            ..Default::default()
        }
    }

    fn error_envelope() -> Envelope {
        EnvelopeBuilder::default()
            .build(&[Item::Event(Box::new(Event::default()))], None)
            .unwrap()
    }

    fn transaction_envelope() -> Envelope {
        EnvelopeBuilder::default()
            .build(&[Item::Transaction(Box::new(Event::default()))], None)
            .unwrap()
    }

    fn spawn(backend: Arc<MockBackend>, options: TransportOptions) -> (Transport, Arc<Outcomes>) {
        let outcomes = Arc::new(Outcomes::new());
        let transport = Transport::spawn(
            backend,
            options,
            outcomes.clone(),
            &tokio::runtime::Handle::current(),
        );
        (transport, outcomes)
    }

    #[tokio::test]
    async fn test_delivered() {
        let backend = Arc::new(MockBackend::default());
        let (transport, _) = spawn(backend.clone(), TransportOptions::default());

        let handle = transport.send(error_envelope()).unwrap();
        assert_eq!(handle.outcome().await, DeliveryOutcome::Delivered);
        assert!(transport.flush(Duration::from_secs(1)).await);
        assert_eq!(backend.calls(), 1);
        assert_eq!(transport.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_are_retried() {
        let backend = Arc::new(MockBackend::with_responses(vec![
            Ok(status(500)),
            Err(TransportError::Delivery("connection reset".into())),
            Ok(status(200)),
        ]));
        let (transport, _) = spawn(backend.clone(), TransportOptions::default());

        let handle = transport.send(error_envelope()).unwrap();
        assert_eq!(handle.outcome().await, DeliveryOutcome::Delivered);
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let backend = Arc::new(MockBackend::with_responses(vec![
            Ok(status(503)),
            Ok(status(503)),
            Ok(status(503)),
        ]));
        let (transport, outcomes) = spawn(backend.clone(), TransportOptions::default());

        let handle = transport.send(error_envelope()).unwrap();
        assert_eq!(
            handle.outcome().await,
            DeliveryOutcome::Discarded(DiscardReason::NetworkError)
        );
        assert_eq!(backend.calls(), 3);
        assert_eq!(
            outcomes.count(DiscardReason::NetworkError, DataCategory::Error),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried() {
        let backend = Arc::new(MockBackend {
            delay: Duration::from_secs(10),
            ..Default::default()
        });
        let options = TransportOptions {
            max_attempts: 2,
            ..Default::default()
        };
        let (transport, outcomes) = spawn(backend.clone(), options);

        let handle = transport.send(error_envelope()).unwrap();
        assert_eq!(
            handle.outcome().await,
            DeliveryOutcome::Discarded(DiscardReason::NetworkError)
        );
        assert_eq!(backend.calls(), 2);
        assert_eq!(outcomes.total(), 1);
    }

    #[tokio::test]
    async fn test_client_errors_are_fatal() {
        let backend = Arc::new(MockBackend::with_responses(vec![Ok(status(400))]));
        let (transport, outcomes) = spawn(backend.clone(), TransportOptions::default());

        let handle = transport.send(error_envelope()).unwrap();
        assert_eq!(
            handle.outcome().await,
            DeliveryOutcome::Discarded(DiscardReason::SendError)
        );
        assert_eq!(backend.calls(), 1);
        assert_eq!(outcomes.count(DiscardReason::SendError, DataCategory::Error), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_blocks_category_only() {
        let backend = Arc::new(MockBackend::with_responses(vec![Ok(BackendResponse {
            status: 429,
            rate_limits: Some("60:error:key".into()),
            retry_after: None,
        })]));
        let (transport, outcomes) = spawn(backend.clone(), TransportOptions::default());

        let handle = transport.send(error_envelope()).unwrap();
        assert_eq!(handle.outcome().await, DeliveryOutcome::RateLimited);

        assert!(matches!(
            transport.send(error_envelope()),
            Err(TransportError::RateLimited)
        ));
        assert_eq!(backend.calls(), 1);
        assert_eq!(
            outcomes.count(DiscardReason::RateLimitBackoff, DataCategory::Error),
            2
        );

        let handle = transport.send(transaction_envelope()).unwrap();
        assert_eq!(handle.outcome().await, DeliveryOutcome::Delivered);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_purges_queued_entries_of_limited_category() {
        let backend = Arc::new(MockBackend {
            delay: Duration::from_millis(500),
            ..MockBackend::with_responses(vec![Ok(BackendResponse {
                status: 429,
                rate_limits: Some("60:error:key".into()),
                retry_after: None,
            })])
        });
        let options = TransportOptions {
            max_concurrent_requests: 1,
            ..Default::default()
        };
        let (transport, outcomes) = spawn(backend.clone(), options);

        let in_flight = transport.send(error_envelope()).unwrap();
        let queued_error = transport.send(error_envelope()).unwrap();
        let queued_transaction = transport.send(transaction_envelope()).unwrap();
        let last_error = transport.send(error_envelope()).unwrap();

        assert_eq!(in_flight.outcome().await, DeliveryOutcome::RateLimited);
        assert_eq!(queued_error.outcome().await, DeliveryOutcome::RateLimited);
        assert_eq!(last_error.outcome().await, DeliveryOutcome::RateLimited);
        assert_eq!(
            queued_transaction.outcome().await,
            DeliveryOutcome::Delivered
        );
        assert_eq!(backend.calls(), 2);
        assert_eq!(
            outcomes.count(DiscardReason::RateLimitBackoff, DataCategory::Error),
            3
        );
        assert_eq!(outcomes.total(), 3);
    }

    #[tokio::test]
    async fn test_oversized_rate_limit_keeps_transport_usable() {
        let backend = Arc::new(MockBackend::with_responses(vec![Ok(BackendResponse {
            status: 429,
            rate_limits: Some("1e20:error:key".into()),
            retry_after: Some("1e300".into()),
        })]));
        let (transport, _) = spawn(backend.clone(), TransportOptions::default());

        let handle = transport.send(error_envelope()).unwrap();
        assert_eq!(handle.outcome().await, DeliveryOutcome::RateLimited);
        assert!(matches!(
            transport.send(error_envelope()),
            Err(TransportError::RateLimited)
        ));

        let handle = transport.send(transaction_envelope()).unwrap();
        assert_eq!(handle.outcome().await, DeliveryOutcome::Delivered);
        assert!(transport.flush(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_overflow_drops_newest() {
        let outcomes = Arc::new(Outcomes::new());
        let options = TransportOptions {
            max_queue_size: 2,
            ..Default::default()
        };
        // Without a running worker nothing leaves the queue.
        let (transport, _worker) =
            Transport::new(Arc::new(MockBackend::default()), options, outcomes.clone());

        transport.send(error_envelope()).unwrap();
        transport.send(error_envelope()).unwrap();
        assert!(matches!(
            transport.send(error_envelope()),
            Err(TransportError::QueueOverflow)
        ));
        assert_eq!(transport.pending(), 2);
        assert_eq!(
            outcomes.count(DiscardReason::QueueOverflow, DataCategory::Error),
            1
        );
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let outcomes = Arc::new(Outcomes::new());
        let options = TransportOptions {
            max_queue_size: 1,
            overflow_policy: OverflowPolicy::DropOldest,
            ..Default::default()
        };
        let (transport, _worker) =
            Transport::new(Arc::new(MockBackend::default()), options, outcomes.clone());

        let oldest = transport.send(error_envelope()).unwrap();
        transport.send(transaction_envelope()).unwrap();
        assert_eq!(
            oldest.outcome().await,
            DeliveryOutcome::Discarded(DiscardReason::QueueOverflow)
        );
        assert_eq!(transport.pending(), 1);
        assert_eq!(
            outcomes.count(DiscardReason::QueueOverflow, DataCategory::Error),
            1
        );
    }

    #[tokio::test]
    async fn test_close_discards_queued_entries() {
        let outcomes = Arc::new(Outcomes::new());
        let (transport, _worker) = Transport::new(
            Arc::new(MockBackend::default()),
            TransportOptions::default(),
            outcomes.clone(),
        );

        let handle = transport.send(error_envelope()).unwrap();
        assert!(!transport.close(Duration::ZERO).await);
        assert_eq!(
            handle.outcome().await,
            DeliveryOutcome::Discarded(DiscardReason::ClientClosed)
        );
        assert!(transport.is_closed());
        assert!(matches!(
            transport.send(error_envelope()),
            Err(TransportError::ClientClosed)
        ));
        assert_eq!(
            outcomes.count(DiscardReason::ClientClosed, DataCategory::Error),
            2
        );
    }

    #[tokio::test]
    async fn test_flush_is_idempotent() {
        let backend = Arc::new(MockBackend::default());
        let (transport, _) = spawn(backend.clone(), TransportOptions::default());
        assert!(transport.flush(Duration::from_millis(100)).await);
        assert!(transport.flush(Duration::from_millis(100)).await);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let backend = Arc::new(MockBackend {
            delay: Duration::from_millis(500),
            ..Default::default()
        });
        let options = TransportOptions {
            max_concurrent_requests: 2,
            ..Default::default()
        };
        let (transport, _) = spawn(backend.clone(), options);

        let handles: Vec<_> = (0..6)
            .map(|_| transport.send(error_envelope()).unwrap())
            .collect();
        for handle in handles {
            assert_eq!(handle.outcome().await, DeliveryOutcome::Delivered);
        }
        assert_eq!(backend.calls(), 6);
        assert!(backend.max_active.load(Ordering::SeqCst) <= 2);
    }
}
