// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{dsn_for, options_for, ENVELOPE_PATH};
use mockito::{Matcher, Server};
use monitor_client::protocol::Map;
use monitor_client::transport::http::HttpBackend;
use monitor_client::{
    Client, ClientOptions, DataCategory, DeliveryOutcome, DiscardReason, EnvelopeBuilder,
    Exception, Item, Level, Outcomes, Request, Transport, TransportOptions,
};
use std::sync::Arc;
use std::time::Duration;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_exception_with_request_is_delivered() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", ENVELOPE_PATH)
        .match_header("content-type", "application/x-monitor-envelope")
        .match_header(
            "x-monitor-auth",
            Matcher::Regex("monitor_version=7.*monitor_key=public".to_string()),
        )
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex("This is an exception with id 123".to_string()),
            Matcher::Regex(r#""method":"GET""#.to_string()),
        ]))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let client = Client::new(options_for(&server)).expect("client");
    let mut scope = client.new_scope();
    scope.set_request(Some(Request {
        method: Some("GET".to_string()),
        url: Some("http://localhost/users/123".to_string()),
        ..Default::default()
    }));

    client
        .capture_exception(
            vec![Exception::new("RuntimeError", "This is an exception with id 123")],
            None,
            Some(&scope),
        )
        .expect("client is open");

    assert!(client.flush(FLUSH_TIMEOUT).await);
    mock.assert_async().await;
    assert_eq!(client.outcomes().total(), 0);
}

#[tokio::test]
async fn test_transport_reports_delivered_outcome() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", ENVELOPE_PATH)
        .with_status(200)
        .create_async()
        .await;

    let options = options_for(&server);
    let backend = Arc::new(HttpBackend::new(&dsn_for(&server), &options));
    let (transport, worker) =
        Transport::new(backend, options.transport.clone(), Arc::new(Outcomes::new()));
    tokio::spawn(worker.run());

    let envelope = EnvelopeBuilder::default()
        .build(&[Item::Event(Box::default())], None)
        .expect("envelope");
    let handle = transport.send(envelope).expect("queued");
    assert_eq!(handle.outcome().await, DeliveryOutcome::Delivered);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", ENVELOPE_PATH)
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let outcomes = Arc::new(Outcomes::new());
    let options = options_for(&server);
    let backend = Arc::new(HttpBackend::new(&dsn_for(&server), &options));
    let (transport, worker) = Transport::new(
        backend,
        TransportOptions {
            max_attempts: 3,
            ..options.transport.clone()
        },
        outcomes.clone(),
    );
    tokio::spawn(worker.run());

    let envelope = EnvelopeBuilder::default()
        .build(&[Item::Event(Box::default())], None)
        .expect("envelope");
    let handle = transport.send(envelope).expect("queued");
    assert_eq!(
        handle.outcome().await,
        DeliveryOutcome::Discarded(DiscardReason::NetworkError)
    );
    mock.assert_async().await;
    assert_eq!(
        outcomes.count(DiscardReason::NetworkError, DataCategory::Error),
        1
    );
}

#[tokio::test]
async fn test_flush_twice_delivers_once() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", ENVELOPE_PATH)
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let client = Client::new(options_for(&server)).expect("client");
    client
        .capture_message("deployment finished", Level::Info, None, None)
        .expect("client is open");

    assert!(client.flush(FLUSH_TIMEOUT).await);
    assert!(client.flush(FLUSH_TIMEOUT).await);
    mock.assert_async().await;
}

#[tokio::test]
async fn test_close_right_after_capture_does_not_hang() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", ENVELOPE_PATH)
        .with_status(200)
        .create_async()
        .await;

    let client = Client::new(options_for(&server)).expect("client");
    client
        .capture_message("shutting down", Level::Warning, None, None)
        .expect("client is open");

    let closed = tokio::time::timeout(FLUSH_TIMEOUT, client.close(Duration::ZERO)).await;
    assert!(closed.is_ok(), "close must not hang");
    assert!(client.is_closed());
    assert!(client
        .capture_message("too late", Level::Info, None, None)
        .is_err());
}

#[tokio::test]
async fn test_rate_limited_errors_do_not_block_transactions() {
    let mut server = Server::new_async().await;
    let errors = server
        .mock("POST", ENVELOPE_PATH)
        .match_body(Matcher::Regex(r#""type":"event""#.to_string()))
        .with_status(429)
        .with_header("x-monitor-rate-limits", "60:error:key")
        .expect(1)
        .create_async()
        .await;
    let transactions = server
        .mock("POST", ENVELOPE_PATH)
        .match_body(Matcher::Regex(r#""type":"transaction""#.to_string()))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let client = Client::new(ClientOptions {
        traces_sample_rate: Some(1.0),
        ..options_for(&server)
    })
    .expect("client");

    client
        .capture_message("first failure", Level::Error, None, None)
        .expect("client is open");
    assert!(client.flush(FLUSH_TIMEOUT).await);

    client
        .capture_message("second failure", Level::Error, None, None)
        .expect("client is open");
    let scope = client.new_scope();
    let span = client.start_span("GET /health", Map::new(), &scope);
    client.finish_span(span, Some(&scope));
    assert!(client.flush(FLUSH_TIMEOUT).await);

    errors.assert_async().await;
    transactions.assert_async().await;
    assert_eq!(
        client
            .outcomes()
            .count(DiscardReason::RateLimitBackoff, DataCategory::Error),
        2
    );
}

#[tokio::test]
async fn test_trace_sample_rate_bounds() {
    for (rate, expected) in [(0.0, false), (1.0, true)] {
        let client = Client::new(ClientOptions {
            traces_sample_rate: Some(rate),
            ..Default::default()
        })
        .expect("client");
        for _ in 0..10_000 {
            let scope = client.new_scope();
            let span = client.start_span("trial", Map::new(), &scope);
            assert_eq!(span.is_sampled(), expected, "rate {rate}");
        }
    }
}
