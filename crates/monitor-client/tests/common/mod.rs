// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared helpers for integration tests against a mocked ingestion endpoint

use monitor_client::{ClientOptions, Dsn, TransportOptions};
use std::time::Duration;

pub const PROJECT_ID: &str = "42";
pub const ENVELOPE_PATH: &str = "/api/42/envelope/";

/// DSN pointing at the mock server
pub fn dsn_for(server: &mockito::Server) -> Dsn {
    format!("http://public@{}/{PROJECT_ID}", server.host_with_port())
        .parse()
        .expect("valid DSN")
}

/// Client options with short retry delays, pointing at the mock server
pub fn options_for(server: &mockito::Server) -> ClientOptions {
    ClientOptions {
        dsn: Some(dsn_for(server)),
        release: Some("integration@1.0.0".to_string()),
        send_client_reports: false,
        transport: TransportOptions {
            retry_base_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(50),
            attempt_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        ..Default::default()
    }
}
