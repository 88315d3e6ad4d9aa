// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP delivery of envelopes to the ingestion endpoint.

use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::config::ClientOptions;
use crate::dsn::Dsn;
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::protocol::ClientSdkInfo;
use crate::rate_limit::{RATE_LIMITS_HEADER, RETRY_AFTER_HEADER};

use super::{Backend, BackendResponse};

pub const ENVELOPE_CONTENT_TYPE: &str = "application/x-monitor-envelope";
pub const AUTH_HEADER: &str = "X-Monitor-Auth";

/// Posts envelopes to the DSN's envelope endpoint with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    auth: String,
}

impl HttpBackend {
    /// Targets the envelope endpoint of `dsn`.
    #[must_use]
    pub fn new(dsn: &Dsn, options: &ClientOptions) -> Self {
        Self {
            client: get_client(options),
            url: dsn.envelope_url(),
            auth: dsn.auth_header(&ClientSdkInfo::default()),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn deliver(&self, envelope: &Envelope) -> Result<BackendResponse, TransportError> {
        let body = envelope
            .to_bytes()
            .map_err(|e| TransportError::Delivery(e.to_string()))?;
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, ENVELOPE_CONTENT_TYPE)
            .header(AUTH_HEADER, &self.auth)
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Delivery(e.to_string()))?;

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        Ok(BackendResponse {
            status: response.status().as_u16(),
            rate_limits: header(RATE_LIMITS_HEADER),
            retry_after: header(RETRY_AFTER_HEADER),
        })
    }
}

/// Accepts every envelope without sending it. Used when no DSN is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackend;

#[async_trait]
impl Backend for NoopBackend {
    async fn deliver(&self, envelope: &Envelope) -> Result<BackendResponse, TransportError> {
        debug!(
            "TRANSPORT | No DSN configured, dropping envelope with {} items",
            envelope.items().len()
        );
        Ok(BackendResponse {
            status: 200,
            rate_limits: None,
            retry_after: None,
        })
    }
}

/// Builds the HTTP client used for envelope delivery.
///
/// An invalid `https_proxy` is logged and the client connects directly instead.
///
/// # Arguments
///
/// * `options` - Client options providing the proxy and the per-attempt timeout
///
/// # Returns
///
/// A configured client, or `reqwest` defaults if no configured client can be built
#[must_use]
pub fn get_client(options: &ClientOptions) -> reqwest::Client {
    match build_client(options, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "TRANSPORT | Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(options, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "TRANSPORT | Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(
    options: &ClientOptions,
    allow_proxy: bool,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .timeout(options.transport.attempt_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if allow_proxy {
        if let Some(https_uri) = &options.https_proxy {
            client = client.proxy(reqwest::Proxy::https(https_uri.clone())?);
        }
    }

    Ok(client.build()?)
}
