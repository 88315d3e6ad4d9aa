// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::hooks::HookName;
use crate::outcomes::DiscardReason;

/// Reasons the event pipeline produced no event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Discard {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Event dropped by processor {0}")]
    ProcessorDropped(String),

    #[error("Exception marked as expected")]
    Expected,

    #[error("Event sampled out")]
    SampledOut,
}

impl Discard {
    /// Reason under which the discard is counted, `None` when it is not a loss.
    #[must_use]
    pub fn reason(&self) -> Option<DiscardReason> {
        match self {
            Discard::MalformedInput(_) => Some(DiscardReason::InternalSdkError),
            Discard::ProcessorDropped(_) => Some(DiscardReason::EventProcessor),
            Discard::SampledOut => Some(DiscardReason::SampleRate),
            Discard::Expected => None,
        }
    }
}

/// Errors returned synchronously by `Transport::send`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport queue is full")]
    QueueOverflow,

    #[error("Every item of the envelope is rate limited")]
    RateLimited,

    #[error("Delivery failed: {0}")]
    Delivery(String),

    #[error("Transport is closed")]
    ClientClosed,
}

/// Returned by the capture API once the client has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Client is closed")]
pub struct ClientClosedError;

impl From<ClientClosedError> for TransportError {
    fn from(_: ClientClosedError) -> Self {
        TransportError::ClientClosed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DsnError {
    #[error("Invalid DSN url: {0}")]
    InvalidUrl(String),

    #[error("Unsupported DSN scheme: {0}")]
    UnsupportedScheme(String),

    #[error("DSN is missing the public key")]
    MissingPublicKey,

    #[error("DSN is missing the host")]
    MissingHost,

    #[error("DSN is missing the project id")]
    MissingProjectId,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Dsn(#[from] DsnError),

    #[error("Client must be created inside a Tokio runtime")]
    NoRuntime,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Failed to serialize envelope item: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope is missing its header line")]
    MissingHeader,

    #[error("Envelope ended before item payload of {expected} bytes ({available} available)")]
    UnexpectedEof { expected: usize, available: usize },

    #[error("Envelope item payload is not followed by a newline")]
    MissingTerminator,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    #[error("Unknown hook name: {0}")]
    UnknownHook(String),

    #[error("Listener for {actual} cannot be registered under {expected}")]
    ListenerMismatch { expected: HookName, actual: HookName },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::InvalidConfig("sample_rate must be within [0, 1]".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: sample_rate must be within [0, 1]"
        );
        assert_eq!(
            HookError::UnknownHook("beforeLunch".into()).to_string(),
            "Unknown hook name: beforeLunch"
        );
    }

    #[test]
    fn test_discard_reasons() {
        assert_eq!(
            Discard::MalformedInput("empty".into()).reason(),
            Some(DiscardReason::InternalSdkError)
        );
        assert_eq!(
            Discard::ProcessorDropped("scrubber".into()).reason(),
            Some(DiscardReason::EventProcessor)
        );
        assert_eq!(Discard::SampledOut.reason(), Some(DiscardReason::SampleRate));
        assert_eq!(Discard::Expected.reason(), None);
    }

    #[test]
    fn test_config_error_from_dsn_error() {
        let error: ConfigError = DsnError::MissingHost.into();
        assert!(matches!(error, ConfigError::Dsn(DsnError::MissingHost)));
        assert_eq!(error.to_string(), "DSN is missing the host");
    }

    #[test]
    fn test_client_closed_converts_to_transport_error() {
        let error: TransportError = ClientClosedError.into();
        assert_eq!(error, TransportError::ClientClosed);
    }
}
