// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the producer.
//!
//! Errors raised while a record is being admitted (`Shutdown`, `QuotaExceeded`,
//! `InvalidRecord`) are returned synchronously from `add_log`. Errors raised
//! while a sealed batch is being delivered only ever reach the caller through
//! the failure callback attached when the record was admitted.

use std::time::Duration;

/// Failure reported by a [`Transport`](crate::transport::Transport) send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}{}: {}{}", status_prefix(.status), .code, .message, request_id_suffix(.request_id))]
pub struct TransportError {
    /// HTTP status of the response; `None` for network and timeout failures.
    pub status: Option<u16>,
    /// Server error code (e.g. `Unauthorized`, `WriteQuotaExceed`).
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
    /// Whether the transport considers the failure transient. The dispatcher
    /// additionally checks the status against the configured non-retryable set.
    pub retryable: bool,
}

impl TransportError {
    /// Failure that never reached the server or never got an answer.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: "NetworkError".to_string(),
            message: message.into(),
            request_id: None,
            retryable: true,
        }
    }

    /// Failure described by a server response.
    pub fn from_status(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: code.into(),
            message: message.into(),
            request_id: None,
            retryable: true,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    #[must_use]
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

fn status_prefix(status: &Option<u16>) -> String {
    status.map(|status| format!("status {status}, ")).unwrap_or_default()
}

fn request_id_suffix(request_id: &Option<String>) -> String {
    request_id
        .as_ref()
        .map(|id| format!(" (request id {id})"))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProducerError {
    #[error("producer has started shutting down and cannot accept new logs")]
    Shutdown,

    #[error("timed out after {waited:?} waiting for {requested} bytes of producer memory")]
    QuotaExceeded { requested: usize, waited: Duration },

    #[error("invalid log record: {0}")]
    InvalidRecord(String),

    #[error("transport failure: {0}")]
    Transport(TransportError),

    #[error("giving up after {attempts} attempts, last failure: {last}")]
    RetryExhausted { attempts: u32, last: TransportError },

    #[error("invalid producer configuration: {0}")]
    InvalidConfig(String),

    #[error("producer did not drain within {0:?}")]
    CloseTimeout(Duration),

    #[error("failed to encode batch: {0}")]
    Codec(String),
}

impl From<TransportError> for ProducerError {
    fn from(err: TransportError) -> Self {
        ProducerError::Transport(err)
    }
}

impl ProducerError {
    /// The HTTP status carried by delivery failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProducerError::Transport(err) | ProducerError::RetryExhausted { last: err, .. } => {
                err.status
            }
            _ => None,
        }
    }
}
