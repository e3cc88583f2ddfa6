// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Classification of failed sends and the exponential backoff between retries.

use crate::config::ProducerConfig;
use crate::errors::{ProducerError, TransportError};
use std::collections::HashSet;
use std::time::Duration;

/// What the dispatcher does with a batch after a failed send.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Re-enqueue the batch once the delay has elapsed.
    Retry(Duration),
    /// Terminal failure reported to the listeners.
    Fail(ProducerError),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retries: u32,
    max_reserved_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    no_retry_status_codes: HashSet<u16>,
}

impl RetryPolicy {
    pub fn from_config(config: &ProducerConfig) -> Self {
        Self {
            retries: config.retries,
            max_reserved_attempts: config.max_reserved_attempts,
            base_backoff: Duration::from_millis(config.base_retry_backoff_ms),
            max_backoff: Duration::from_millis(config.max_retry_backoff_ms),
            no_retry_status_codes: config.no_retry_status_codes.clone(),
        }
    }

    /// Delay before the send following attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn is_retryable(&self, error: &TransportError) -> bool {
        error.retryable
            && !error
                .status
                .is_some_and(|status| self.no_retry_status_codes.contains(&status))
    }

    /// `attempt` is the number of sends already performed for the batch.
    pub fn decide(&self, attempt: u32, error: TransportError) -> RetryDecision {
        if !self.is_retryable(&error) {
            return RetryDecision::Fail(ProducerError::Transport(error));
        }
        if attempt <= self.retries && attempt < self.max_reserved_attempts {
            RetryDecision::Retry(self.backoff(attempt))
        } else {
            RetryDecision::Fail(ProducerError::RetryExhausted {
                attempts: attempt,
                last: error,
            })
        }
    }
}
