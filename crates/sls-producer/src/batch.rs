// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The unit of accumulation and transmission.
//!
//! A [`ProducerBatch`] is created when a record arrives for a key without an
//! open batch, grows while it is open (owned by the accumulator's bucket map),
//! and is moved into the dispatcher once sealed. From then on only the
//! dispatcher touches it, and only to record attempts.
//!
//! ```text
//! Accumulating ──seal──> Sealed ──> Dispatching ──> Succeeded
//!                                      │   ^
//!                                      v   │
//!                                    Retrying ──> Failed
//! ```

use crate::callback::CompletionListener;
use crate::memory::Reservation;
use crate::record::{Destination, Log};
use crate::size;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Identity of an open batch. Two records with equal keys share a batch.
pub type BatchKey = Destination;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Accumulating,
    Sealed,
    Dispatching,
    Retrying,
    Succeeded,
    Failed,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Succeeded | BatchState::Failed)
    }
}

/// Why a batch stopped accepting records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealReason {
    Size,
    Count,
    Linger,
    Flush,
}

impl fmt::Display for SealReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SealReason::Size => "size",
            SealReason::Count => "count",
            SealReason::Linger => "linger",
            SealReason::Flush => "flush",
        };
        f.write_str(reason)
    }
}

/// One send of a batch as seen by the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub success: bool,
    pub request_id: Option<String>,
    pub error_code: String,
    pub error_message: String,
    pub timestamp: SystemTime,
}

/// Summary of a batch handed to completion listeners.
#[derive(Debug, Clone)]
pub struct ProducerResult {
    pub key: BatchKey,
    pub log_count: usize,
    pub total_size: usize,
    /// Number of sends performed, including the final one.
    pub attempt_count: u32,
    /// The most recent attempts, bounded by `max_reserved_attempts`.
    pub attempts: Vec<Attempt>,
}

impl ProducerResult {
    pub fn is_successful(&self) -> bool {
        self.attempts.last().is_some_and(|attempt| attempt.success)
    }

    pub fn last_request_id(&self) -> Option<&str> {
        self.attempts
            .last()
            .and_then(|attempt| attempt.request_id.as_deref())
    }
}

pub struct ProducerBatch {
    key: BatchKey,
    logs: Vec<Log>,
    total_size: usize,
    created_at: Instant,
    listeners: Vec<Arc<dyn CompletionListener>>,
    reservation: Option<Reservation>,
    state: BatchState,
    attempt_count: u32,
    attempts: Vec<Attempt>,
    max_reserved_attempts: usize,
    pack_id: Option<String>,
    /// Serialized and compressed body, computed on the first send and reused for retries.
    payload: Option<Bytes>,
    raw_size: usize,
}

impl ProducerBatch {
    pub fn new(key: BatchKey, max_reserved_attempts: u32) -> Self {
        Self {
            key,
            logs: Vec::new(),
            total_size: 0,
            created_at: Instant::now(),
            listeners: Vec::new(),
            reservation: None,
            state: BatchState::Accumulating,
            attempt_count: 0,
            attempts: Vec::new(),
            max_reserved_attempts: max_reserved_attempts.max(1) as usize,
            pack_id: None,
            payload: None,
            raw_size: 0,
        }
    }

    /// Appends records while the batch is open. `reservation` must cover exactly their size.
    pub fn append(
        &mut self,
        logs: Vec<Log>,
        listener: Option<Arc<dyn CompletionListener>>,
        reservation: Reservation,
    ) {
        debug_assert_eq!(self.state, BatchState::Accumulating);
        debug_assert_eq!(reservation.bytes(), size::log_list_size(&logs));
        self.total_size += reservation.bytes();
        self.logs.extend(logs);
        if let Some(listener) = listener {
            self.listeners.push(listener);
        }
        match self.reservation.as_mut() {
            Some(held) => held.absorb(reservation),
            None => self.reservation = Some(reservation),
        }
    }

    pub fn seal(&mut self) {
        self.state = BatchState::Sealed;
    }

    pub fn key(&self) -> &BatchKey {
        &self.key
    }

    pub fn logs(&self) -> &[Log] {
        &self.logs
    }

    pub fn log_count(&self) -> usize {
        self.logs.len()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reservation
            .as_ref()
            .map(Reservation::bytes)
            .unwrap_or_default()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn is_full(&self, max_batch_size: usize, max_batch_count: usize) -> Option<SealReason> {
        if self.total_size >= max_batch_size {
            Some(SealReason::Size)
        } else if self.logs.len() >= max_batch_count {
            Some(SealReason::Count)
        } else {
            None
        }
    }

    pub fn pack_id(&self) -> Option<&str> {
        self.pack_id.as_deref()
    }

    pub fn set_pack_id(&mut self, pack_id: String) {
        self.pack_id = Some(pack_id);
    }

    pub fn payload(&self) -> Option<(&Bytes, usize)> {
        self.payload.as_ref().map(|payload| (payload, self.raw_size))
    }

    pub fn set_payload(&mut self, payload: Bytes, raw_size: usize) {
        self.payload = Some(payload);
        self.raw_size = raw_size;
    }

    /// Marks the start of a send and returns its 1-based attempt number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.state = BatchState::Dispatching;
        self.attempt_count += 1;
        self.attempt_count
    }

    pub fn record_attempt(&mut self, attempt: Attempt) {
        if self.attempts.len() == self.max_reserved_attempts {
            self.attempts.remove(0);
        }
        self.attempts.push(attempt);
    }

    pub fn mark_retrying(&mut self) {
        self.state = BatchState::Retrying;
    }

    /// Ends the batch's life: releases its memory and yields what the listeners need.
    pub fn finish(mut self, succeeded: bool) -> Completion {
        self.state = if succeeded {
            BatchState::Succeeded
        } else {
            BatchState::Failed
        };
        drop(self.reservation.take());
        Completion {
            listeners: std::mem::take(&mut self.listeners),
            result: ProducerResult {
                key: self.key,
                log_count: self.logs.len(),
                total_size: self.total_size,
                attempt_count: self.attempt_count,
                attempts: self.attempts,
            },
        }
    }
}

impl fmt::Debug for ProducerBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerBatch")
            .field("key", &self.key)
            .field("log_count", &self.logs.len())
            .field("total_size", &self.total_size)
            .field("state", &self.state)
            .field("attempt_count", &self.attempt_count)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Listeners and result of a batch that reached a terminal state.
pub struct Completion {
    pub listeners: Vec<Arc<dyn CompletionListener>>,
    pub result: ProducerResult,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("listeners", &self.listeners.len())
            .field("result", &self.result)
            .finish()
    }
}
