// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use async_trait::async_trait;
use prost::Message;
use sls_producer::codec::{self, LogGroup};
use sls_producer::{
    CompletionListener, Log, ProducerError, ProducerResult, SendRequest, SendResponse, Transport,
    TransportError,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Transport that replays scripted responses (then succeeds) and records every request.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<SendResponse, TransportError>>>,
    requests: Mutex<Vec<(Instant, SendRequest)>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockTransport {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(responses: Vec<Result<SendResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        })
    }

    /// Every send blocks until the returned gate gets a permit.
    pub fn gated() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let transport = Arc::new(Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        });
        (transport, gate)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<(Instant, SendRequest)> {
        self.requests.lock().unwrap().clone()
    }

    /// Decoded log groups in the order they were sent.
    pub fn log_groups(&self) -> Vec<LogGroup> {
        self.requests().iter().map(|(_, request)| decode(request)).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: SendRequest) -> Result<SendResponse, TransportError> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        self.requests
            .lock()
            .unwrap()
            .push((Instant::now(), request));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SendResponse::default()))
    }
}

pub fn decode(request: &SendRequest) -> LogGroup {
    let raw = codec::decompress(&request.body, request.compress_type, request.raw_size)
        .expect("failed to decompress body");
    LogGroup::decode(raw.as_slice()).expect("failed to decode log group")
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub logstore: String,
    pub success: bool,
    pub attempt_count: u32,
    pub log_count: usize,
    pub request_id: Option<String>,
    pub error: Option<ProducerError>,
    pub at: Instant,
}

#[derive(Default)]
pub struct RecordingListener {
    outcomes: Mutex<Vec<Outcome>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().unwrap().clone()
    }

    fn push(&self, result: &ProducerResult, error: Option<&ProducerError>) {
        self.outcomes.lock().unwrap().push(Outcome {
            logstore: result.key.logstore.clone(),
            success: error.is_none(),
            attempt_count: result.attempt_count,
            log_count: result.log_count,
            request_id: result.last_request_id().map(str::to_string),
            error: error.cloned(),
            at: Instant::now(),
        });
    }
}

impl CompletionListener for RecordingListener {
    fn on_success(&self, result: &ProducerResult) {
        self.push(result, None);
    }

    fn on_failure(&self, result: &ProducerResult, error: &ProducerError) {
        self.push(result, Some(error));
    }
}

/// A record whose accounted size is exactly `bytes` (4 for the time, 1 for the key).
pub fn log_of(bytes: usize) -> Log {
    Log::with_time(0, [("k", "v".repeat(bytes - 5))])
}

pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
