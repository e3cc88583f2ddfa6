// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded worker pool that delivers sealed batches.
//!
//! The pool loop takes a worker slot, then a batch from the dispatch queue,
//! and spawns the send. A failed send is either re-enqueued after its backoff
//! (from a detached timer task, so the slot is free meanwhile) or finished as
//! a terminal failure. Terminal batches release their memory and hand their
//! listeners to the callback lane.

use crate::batch::{Attempt, ProducerBatch};
use crate::callback::CallbackHandle;
use crate::codec;
use crate::config::{CompressType, ProducerConfig};
use crate::errors::{ProducerError, TransportError};
use crate::monitor::ProducerMonitor;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::{SendRequest, Transport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Number of sealed batches that have not reached a terminal outcome.
#[derive(Debug, Default)]
pub struct PendingTracker {
    count: AtomicUsize,
    idle: Notify,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves once no batch is queued, in flight or waiting for a retry.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Everything a worker needs to take one batch through one attempt.
struct SendContext {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    callbacks: CallbackHandle,
    monitor: Arc<ProducerMonitor>,
    pending: Arc<PendingTracker>,
    requeue: mpsc::Sender<ProducerBatch>,
    log_tags: Vec<(String, String)>,
    compress_type: CompressType,
}

pub struct Dispatcher {
    rx: mpsc::Receiver<ProducerBatch>,
    workers: Arc<Semaphore>,
    context: Arc<SendContext>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// `queue` must be the sending half of `rx`; retries re-enter through it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ProducerConfig,
        rx: mpsc::Receiver<ProducerBatch>,
        queue: mpsc::Sender<ProducerBatch>,
        transport: Arc<dyn Transport>,
        callbacks: CallbackHandle,
        monitor: Arc<ProducerMonitor>,
        pending: Arc<PendingTracker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            workers: Arc::new(Semaphore::new(config.max_io_worker_count.max(1))),
            context: Arc::new(SendContext {
                transport,
                policy: RetryPolicy::from_config(config),
                callbacks,
                monitor,
                pending,
                requeue: queue,
                log_tags: config.log_tags.clone(),
                compress_type: config.compress_type,
            }),
            cancel,
        }
    }

    pub async fn run(mut self) {
        debug!("PRODUCER | Dispatcher started");
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&self.workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                batch = self.rx.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };
            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                context.process(batch).await;
                drop(permit);
            });
        }
        debug!("PRODUCER | Dispatcher stopped");
    }
}

impl SendContext {
    async fn process(&self, mut batch: ProducerBatch) {
        if batch.payload().is_none() {
            match codec::encode_batch(&batch, &self.log_tags, self.compress_type) {
                Ok(encoded) => batch.set_payload(encoded.body, encoded.raw_size),
                Err(err) => {
                    error!("PRODUCER | Failed to encode batch: {err}");
                    self.fail(batch, err, Instant::now());
                    return;
                }
            }
        }
        let Some((body, raw_size)) = batch.payload().map(|(body, raw)| (body.clone(), raw)) else {
            return self.fail(
                batch,
                ProducerError::Codec("batch has no payload".to_string()),
                Instant::now(),
            );
        };

        let key = batch.key();
        let request = SendRequest {
            project: key.project.clone(),
            logstore: key.logstore.clone(),
            shard_hash: (!key.shard_hash.is_empty()).then(|| key.shard_hash.clone()),
            body,
            raw_size,
            compress_type: self.compress_type,
        };

        let attempt = batch.begin_attempt();
        let start = Instant::now();
        let result = self.transport.send(request).await;
        let send_end = Instant::now();
        let send_cost = send_end - start;

        match result {
            Ok(response) => {
                self.monitor.record_send(send_cost);
                batch.record_attempt(Attempt {
                    success: true,
                    request_id: response.request_id,
                    error_code: String::new(),
                    error_message: String::new(),
                    timestamp: SystemTime::now(),
                });
                debug!(
                    "PRODUCER | Delivered {} logs to {}/{} on attempt {attempt}",
                    batch.log_count(),
                    batch.key().project,
                    batch.key().logstore
                );
                let completion = batch.finish(true);
                self.callbacks.success(completion, send_end);
                self.pending.done();
            }
            Err(err) => {
                batch.record_attempt(failed_attempt(&err));
                match self.policy.decide(attempt, err) {
                    RetryDecision::Retry(delay) => {
                        self.monitor.record_retry(send_cost);
                        warn!(
                            "PRODUCER | Send to {}/{} failed on attempt {attempt}, retrying in {} ms",
                            batch.key().project,
                            batch.key().logstore,
                            delay.as_millis()
                        );
                        batch.mark_retrying();
                        self.schedule_retry(batch, delay);
                    }
                    RetryDecision::Fail(error) => {
                        self.monitor.record_send(send_cost);
                        self.fail(batch, error, send_end);
                    }
                }
            }
        }
    }

    fn schedule_retry(&self, batch: ProducerBatch, delay: std::time::Duration) {
        let requeue = self.requeue.clone();
        let callbacks = self.callbacks.clone();
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(mpsc::error::SendError(batch)) = requeue.send(batch).await {
                error!("PRODUCER | Dispatcher stopped before retry of {}/{}", batch.key().project, batch.key().logstore);
                let completion = batch.finish(false);
                callbacks.failure(completion, ProducerError::Shutdown, Instant::now());
                pending.done();
            }
        });
    }

    fn fail(&self, batch: ProducerBatch, error: ProducerError, send_end: Instant) {
        error!(
            "PRODUCER | Giving up on {} logs for {}/{} after {} attempts: {error}",
            batch.log_count(),
            batch.key().project,
            batch.key().logstore,
            batch.attempt_count()
        );
        let completion = batch.finish(false);
        self.callbacks.failure(completion, error, send_end);
        self.pending.done();
    }
}

fn failed_attempt(err: &TransportError) -> Attempt {
    Attempt {
        success: false,
        request_id: err.request_id.clone(),
        error_code: err.code.clone(),
        error_message: err.message.clone(),
        timestamp: SystemTime::now(),
    }
}
