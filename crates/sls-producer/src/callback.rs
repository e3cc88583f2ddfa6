// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Completion listeners and the lane that runs them.
//!
//! Listener code runs on its own task so a slow callback never holds a
//! dispatch worker. Jobs are executed in the order batches completed.

use crate::batch::{Completion, ProducerResult};
use crate::errors::ProducerError;
use crate::monitor::ProducerMonitor;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Receives the outcome of the batch a record ended up in.
///
/// Every `add_log` call that supplied a listener gets exactly one of the two
/// calls, after its batch succeeded or permanently failed.
pub trait CompletionListener: Send + Sync {
    fn on_success(&self, result: &ProducerResult);
    fn on_failure(&self, result: &ProducerResult, error: &ProducerError);
}

#[derive(Debug)]
pub enum CallbackCommand {
    Success {
        completion: Completion,
        sent_at: Instant,
    },
    Failure {
        completion: Completion,
        error: ProducerError,
        sent_at: Instant,
    },
    /// Acknowledged once every job queued before it has run.
    Drain(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct CallbackHandle {
    tx: mpsc::UnboundedSender<CallbackCommand>,
}

impl CallbackHandle {
    pub fn success(&self, completion: Completion, sent_at: Instant) {
        if completion.listeners.is_empty() {
            return;
        }
        self.submit(CallbackCommand::Success {
            completion,
            sent_at,
        });
    }

    pub fn failure(&self, completion: Completion, error: ProducerError, sent_at: Instant) {
        if completion.listeners.is_empty() {
            return;
        }
        self.submit(CallbackCommand::Failure {
            completion,
            error,
            sent_at,
        });
    }

    /// Waits until every callback submitted so far has run.
    pub async fn drain(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(CallbackCommand::Drain(tx)).is_err() {
            return;
        }
        if rx.await.is_err() {
            debug!("PRODUCER | Callback lane stopped before acknowledging drain");
        }
    }

    fn submit(&self, command: CallbackCommand) {
        if let Err(e) = self.tx.send(command) {
            error!("PRODUCER | Callback lane is gone, dropping callbacks: {e}");
        }
    }
}

pub struct CallbackLane {
    rx: mpsc::UnboundedReceiver<CallbackCommand>,
    monitor: Arc<ProducerMonitor>,
}

impl CallbackLane {
    pub fn new(monitor: Arc<ProducerMonitor>) -> (Self, CallbackHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx, monitor }, CallbackHandle { tx })
    }

    /// Runs until every [`CallbackHandle`] has been dropped.
    pub async fn run(mut self) {
        debug!("PRODUCER | Callback lane started");
        while let Some(command) = self.rx.recv().await {
            match command {
                CallbackCommand::Success {
                    completion,
                    sent_at,
                } => {
                    for listener in &completion.listeners {
                        guarded("on_success", || listener.on_success(&completion.result));
                    }
                    self.monitor.record_on_success(sent_at);
                }
                CallbackCommand::Failure {
                    completion,
                    error,
                    sent_at,
                } => {
                    for listener in &completion.listeners {
                        guarded("on_failure", || {
                            listener.on_failure(&completion.result, &error)
                        });
                    }
                    self.monitor.record_on_failure(sent_at);
                }
                CallbackCommand::Drain(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        debug!("PRODUCER | Callback lane stopped");
    }
}

/// Runs one listener call. A panicking listener is logged and skipped so the
/// lane keeps serving every other caller.
fn guarded(hook: &str, call: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(call)) {
        error!(
            "PRODUCER | Completion listener panicked in {hook}: {}",
            panic_message(payload.as_ref())
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
