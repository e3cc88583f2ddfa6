// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The producer engine: owns the accumulator, the background tasks and the
//! shared budget, and exposes the calls applications use.

use crate::accumulator::LogAccumulator;
use crate::callback::{CallbackHandle, CallbackLane, CompletionListener};
use crate::config::ProducerConfig;
use crate::dispatcher::{Dispatcher, PendingTracker};
use crate::errors::ProducerError;
use crate::linger::LingerTimer;
use crate::memory::MemoryGuard;
use crate::monitor::ProducerMonitor;
use crate::record::{Destination, Log};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Batches logs per destination and ships them in the background.
///
/// Must be created inside a tokio runtime. Call [`Producer::close`] or
/// [`Producer::safe_close`] before dropping it: dropping stops the background
/// tasks and discards batches that were not delivered yet.
pub struct Producer {
    accumulator: Arc<LogAccumulator>,
    pending: Arc<PendingTracker>,
    callbacks: CallbackHandle,
    memory: Arc<MemoryGuard>,
    monitor: Arc<ProducerMonitor>,
    cancel: CancellationToken,
}

impl Producer {
    pub fn new(config: ProducerConfig, transport: Arc<dyn Transport>) -> Result<Self, ProducerError> {
        config.validate()?;
        let config = Arc::new(config);

        let monitor = Arc::new(ProducerMonitor::new());
        let memory = Arc::new(MemoryGuard::new(config.total_size_in_bytes));
        let pending = Arc::new(PendingTracker::new());
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(config.queue_capacity());

        let (lane, callbacks) = CallbackLane::new(Arc::clone(&monitor));
        tokio::spawn(lane.run());

        let dispatcher = Dispatcher::new(
            &config,
            rx,
            tx.clone(),
            transport,
            callbacks.clone(),
            Arc::clone(&monitor),
            Arc::clone(&pending),
            cancel.child_token(),
        );
        tokio::spawn(dispatcher.run());

        let accumulator = Arc::new(LogAccumulator::new(
            Arc::clone(&config),
            Arc::clone(&memory),
            Arc::clone(&monitor),
            Arc::clone(&pending),
            tx,
        ));
        tokio::spawn(
            LingerTimer::new(Arc::clone(&accumulator), config.linger(), cancel.child_token()).run(),
        );

        if config.disable_runtime_metrics {
            debug!("PRODUCER | Runtime metrics reporting disabled");
        } else {
            let monitor = Arc::clone(&monitor);
            let interval = config.monitor_report_interval();
            let cancel = cancel.child_token();
            tokio::spawn(async move { monitor.report(interval, cancel).await });
        }

        info!(
            "PRODUCER | Started with {} workers, {} byte budget, batches up to {} bytes / {} logs, linger {} ms",
            config.max_io_worker_count,
            config.total_size_in_bytes,
            config.max_batch_size,
            config.max_batch_count,
            config.linger_ms
        );

        Ok(Self {
            accumulator,
            pending,
            callbacks,
            memory,
            monitor,
            cancel,
        })
    }

    /// Admits `logs` for `destination`. `listener`, if any, hears the outcome of
    /// the batch the logs end up in.
    pub async fn add_log(
        &self,
        destination: Destination,
        logs: Vec<Log>,
        listener: Option<Arc<dyn CompletionListener>>,
    ) -> Result<(), ProducerError> {
        self.accumulator.add_log(destination, logs, listener).await
    }

    pub async fn send_log(&self, destination: Destination, log: Log) -> Result<(), ProducerError> {
        self.add_log(destination, vec![log], None).await
    }

    pub async fn send_log_with_callback(
        &self,
        destination: Destination,
        log: Log,
        listener: Arc<dyn CompletionListener>,
    ) -> Result<(), ProducerError> {
        self.add_log(destination, vec![log], Some(listener)).await
    }

    pub async fn send_log_list(
        &self,
        destination: Destination,
        logs: Vec<Log>,
    ) -> Result<(), ProducerError> {
        self.add_log(destination, logs, None).await
    }

    pub async fn send_log_list_with_callback(
        &self,
        destination: Destination,
        logs: Vec<Log>,
        listener: Arc<dyn CompletionListener>,
    ) -> Result<(), ProducerError> {
        self.add_log(destination, logs, Some(listener)).await
    }

    /// Seals the open batches whose destination matches `filter` right away.
    pub async fn flush<F>(&self, filter: F) -> usize
    where
        F: Fn(&Destination) -> bool,
    {
        self.accumulator.flush(filter).await
    }

    pub async fn flush_all(&self) -> usize {
        self.accumulator.flush_all().await
    }

    /// Stops accepting logs and delivers everything already admitted.
    ///
    /// Returns [`ProducerError::CloseTimeout`] if batches are still in flight
    /// after `timeout`; they keep draining in the background and the
    /// remaining tasks stop once they are done.
    pub async fn close(&self, timeout: Duration) -> Result<(), ProducerError> {
        info!("PRODUCER | Closing, waiting up to {} ms", timeout.as_millis());
        self.accumulator.begin_shutdown();

        let drained = tokio::time::timeout(
            timeout,
            drain(&self.accumulator, &self.pending, &self.callbacks),
        )
        .await;
        if drained.is_ok() {
            self.cancel.cancel();
            info!("PRODUCER | Closed");
            return Ok(());
        }

        warn!(
            "PRODUCER | Close timed out with {} batches pending and {} bytes reserved",
            self.pending.count(),
            self.memory.reserved()
        );
        let accumulator = Arc::clone(&self.accumulator);
        let pending = Arc::clone(&self.pending);
        let callbacks = self.callbacks.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            drain(&accumulator, &pending, &callbacks).await;
            cancel.cancel();
            debug!("PRODUCER | Background drain finished");
        });
        Err(ProducerError::CloseTimeout(timeout))
    }

    /// Like [`Producer::close`] without a deadline.
    pub async fn safe_close(&self) {
        info!("PRODUCER | Closing, waiting for every batch");
        self.accumulator.begin_shutdown();
        drain(&self.accumulator, &self.pending, &self.callbacks).await;
        self.cancel.cancel();
        info!("PRODUCER | Closed");
    }

    /// Bytes currently reserved by batches that have not reached a terminal state.
    pub fn memory_reserved(&self) -> usize {
        self.memory.reserved()
    }

    /// Sealed batches that are queued, in flight or waiting for a retry.
    pub fn pending_batches(&self) -> usize {
        self.pending.count()
    }

    pub async fn open_batches(&self) -> usize {
        self.accumulator.open_batch_count().await
    }

    pub fn monitor(&self) -> &ProducerMonitor {
        &self.monitor
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        // After a close the tasks are stopped by the close itself or by its
        // background drain.
        if !self.accumulator.is_shutting_down() {
            warn!("PRODUCER | Dropped without close, undelivered logs are discarded");
            self.cancel.cancel();
        }
    }
}

async fn drain(accumulator: &LogAccumulator, pending: &PendingTracker, callbacks: &CallbackHandle) {
    let sealed = accumulator.flush_all().await;
    debug!("PRODUCER | Sealed {sealed} open batches for shutdown");
    pending.wait_idle().await;
    callbacks.drain().await;
}
