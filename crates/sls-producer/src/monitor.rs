// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runtime metrics of the producer.
//!
//! Samples accumulate in a single [`ProducerMetrics`] value behind a mutex.
//! Reporting swaps that value for a fresh one in one locked operation, so a
//! sample lands in exactly one reporting window. Nothing here gates delivery.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Latency distribution in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeHistogram {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl TimeHistogram {
    pub fn add_sample(&mut self, micros: f64) {
        if self.count == 0 {
            self.min = micros;
            self.max = micros;
        } else {
            self.min = self.min.min(micros);
            self.max = self.max.max(micros);
        }
        self.count += 1;
        self.sum += micros;
    }

    pub fn add_duration(&mut self, elapsed: Duration) {
        self.add_sample(elapsed.as_micros() as f64);
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

impl fmt::Display for TimeHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count: {}, avg: {:.1}us, min: {:.1}us, max: {:.1}us",
            self.count,
            self.avg(),
            self.min,
            self.max
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProducerMetrics {
    pub send_batch: TimeHistogram,
    pub retry_count: u64,
    pub create_batch: u64,
    pub on_success: TimeHistogram,
    pub on_failure: TimeHistogram,
    pub wait_memory: TimeHistogram,
    pub wait_memory_fail_count: u64,
}

#[derive(Debug, Default)]
pub struct ProducerMonitor {
    metrics: Mutex<ProducerMetrics>,
}

impl ProducerMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn metrics(&self) -> MutexGuard<'_, ProducerMetrics> {
        // Samples are plain counters; a panic mid-update cannot leave them unusable.
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_send(&self, send_cost: Duration) {
        self.metrics().send_batch.add_duration(send_cost);
    }

    pub fn record_retry(&self, send_cost: Duration) {
        let mut metrics = self.metrics();
        metrics.send_batch.add_duration(send_cost);
        metrics.retry_count += 1;
    }

    /// Latency between the end of the send and the end of the success callbacks.
    pub fn record_on_success(&self, send_end: Instant) {
        self.metrics().on_success.add_duration(send_end.elapsed());
    }

    pub fn record_on_failure(&self, send_end: Instant) {
        self.metrics().on_failure.add_duration(send_end.elapsed());
    }

    pub fn record_wait_memory(&self, waited: Duration) {
        self.metrics().wait_memory.add_duration(waited);
    }

    pub fn inc_wait_memory_fail(&self) {
        self.metrics().wait_memory_fail_count += 1;
    }

    pub fn inc_create_batch(&self) {
        self.metrics().create_batch += 1;
    }

    /// Returns the metrics collected since the previous call and starts a new window.
    pub fn snapshot_and_reset(&self) -> ProducerMetrics {
        std::mem::take(&mut *self.metrics())
    }

    /// Logs a snapshot every `interval` until `cancel` fires.
    pub async fn report(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let metrics = self.snapshot_and_reset();
                    info!(
                        send_batch = %metrics.send_batch,
                        retry_count = metrics.retry_count,
                        create_batch = metrics.create_batch,
                        on_success = %metrics.on_success,
                        on_failure = %metrics.on_failure,
                        wait_memory = %metrics.wait_memory,
                        wait_memory_fail_count = metrics.wait_memory_fail_count,
                        "PRODUCER | report status"
                    );
                }
                _ = cancel.cancelled() => {
                    debug!("PRODUCER | Monitor reporter stopped");
                    return;
                }
            }
        }
    }
}
