// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::accumulator::LogAccumulator;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MAX_SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically seals batches that stayed open longer than the linger bound.
pub struct LingerTimer {
    accumulator: Arc<LogAccumulator>,
    linger: Duration,
    cancel: CancellationToken,
}

impl LingerTimer {
    pub fn new(
        accumulator: Arc<LogAccumulator>,
        linger: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            accumulator,
            linger,
            cancel,
        }
    }

    /// Sweep period: fine enough that a batch is sealed shortly after it expires.
    pub fn sweep_interval(&self) -> Duration {
        self.linger.clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sealed = self.accumulator.seal_expired(self.linger).await;
                    if sealed > 0 {
                        debug!("PRODUCER | Linger sealed {sealed} batches");
                    }
                }
                _ = self.cancel.cancelled() => {
                    debug!("PRODUCER | Linger timer stopped");
                    return;
                }
            }
        }
    }
}
