// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Routes incoming records to the open batch of their key and decides when a
//! batch is sealed.
//!
//! Open batches live in a fixed number of buckets, each a map behind its own
//! async mutex. A batch is removed from its bucket and pushed into the
//! dispatch queue while the bucket lock is still held, so no record can be
//! appended after a seal and batches of one key enter the queue in the order
//! they were sealed.

use crate::batch::{BatchKey, ProducerBatch, SealReason};
use crate::callback::CompletionListener;
use crate::codec::PackIdGenerator;
use crate::config::ProducerConfig;
use crate::dispatcher::PendingTracker;
use crate::errors::ProducerError;
use crate::memory::{MemoryGuard, Reservation};
use crate::monitor::ProducerMonitor;
use crate::record::{self, Log};
use crate::size;
use fnv::FnvHasher;
use hashbrown::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

type Bucket = Mutex<HashMap<BatchKey, ProducerBatch>>;

pub struct LogAccumulator {
    buckets: Vec<Bucket>,
    config: Arc<ProducerConfig>,
    memory: Arc<MemoryGuard>,
    monitor: Arc<ProducerMonitor>,
    pending: Arc<PendingTracker>,
    queue: mpsc::Sender<ProducerBatch>,
    pack_ids: Option<PackIdGenerator>,
    shutdown: AtomicBool,
}

impl LogAccumulator {
    pub fn new(
        config: Arc<ProducerConfig>,
        memory: Arc<MemoryGuard>,
        monitor: Arc<ProducerMonitor>,
        pending: Arc<PendingTracker>,
        queue: mpsc::Sender<ProducerBatch>,
    ) -> Self {
        let buckets = (0..config.key_bucket_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        let pack_ids = config.generate_pack_id.then(PackIdGenerator::new);
        Self {
            buckets,
            config,
            memory,
            monitor,
            pending,
            queue,
            pack_ids,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Rejects every later `add_log`. Batches already open stay until flushed.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Admits `logs` into the open batch of `key`, sealing batches as needed.
    ///
    /// Blocks while the memory budget is exhausted, up to `max_block_sec`.
    pub async fn add_log(
        &self,
        key: BatchKey,
        logs: Vec<Log>,
        listener: Option<Arc<dyn CompletionListener>>,
    ) -> Result<(), ProducerError> {
        if self.is_shutting_down() {
            warn!("PRODUCER | Producer is shutting down and cannot accept new logs");
            return Err(ProducerError::Shutdown);
        }
        validate(&key, &logs)?;
        let key = self.route(key);

        let bytes = size::log_list_size(&logs);
        if bytes > self.config.hard_size_ceiling {
            return Err(ProducerError::InvalidRecord(format!(
                "{bytes} bytes exceeds the hard size ceiling of {} bytes",
                self.config.hard_size_ceiling
            )));
        }

        let admission = match self.memory.reserve(bytes, self.config.max_block()).await {
            Ok(admission) => admission,
            Err(err) => {
                if let ProducerError::QuotaExceeded { .. } = err {
                    self.monitor.inc_wait_memory_fail();
                    warn!(
                        "PRODUCER | No memory for {bytes} bytes ({} of {} reserved): {err}",
                        self.memory.reserved(),
                        self.memory.budget()
                    );
                }
                return Err(err);
            }
        };
        if let Some(waited) = admission.waited {
            self.monitor.record_wait_memory(waited);
        }
        let reservation = admission.reservation;
        let count = logs.len();
        let max_size = self.config.max_batch_size;
        let max_count = self.config.max_batch_count;

        let mut bucket = self.bucket(&key).lock().await;
        // Checked again under the lock: a flush that already swept this bucket
        // must not be followed by a new open batch.
        if self.is_shutting_down() {
            return Err(ProducerError::Shutdown);
        }

        if let Some(batch) = bucket.get_mut(&key) {
            let new_size = batch.total_size() + bytes;
            let new_count = batch.log_count() + count;

            if new_size > max_size
                && new_size < self.config.hard_size_ceiling
                && new_count <= max_count
            {
                batch.append(logs, listener, reservation);
                if let Some(batch) = bucket.remove(&key) {
                    self.dispatch(batch, SealReason::Size).await;
                }
                return Ok(());
            }

            if new_size <= max_size && new_count <= max_count {
                batch.append(logs, listener, reservation);
                if let Some(reason) = batch.is_full(max_size, max_count) {
                    if let Some(batch) = bucket.remove(&key) {
                        self.dispatch(batch, reason).await;
                    }
                }
                return Ok(());
            }

            let reason = if new_count > max_count {
                SealReason::Count
            } else {
                SealReason::Size
            };
            if let Some(full) = bucket.remove(&key) {
                self.dispatch(full, reason).await;
            }
        }

        let batch = self.create_batch(key.clone(), logs, listener, reservation);
        match batch.is_full(max_size, max_count) {
            Some(reason) => self.dispatch(batch, reason).await,
            None => {
                bucket.insert(key, batch);
            }
        }
        Ok(())
    }

    /// Seals every open batch older than `linger`. Returns how many were sealed.
    pub async fn seal_expired(&self, linger: Duration) -> usize {
        let mut sealed = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().await;
            let expired: Vec<BatchKey> = bucket
                .iter()
                .filter(|(_, batch)| batch.created_at().elapsed() >= linger)
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                if let Some(batch) = bucket.remove(&key) {
                    self.dispatch(batch, SealReason::Linger).await;
                    sealed += 1;
                }
            }
        }
        sealed
    }

    /// Seals every open batch whose key matches `filter`.
    pub async fn flush<F>(&self, filter: F) -> usize
    where
        F: Fn(&BatchKey) -> bool,
    {
        let mut sealed = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().await;
            let matching: Vec<BatchKey> = bucket.keys().filter(|key| filter(*key)).cloned().collect();
            for key in matching {
                if let Some(batch) = bucket.remove(&key) {
                    self.dispatch(batch, SealReason::Flush).await;
                    sealed += 1;
                }
            }
        }
        sealed
    }

    pub async fn flush_all(&self) -> usize {
        self.flush(|_| true).await
    }

    pub async fn open_batch_count(&self) -> usize {
        let mut open = 0;
        for bucket in &self.buckets {
            open += bucket.lock().await.len();
        }
        open
    }

    fn route(&self, mut key: BatchKey) -> BatchKey {
        if self.config.adjust_shard_hash && !key.shard_hash.is_empty() {
            key.shard_hash =
                record::adjust_shard_hash(&key.shard_hash, self.config.shard_hash_buckets);
        }
        key
    }

    fn bucket(&self, key: &BatchKey) -> &Bucket {
        let mut hasher = FnvHasher::default();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.buckets.len() as u64) as usize;
        &self.buckets[index]
    }

    fn create_batch(
        &self,
        key: BatchKey,
        logs: Vec<Log>,
        listener: Option<Arc<dyn CompletionListener>>,
        reservation: Reservation,
    ) -> ProducerBatch {
        let mut batch = ProducerBatch::new(key, self.config.max_reserved_attempts);
        if let Some(pack_ids) = &self.pack_ids {
            batch.set_pack_id(pack_ids.next_id(batch.key()));
        }
        batch.append(logs, listener, reservation);
        self.monitor.inc_create_batch();
        debug!(
            "PRODUCER | Created batch for {}/{}",
            batch.key().project,
            batch.key().logstore
        );
        batch
    }

    /// Hands a batch removed from its bucket to the dispatcher.
    async fn dispatch(&self, mut batch: ProducerBatch, reason: SealReason) {
        batch.seal();
        debug!(
            "PRODUCER | Sealed batch for {}/{} on {reason}: {} logs, {} bytes",
            batch.key().project,
            batch.key().logstore,
            batch.log_count(),
            batch.total_size()
        );
        self.pending.add();
        if let Err(mpsc::error::SendError(batch)) = self.queue.send(batch).await {
            error!(
                "PRODUCER | Dispatcher stopped, dropping batch of {} logs for {}/{}",
                batch.log_count(),
                batch.key().project,
                batch.key().logstore
            );
            drop(batch);
            self.pending.done();
        }
    }
}

fn validate(key: &BatchKey, logs: &[Log]) -> Result<(), ProducerError> {
    if key.project.is_empty() || key.logstore.is_empty() {
        return Err(ProducerError::InvalidRecord(
            "project and logstore must not be empty".to_string(),
        ));
    }
    if logs.is_empty() {
        return Err(ProducerError::InvalidRecord("empty log list".to_string()));
    }
    Ok(())
}
