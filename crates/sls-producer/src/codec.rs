// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire encoding of a batch: a protobuf `LogGroup`, optionally compressed.

use crate::batch::ProducerBatch;
use crate::config::CompressType;
use crate::errors::ProducerError;
use crate::record::Log;
use bytes::Bytes;
use fnv::FnvHasher;
use prost::Message;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

pub const PACK_ID_TAG: &str = "__pack_id__";

const ZSTD_LEVEL: i32 = 1;

#[derive(Clone, PartialEq, Eq, Message)]
pub struct LogTag {
    #[prost(string, required, tag = "1")]
    pub key: String,
    #[prost(string, required, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct LogGroup {
    #[prost(message, repeated, tag = "1")]
    pub logs: Vec<Log>,
    #[prost(string, optional, tag = "3")]
    pub topic: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub source: Option<String>,
    #[prost(message, repeated, tag = "6")]
    pub log_tags: Vec<LogTag>,
}

/// Serialized batch ready for the transport.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub body: Bytes,
    /// Length of the protobuf body before compression.
    pub raw_size: usize,
}

pub fn build_log_group(batch: &ProducerBatch, log_tags: &[(String, String)]) -> LogGroup {
    let key = batch.key();
    let mut tags: Vec<LogTag> = log_tags
        .iter()
        .map(|(key, value)| LogTag {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    if let Some(pack_id) = batch.pack_id() {
        tags.push(LogTag {
            key: PACK_ID_TAG.to_string(),
            value: pack_id.to_string(),
        });
    }
    LogGroup {
        logs: batch.logs().to_vec(),
        topic: non_empty(&key.topic),
        source: non_empty(&key.source),
        log_tags: tags,
    }
}

pub fn encode_batch(
    batch: &ProducerBatch,
    log_tags: &[(String, String)],
    compress_type: CompressType,
) -> Result<EncodedBatch, ProducerError> {
    let raw = build_log_group(batch, log_tags).encode_to_vec();
    let raw_size = raw.len();
    let body = compress(raw, compress_type)?;
    Ok(EncodedBatch {
        body: Bytes::from(body),
        raw_size,
    })
}

pub fn compress(data: Vec<u8>, compress_type: CompressType) -> Result<Vec<u8>, ProducerError> {
    match compress_type {
        CompressType::None => Ok(data),
        CompressType::Lz4 => Ok(lz4_flex::block::compress(&data)),
        CompressType::Zstd => zstd::stream::encode_all(data.as_slice(), ZSTD_LEVEL)
            .map_err(|e| ProducerError::Codec(format!("zstd: {e}"))),
    }
}

pub fn decompress(
    data: &[u8],
    compress_type: CompressType,
    raw_size: usize,
) -> Result<Vec<u8>, ProducerError> {
    match compress_type {
        CompressType::None => Ok(data.to_vec()),
        CompressType::Lz4 => lz4_flex::block::decompress(data, raw_size)
            .map_err(|e| ProducerError::Codec(format!("lz4: {e}"))),
        CompressType::Zstd => {
            zstd::stream::decode_all(data).map_err(|e| ProducerError::Codec(format!("zstd: {e}")))
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Distinct keys tracked before the generator starts a new prefix generation.
pub const MAX_PACK_ID_KEYS: usize = 65_536;

/// Hands out `__pack_id__` values: a per-producer prefix plus a sequence per key.
///
/// One sequence is kept per key seen. Once `max_keys` are tracked the map is
/// cleared and the seed rotated, so sequences restart under fresh prefixes and
/// no id is ever handed out twice.
#[derive(Debug)]
pub struct PackIdGenerator {
    max_keys: usize,
    state: Mutex<PackIdState>,
}

#[derive(Debug)]
struct PackIdState {
    seed: u64,
    sequences: hashbrown::HashMap<u64, u64>,
}

impl PackIdGenerator {
    pub fn new() -> Self {
        Self::with_max_keys(MAX_PACK_ID_KEYS)
    }

    pub fn with_max_keys(max_keys: usize) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut hasher = FnvHasher::default();
        std::process::id().hash(&mut hasher);
        nanos.hash(&mut hasher);
        Self {
            max_keys: max_keys.max(1),
            state: Mutex::new(PackIdState {
                seed: hasher.finish(),
                sequences: hashbrown::HashMap::new(),
            }),
        }
    }

    pub fn next_id<K: Hash>(&self, key: &K) -> String {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut prefix = prefix_of(state.seed, key);
        if !state.sequences.contains_key(&prefix) && state.sequences.len() >= self.max_keys {
            let mut hasher = FnvHasher::with_key(state.seed);
            state.sequences.len().hash(&mut hasher);
            state.seed = hasher.finish();
            state.sequences.clear();
            prefix = prefix_of(state.seed, key);
        }
        let next = state.sequences.entry(prefix).or_insert(0);
        let sequence = *next;
        *next += 1;
        format!("{prefix:016X}-{sequence:X}")
    }

    pub fn tracked_keys(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .sequences
            .len()
    }
}

fn prefix_of<K: Hash>(seed: u64, key: &K) -> u64 {
    let mut hasher = FnvHasher::with_key(seed);
    key.hash(&mut hasher);
    hasher.finish()
}

impl Default for PackIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
