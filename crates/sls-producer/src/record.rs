// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use fnv::FnvHasher;
use std::hash::Hasher;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct LogContent {
    #[prost(string, required, tag = "1")]
    pub key: String,
    #[prost(string, required, tag = "2")]
    pub value: String,
}

/// A single log record: ordered key/value contents plus a timestamp in seconds.
///
/// Records are immutable once handed to the producer. The struct doubles as the
/// `Log` message of the wire format.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Log {
    #[prost(uint32, required, tag = "1")]
    pub time: u32,
    #[prost(message, repeated, tag = "2")]
    pub contents: Vec<LogContent>,
}

impl Log {
    pub fn new(time: u32, contents: Vec<LogContent>) -> Self {
        Self { time, contents }
    }

    /// Builds a record stamped with the current time.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
            .unwrap_or_default();
        Self::with_time(time, pairs)
    }

    pub fn with_time<K, V>(time: u32, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            time,
            contents: pairs
                .into_iter()
                .map(|(key, value)| LogContent {
                    key: key.into(),
                    value: value.into(),
                })
                .collect(),
        }
    }
}

/// Where a record goes. Records with equal destinations share the same open batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Destination {
    pub project: String,
    pub logstore: String,
    pub topic: String,
    pub source: String,
    /// Shard routing hint; empty lets the server load-balance.
    pub shard_hash: String,
}

impl Destination {
    pub fn new(project: impl Into<String>, logstore: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            logstore: logstore.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    #[must_use]
    pub fn shard_hash(mut self, shard_hash: impl Into<String>) -> Self {
        self.shard_hash = shard_hash.into();
        self
    }
}

/// Maps any shard hash onto the lower boundary of one of `buckets` equal
/// ranges of the 128-bit hash space, as a 32 digit hex route key.
///
/// `buckets` must be a power of two. Equal inputs always land on the same boundary.
pub fn adjust_shard_hash(shard_hash: &str, buckets: usize) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(shard_hash.as_bytes());
    let bits = buckets.max(1).trailing_zeros();
    let mask = u64::MAX.checked_shl(64 - bits).unwrap_or(0);
    format!("{:016x}{:016x}", avalanche(hasher.finish()) & mask, 0u64)
}

/// Mixes every input byte into the high bits the bucket is taken from.
fn avalanche(mut hash: u64) -> u64 {
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^ (hash >> 33)
}
