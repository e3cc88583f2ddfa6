// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::errors::ProducerError;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "SLS_PRODUCER_";

/// Compression applied to a serialized batch before it is handed to the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressType {
    None,
    #[default]
    Lz4,
    Zstd,
}

impl CompressType {
    /// Value of the `x-log-compresstype` header, `None` when the body is sent as is.
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            CompressType::None => None,
            CompressType::Lz4 => Some("lz4"),
            CompressType::Zstd => Some("zstd"),
        }
    }
}

impl FromStr for CompressType {
    type Err = ProducerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "" => Ok(CompressType::None),
            "lz4" => Ok(CompressType::Lz4),
            "zstd" => Ok(CompressType::Zstd),
            other => Err(ProducerError::InvalidConfig(format!(
                "unknown compress type '{other}', expected one of: none, lz4, zstd"
            ))),
        }
    }
}

/// Tuning knobs for batching, memory, dispatch and retries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Upper bound of bytes held by batches that have not reached a terminal outcome.
    pub total_size_in_bytes: usize,
    pub max_io_worker_count: usize,
    /// How long `add_log` may wait for memory. `0` fails fast, negative waits forever.
    pub max_block_sec: i64,
    pub max_batch_size: usize,
    pub max_batch_count: usize,
    pub linger_ms: u64,
    pub retries: u32,
    pub max_reserved_attempts: u32,
    pub base_retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    pub no_retry_status_codes: HashSet<u16>,
    pub compress_type: CompressType,
    /// Number of lock shards guarding the open-batch map.
    pub key_bucket_count: usize,
    /// Safety cap: a batch is never grown by an append that would reach this size.
    pub hard_size_ceiling: usize,
    /// Dispatch queue capacity is `max_io_worker_count * queue_backlog_factor`.
    pub queue_backlog_factor: usize,
    pub generate_pack_id: bool,
    /// Snap non-empty shard hashes to one of `shard_hash_buckets` range boundaries
    /// before they become part of the batch key.
    pub adjust_shard_hash: bool,
    /// Power of two between 1 and 256.
    pub shard_hash_buckets: usize,
    pub log_tags: Vec<(String, String)>,
    pub monitor_report_interval_ms: u64,
    pub disable_runtime_metrics: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            total_size_in_bytes: 100 * 1024 * 1024,
            max_io_worker_count: 50,
            max_block_sec: 60,
            max_batch_size: 512 * 1024,
            max_batch_count: 4096,
            linger_ms: 2000,
            retries: 10,
            max_reserved_attempts: 11,
            base_retry_backoff_ms: 100,
            max_retry_backoff_ms: 50 * 1000,
            no_retry_status_codes: HashSet::from([400, 404]),
            compress_type: CompressType::Lz4,
            key_bucket_count: 64,
            hard_size_ceiling: 5 * 1024 * 1024,
            queue_backlog_factor: 4,
            generate_pack_id: false,
            adjust_shard_hash: true,
            shard_hash_buckets: 64,
            log_tags: Vec::new(),
            monitor_report_interval_ms: 60 * 1000,
            disable_runtime_metrics: false,
        }
    }
}

impl ProducerConfig {
    /// Defaults overridden by `SLS_PRODUCER_*` environment variables.
    pub fn from_env() -> Result<Self, ProducerError> {
        let mut config = Self::default();

        override_from_env("TOTAL_SIZE_IN_BYTES", &mut config.total_size_in_bytes)?;
        override_from_env("MAX_IO_WORKER_COUNT", &mut config.max_io_worker_count)?;
        override_from_env("MAX_BLOCK_SEC", &mut config.max_block_sec)?;
        override_from_env("MAX_BATCH_SIZE", &mut config.max_batch_size)?;
        override_from_env("MAX_BATCH_COUNT", &mut config.max_batch_count)?;
        override_from_env("LINGER_MS", &mut config.linger_ms)?;
        override_from_env("RETRIES", &mut config.retries)?;
        override_from_env("MAX_RESERVED_ATTEMPTS", &mut config.max_reserved_attempts)?;
        override_from_env("BASE_RETRY_BACKOFF_MS", &mut config.base_retry_backoff_ms)?;
        override_from_env("MAX_RETRY_BACKOFF_MS", &mut config.max_retry_backoff_ms)?;
        override_from_env("COMPRESS_TYPE", &mut config.compress_type)?;
        override_from_env("KEY_BUCKET_COUNT", &mut config.key_bucket_count)?;
        override_from_env("HARD_SIZE_CEILING", &mut config.hard_size_ceiling)?;
        override_from_env("QUEUE_BACKLOG_FACTOR", &mut config.queue_backlog_factor)?;
        override_from_env("GENERATE_PACK_ID", &mut config.generate_pack_id)?;
        override_from_env("ADJUST_SHARD_HASH", &mut config.adjust_shard_hash)?;
        override_from_env("SHARD_HASH_BUCKETS", &mut config.shard_hash_buckets)?;
        override_from_env(
            "MONITOR_REPORT_INTERVAL_MS",
            &mut config.monitor_report_interval_ms,
        )?;
        override_from_env(
            "DISABLE_RUNTIME_METRICS",
            &mut config.disable_runtime_metrics,
        )?;

        if let Ok(codes) = env::var(format!("{ENV_PREFIX}NO_RETRY_STATUS_CODES")) {
            config.no_retry_status_codes = parse_status_codes(&codes)?;
        }
        if let Ok(tags) = env::var(format!("{ENV_PREFIX}LOG_TAGS")) {
            config.log_tags = parse_log_tags(&tags);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProducerError> {
        let positive = [
            ("total_size_in_bytes", self.total_size_in_bytes),
            ("max_io_worker_count", self.max_io_worker_count),
            ("max_batch_size", self.max_batch_size),
            ("max_batch_count", self.max_batch_count),
            ("key_bucket_count", self.key_bucket_count),
            ("queue_backlog_factor", self.queue_backlog_factor),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ProducerError::InvalidConfig(format!(
                "{name} must be greater than 0"
            )));
        }

        // The memory guard hands out one semaphore permit per byte.
        if self.total_size_in_bytes > u32::MAX as usize {
            return Err(ProducerError::InvalidConfig(format!(
                "total_size_in_bytes must not exceed {} bytes",
                u32::MAX
            )));
        }

        if self.hard_size_ceiling < self.max_batch_size {
            return Err(ProducerError::InvalidConfig(format!(
                "hard_size_ceiling ({}) must not be smaller than max_batch_size ({})",
                self.hard_size_ceiling, self.max_batch_size
            )));
        }

        if self.base_retry_backoff_ms > self.max_retry_backoff_ms {
            return Err(ProducerError::InvalidConfig(format!(
                "base_retry_backoff_ms ({}) must not exceed max_retry_backoff_ms ({})",
                self.base_retry_backoff_ms, self.max_retry_backoff_ms
            )));
        }

        if !self.shard_hash_buckets.is_power_of_two() || self.shard_hash_buckets > 256 {
            return Err(ProducerError::InvalidConfig(format!(
                "shard_hash_buckets ({}) must be a power of two between 1 and 256",
                self.shard_hash_buckets
            )));
        }

        if self.linger_ms == 0 {
            return Err(ProducerError::InvalidConfig(
                "linger_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    /// `None` means wait for memory without a deadline.
    pub fn max_block(&self) -> Option<Duration> {
        u64::try_from(self.max_block_sec)
            .ok()
            .map(Duration::from_secs)
    }

    pub fn queue_capacity(&self) -> usize {
        self.max_io_worker_count
            .saturating_mul(self.queue_backlog_factor)
            .max(1)
    }

    pub fn monitor_report_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_report_interval_ms.max(1))
    }
}

fn override_from_env<T>(name: &str, target: &mut T) -> Result<(), ProducerError>
where
    T: FromStr,
{
    let key = format!("{ENV_PREFIX}{name}");
    if let Ok(raw) = env::var(&key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ProducerError::InvalidConfig(format!("{key} has invalid value '{raw}'")))?;
    }
    Ok(())
}

/// Parses a comma separated list such as `400,404`.
pub fn parse_status_codes(raw: &str) -> Result<HashSet<u16>, ProducerError> {
    raw.split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(|code| {
            code.parse::<u16>().map_err(|_| {
                ProducerError::InvalidConfig(format!("'{code}' is not a valid HTTP status code"))
            })
        })
        .collect()
}

/// Parses `key:value` pairs separated by commas or whitespace; malformed pairs are skipped.
pub fn parse_log_tags(raw: &str) -> Vec<(String, String)> {
    raw.replace(',', " ")
        .split_whitespace()
        .filter_map(|kv| {
            let (key, value) = kv.split_once(':')?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProducerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_capacity(), 200);
        assert_eq!(config.max_block(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_negative_max_block_waits_forever() {
        let config = ProducerConfig {
            max_block_sec: -1,
            ..Default::default()
        };
        assert_eq!(config.max_block(), None);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        for config in [
            ProducerConfig {
                max_batch_count: 0,
                ..Default::default()
            },
            ProducerConfig {
                key_bucket_count: 0,
                ..Default::default()
            },
            ProducerConfig {
                max_io_worker_count: 0,
                ..Default::default()
            },
            ProducerConfig {
                total_size_in_bytes: 0,
                ..Default::default()
            },
        ] {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }

    #[test]
    fn test_validate_ceiling_below_batch_size() {
        let config = ProducerConfig {
            max_batch_size: 1024,
            hard_size_ceiling: 512,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_shard_hash_buckets() {
        for buckets in [0, 3, 100, 512] {
            let config = ProducerConfig {
                shard_hash_buckets: buckets,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{buckets} buckets should be rejected");
        }
        for buckets in [1, 2, 64, 256] {
            let config = ProducerConfig {
                shard_hash_buckets: buckets,
                ..Default::default()
            };
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn test_validate_backoff_order() {
        let config = ProducerConfig {
            base_retry_backoff_ms: 1000,
            max_retry_backoff_ms: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_compress_type_from_str() {
        assert_eq!("LZ4".parse::<CompressType>().unwrap(), CompressType::Lz4);
        assert_eq!(" zstd ".parse::<CompressType>().unwrap(), CompressType::Zstd);
        assert_eq!("none".parse::<CompressType>().unwrap(), CompressType::None);
        assert!("gzip".parse::<CompressType>().is_err());
    }

    #[test]
    fn test_parse_status_codes() {
        assert_eq!(
            parse_status_codes("400, 404,413").unwrap(),
            HashSet::from([400, 404, 413])
        );
        assert!(parse_status_codes("").unwrap().is_empty());
        assert!(parse_status_codes("40x").is_err());
    }

    #[test]
    fn test_parse_log_tags() {
        assert_eq!(
            parse_log_tags("env:prod, region:cn-hangzhou broken :nokey"),
            vec![
                ("env".to_string(), "prod".to_string()),
                ("region".to_string(), "cn-hangzhou".to_string()),
            ]
        );
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: ProducerConfig = serde_json::from_str(
            r#"{"max_batch_count": 10, "compress_type": "zstd", "no_retry_status_codes": [401]}"#,
        )
        .expect("config should deserialize");
        assert_eq!(config.max_batch_count, 10);
        assert_eq!(config.compress_type, CompressType::Zstd);
        assert_eq!(config.no_retry_status_codes, HashSet::from([401]));
        assert_eq!(config.linger_ms, 2000);
    }
}
