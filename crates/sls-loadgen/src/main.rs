// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::{env, sync::Arc};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sls_producer::{
    CompletionListener, Credentials, CredentialsProvider, Destination, HttpTransport,
    HttpTransportConfig, Log, Producer, ProducerConfig, ProducerError, ProducerResult,
};

const DEFAULT_LOG_COUNT: usize = 10_000;
const DEFAULT_SENDERS: usize = 4;
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Default)]
struct DeliveryCounter {
    delivered: AtomicUsize,
    failed: AtomicUsize,
}

impl CompletionListener for DeliveryCounter {
    fn on_success(&self, result: &ProducerResult) {
        self.delivered.fetch_add(result.log_count, Ordering::Relaxed);
    }

    fn on_failure(&self, result: &ProducerResult, error: &ProducerError) {
        self.failed.fetch_add(result.log_count, Ordering::Relaxed);
        warn!(
            "Batch of {} logs for {}/{} failed after {} attempts: {error}",
            result.log_count, result.key.project, result.key.logstore, result.attempt_count
        );
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|val| val.parse::<T>().ok())
        .unwrap_or(default)
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("SLS_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let Ok(endpoint) = env::var("SLS_ENDPOINT") else {
        error!("SLS_ENDPOINT is not set. Shutting down.");
        return;
    };
    let (Ok(project), Ok(logstore)) = (env::var("SLS_PROJECT"), env::var("SLS_LOGSTORE")) else {
        error!("SLS_PROJECT and SLS_LOGSTORE must be set. Shutting down.");
        return;
    };
    let topic = env::var("SLS_TOPIC").unwrap_or_default();
    let log_count = env_or("SLS_LOADGEN_COUNT", DEFAULT_LOG_COUNT);
    let senders = env_or("SLS_LOADGEN_SENDERS", DEFAULT_SENDERS).max(1);
    let close_timeout = env::var("SLS_CLOSE_TIMEOUT_SECS")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_CLOSE_TIMEOUT);

    let credentials = CredentialsProvider::new_from_static(Credentials {
        access_key_id: env::var("SLS_ACCESS_KEY_ID").unwrap_or_default(),
        access_key_secret: env::var("SLS_ACCESS_KEY_SECRET").unwrap_or_default(),
        security_token: env::var("SLS_SECURITY_TOKEN").ok(),
    });
    let https_proxy = env::var("SLS_PROXY_HTTPS")
        .or_else(|_| env::var("HTTPS_PROXY"))
        .ok();

    let config = match ProducerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading producer config: {e}");
            return;
        }
    };

    let transport = match HttpTransport::new(
        HttpTransportConfig {
            https_proxy,
            timeout: HTTP_TIMEOUT,
            ..HttpTransportConfig::new(endpoint)
        },
        credentials,
    ) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("Error creating HTTP transport: {e}");
            return;
        }
    };

    let producer = match Producer::new(config, transport) {
        Ok(producer) => Arc::new(producer),
        Err(e) => {
            error!("Error starting producer: {e}");
            return;
        }
    };

    info!("Sending {log_count} logs to {project}/{logstore} from {senders} senders");
    let counter = Arc::new(DeliveryCounter::default());
    let destination = Destination::new(project, logstore).topic(topic);
    let start = Instant::now();

    let tasks: Vec<_> = (0..senders)
        .map(|sender| {
            let producer = Arc::clone(&producer);
            let counter = Arc::clone(&counter);
            let destination = destination.clone();
            let share = log_count / senders + usize::from(sender < log_count % senders);
            tokio::spawn(async move {
                for i in 0..share {
                    let log = Log::from_pairs([
                        ("sender", sender.to_string()),
                        ("seq", i.to_string()),
                        ("message", format!("synthetic log {i} from sender {sender}")),
                    ]);
                    if let Err(e) = producer
                        .send_log_with_callback(destination.clone(), log, counter.clone())
                        .await
                    {
                        error!("Sender {sender} stopped: {e}");
                        return;
                    }
                }
            })
        })
        .collect();

    for task in tasks {
        if let Err(e) = task.await {
            error!("Sender task failed: {e}");
        }
    }

    if let Err(e) = producer.close(close_timeout).await {
        error!("Error closing producer: {e}");
    }

    info!(
        "Done in {} ms: {} delivered, {} failed",
        start.elapsed().as_millis(),
        counter.delivered.load(Ordering::Relaxed),
        counter.failed.load(Ordering::Relaxed)
    );
}
