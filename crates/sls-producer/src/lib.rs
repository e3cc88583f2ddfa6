// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer-side batching for Log Service logstores.
//!
//! Records are grouped per destination into batches bounded by size, count
//! and age, held against a global memory budget, and delivered by a bounded
//! pool of workers with retries. Outcomes reach the caller through
//! [`CompletionListener`]s.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod accumulator;
pub mod batch;
pub mod callback;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod errors;
pub mod linger;
pub mod memory;
pub mod monitor;
pub mod producer;
pub mod record;
pub mod retry;
pub mod size;
pub mod transport;

pub use batch::{Attempt, BatchKey, ProducerResult};
pub use callback::CompletionListener;
pub use config::{CompressType, ProducerConfig};
pub use credentials::{
    Credentials, CredentialsProvider, CredentialsResolverFn, ExpiringCredentials,
};
pub use errors::{ProducerError, TransportError};
pub use producer::Producer;
pub use record::{Destination, Log, LogContent};
pub use transport::{HttpTransport, HttpTransportConfig, SendRequest, SendResponse, Transport};
