// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte cost of records, used both for batch thresholds and for the memory budget.

use crate::record::Log;

/// Bytes accounted for the timestamp of every record.
pub const TIME_SIZE: usize = 4;

pub fn log_size(log: &Log) -> usize {
    TIME_SIZE
        + log
            .contents
            .iter()
            .map(|content| content.key.len() + content.value.len())
            .sum::<usize>()
}

pub fn log_list_size(logs: &[Log]) -> usize {
    logs.iter().map(log_size).sum()
}
