// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging and metrics of the host device allocator.

mod logging;
mod metrics;

use std::sync::LockResult;

pub use log::Level::*;
pub use log::{warn, *};

pub use crate::logger::logging::{
    DEFAULT_INSTANCE_ID, DEFAULT_LEVEL, INSTANCE_ID, LOGGER, LevelFilter, LevelFilterFromStrError,
    LocalTime, Logger, LoggerConfig, LoggerInitError, LoggerUpdateError,
};
pub use crate::logger::metrics::{
    AllocatorMetrics, HostDevMetrics, IncMetric, LoggerSystemMetrics, METRICS, Metrics,
    MetricsError, SharedIncMetric,
};

/// Alias for `std::io::LineWriter<std::fs::File>`.
pub type HostDevLineWriter = std::io::LineWriter<std::fs::File>;

pub(crate) fn extract_guard<G>(lock_result: LockResult<G>) -> G {
    match lock_result {
        Ok(guard) => guard,
        // If a thread panics while holding this lock, the writer within should still be usable.
        Err(poisoned) => poisoned.into_inner(),
    }
}
