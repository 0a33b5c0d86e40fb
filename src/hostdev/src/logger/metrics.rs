// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Defines the metrics system.
//!
//! Metrics are flushed in JSON format on request, one object per line:
//!
//! ```json
//! {
//!   "allocator": {
//!     "allocate_count": 1,
//!     "allocate_fails": 0,
//!     "validation_fails": 0,
//!     "insufficient_devices": 0,
//!     "allocation_races": 0,
//!     "devices_bound": 2,
//!     "devices_released": 0,
//!     "release_fails": 0
//!   },
//!   "logger": {
//!     "missed_metrics_count": 0,
//!     "missed_log_count": 0
//!   }
//! }
//! ```
//!
//! Counters are [`SharedIncMetric`]s: they keep the current value and the value at the last
//! flush, and serialize the delta between the two. Serializing resets them.

use std::fmt::Debug;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use serde::{Serialize, Serializer};

use super::{HostDevLineWriter, extract_guard};

/// Static instance used for handling metrics.
pub static METRICS: Metrics<HostDevMetrics, HostDevLineWriter> =
    Metrics::<HostDevMetrics, HostDevLineWriter>::new(HostDevMetrics::new());

/// Metrics system.
// All member fields have types which are Sync, and exhibit interior mutability, so
// we can call operations on metrics using a non-mut static global variable.
#[derive(Debug)]
pub struct Metrics<T: Serialize, M: Write + Send> {
    // Metrics will get flushed here.
    metrics_buf: OnceLock<Mutex<M>>,
    pub app_metrics: T,
}

impl<T: Serialize + Debug, M: Write + Send + Debug> Metrics<T, M> {
    /// Creates a new instance of the current metrics.
    pub const fn new(app_metrics: T) -> Metrics<T, M> {
        Metrics {
            metrics_buf: OnceLock::new(),
            app_metrics,
        }
    }

    /// Initialize metrics system (once and only once).
    ///
    /// # Arguments
    ///
    /// * `metrics_dest` - Buffer for JSON formatted metrics. Needs to implement `Write` and `Send`.
    pub fn init(&self, metrics_dest: M) -> Result<(), MetricsError> {
        self.metrics_buf
            .set(Mutex::new(metrics_dest))
            .map_err(|_| MetricsError::AlreadyInitialized)
    }

    /// Writes metrics to the destination provided upon initialization.
    ///
    /// Returns `Ok(true)` if the metrics were written and `Ok(false)` if the metrics system was
    /// never initialized.
    pub fn write(&self) -> Result<bool, MetricsError> {
        let Some(lock) = self.metrics_buf.get() else {
            return Ok(false);
        };

        let msg = serde_json::to_string(&self.app_metrics)
            .map_err(|err| MetricsError::Serde(err.to_string()))?;
        // No need to explicitly call flush because the underlying LineWriter flushes
        // automatically whenever a newline is detected.
        extract_guard(lock.lock())
            .write_all(format!("{msg}\n").as_bytes())
            .map_err(MetricsError::Write)?;
        Ok(true)
    }
}

impl<T: Serialize + Debug, M: Write + Send + Debug> Serialize for Metrics<T, M> {
    /// Serialize [`Metrics`] by serializing only the application metrics.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.app_metrics.serialize(serializer)
    }
}

/// Describes the errors which may occur while handling metrics scenarios.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MetricsError {
    /// Reinitialization of metrics not allowed.
    AlreadyInitialized,
    /// {0}
    Serde(String),
    /// Failed to write metrics: {0}
    Write(std::io::Error),
}

/// Used for defining new types of metrics that act as a counter (i.e they are continuously updated
/// by incrementing their value).
pub trait IncMetric {
    /// Adds `value` to the current counter.
    fn add(&self, value: u64);
    /// Increments by 1 unit the current counter.
    fn inc(&self) {
        self.add(1);
    }
    /// Returns current value of the counter.
    fn count(&self) -> u64;
    /// Returns diff of current and old value of the counter.
    fn fetch_diff(&self) -> u64;
}

/// Representation of a metric that is expected to be incremented from more than one thread, so more
/// synchronization is necessary.
// 1st member - current value being updated
// 2nd member - old value that gets the current value whenever metrics is flushed
#[derive(Debug, Default)]
pub struct SharedIncMetric(AtomicU64, AtomicU64);
impl SharedIncMetric {
    /// Const default construction.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0), AtomicU64::new(0))
    }
}

impl IncMetric for SharedIncMetric {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn fetch_diff(&self) -> u64 {
        self.0.load(Ordering::Relaxed) - self.1.load(Ordering::Relaxed)
    }
}

impl Serialize for SharedIncMetric {
    /// Reset counters of each metrics. Here we suppose that Serialize's goal is to help with the
    /// flushing of metrics.
    /// !!! Any print of the metrics will also reset them. Use with caution !!!
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let snapshot = self.0.load(Ordering::Relaxed);
        let res = serializer.serialize_u64(snapshot - self.1.load(Ordering::Relaxed));

        if res.is_ok() {
            self.1.store(snapshot, Ordering::Relaxed);
        }
        res
    }
}

/// Metrics of the host device allocator.
#[derive(Debug, Default, Serialize)]
pub struct AllocatorMetrics {
    /// Number of allocation requests, successful or not.
    pub allocate_count: SharedIncMetric,
    /// Number of failed allocation requests.
    pub allocate_fails: SharedIncMetric,
    /// Number of requests rejected before any capacity check.
    pub validation_fails: SharedIncMetric,
    /// Number of requests rejected because a pool was too small.
    pub insufficient_devices: SharedIncMetric,
    /// Number of commits that failed after a successful capacity check.
    pub allocation_races: SharedIncMetric,
    /// Number of addresses bound to guests.
    pub devices_bound: SharedIncMetric,
    /// Number of addresses returned to their pool.
    pub devices_released: SharedIncMetric,
    /// Number of releases of addresses that were not in use.
    pub release_fails: SharedIncMetric,
}
impl AllocatorMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            allocate_count: SharedIncMetric::new(),
            allocate_fails: SharedIncMetric::new(),
            validation_fails: SharedIncMetric::new(),
            insufficient_devices: SharedIncMetric::new(),
            allocation_races: SharedIncMetric::new(),
            devices_bound: SharedIncMetric::new(),
            devices_released: SharedIncMetric::new(),
            release_fails: SharedIncMetric::new(),
        }
    }
}

/// Metrics specific to the logging subsystem.
#[derive(Debug, Default, Serialize)]
pub struct LoggerSystemMetrics {
    /// Number of misses on flushing metrics.
    pub missed_metrics_count: SharedIncMetric,
    /// Number of errors while writing log lines.
    pub missed_log_count: SharedIncMetric,
}
impl LoggerSystemMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            missed_metrics_count: SharedIncMetric::new(),
            missed_log_count: SharedIncMetric::new(),
        }
    }
}

/// Structure storing all metrics while enforcing serialization support on them.
#[derive(Debug, Default, Serialize)]
pub struct HostDevMetrics {
    /// Metrics related to device allocation.
    pub allocator: AllocatorMetrics,
    /// Logging related metrics.
    pub logger: LoggerSystemMetrics,
}
impl HostDevMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            allocator: AllocatorMetrics::new(),
            logger: LoggerSystemMetrics::new(),
        }
    }
}
