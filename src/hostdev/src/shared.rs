// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};

use crate::allocator::{AllocatorError, BoundDevice, DeviceRequest, HostDeviceAllocator};
use crate::logger::extract_guard;
use crate::pool_set::{DevicePools, PoolSet, PoolUsage};

/// Handle to an allocator shared by concurrent launch attempts on one node.
///
/// Each call holds the lock for its whole validate, check and commit sequence, so two launches
/// can never pass the capacity check against the same free addresses.
#[derive(Debug)]
pub struct SharedAllocator<P = PoolSet> {
    inner: Arc<Mutex<HostDeviceAllocator<P>>>,
}

impl<P> Clone for SharedAllocator<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: DevicePools> SharedAllocator<P> {
    pub fn new(pools: P) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HostDeviceAllocator::new(pools))),
        }
    }

    /// See [`HostDeviceAllocator::allocate`].
    pub fn allocate(&self, requests: &[DeviceRequest]) -> Result<Vec<BoundDevice>, AllocatorError> {
        // A panic mid-allocation cannot leave a pool half-committed, so a poisoned lock is
        // still safe to use.
        extract_guard(self.inner.lock()).allocate(requests)
    }

    /// See [`HostDeviceAllocator::release`].
    pub fn release(&self, devices: &[BoundDevice]) -> Result<(), AllocatorError> {
        extract_guard(self.inner.lock()).release(devices)
    }

    /// Runs `f` with the pools locked.
    pub fn with_pools<T>(&self, f: impl FnOnce(&P) -> T) -> T {
        f(extract_guard(self.inner.lock()).pools())
    }
}

impl SharedAllocator<PoolSet> {
    /// Usage figures of every pool.
    pub fn usage(&self) -> Vec<PoolUsage> {
        self.with_pools(PoolSet::usage)
    }
}
