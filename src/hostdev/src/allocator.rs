// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Binding of guest device requests to host device addresses.
//!
//! An allocation runs in three passes over the whole request batch:
//!
//! 1. validation, which only reads the pools,
//! 2. a capacity check, comparing the total requested per resource with what the pools have left,
//! 3. the commit, which takes the addresses out of the pools.
//!
//! Nothing is taken out of any pool unless the first two passes succeed for every request, and a
//! commit failure gives back everything taken by earlier requests of the same batch. Callers
//! therefore either get one address per requested unit, or an error with the pools unchanged.

use std::collections::HashSet;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::address::{HostDeviceAddress, HostDeviceKind, PciAddress};
use crate::logger::{IncMetric, METRICS};
use crate::pool::PoolError;
use crate::pool_set::{DevicePools, PoolSet};
use crate::resource::ResourceName;

/// Errors associated with binding devices to a guest.
///
/// All of them end the current launch attempt. None is retried here.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum AllocatorError {
    /// No device of resource {0} was discovered on this node.
    UnknownResource(ResourceName),
    /// Request {index} asks for {count} devices of resource {resource}, at least one is required.
    InvalidCount {
        /// Position of the request in the batch.
        index: usize,
        /// Requested resource.
        resource: ResourceName,
        /// Requested count.
        count: usize,
    },
    /// Resource {resource} provides {discovered} devices, but {requested} devices were requested.
    KindMismatch {
        /// Requested resource.
        resource: ResourceName,
        /// Kind named by the request.
        requested: HostDeviceKind,
        /// Kind of the discovered devices.
        discovered: HostDeviceKind,
    },
    /// Request {index} for resource {resource} gives {hints} guest addresses for {count} devices.
    InvalidGuestAddresses {
        /// Position of the request in the batch.
        index: usize,
        /// Requested resource.
        resource: ResourceName,
        /// Number of guest address hints.
        hints: usize,
        /// Requested count.
        count: usize,
    },
    /// Guest address {0} is requested more than once.
    DuplicateGuestAddress(PciAddress),
    /// Device name {0} is requested more than once.
    DuplicateRequestName(String),
    /// Insufficient devices for resource {resource}: {requested} requested, {available} available.
    InsufficientDevices {
        /// Requested resource.
        resource: ResourceName,
        /// Total requested across the batch.
        requested: usize,
        /// Addresses left in the pool.
        available: usize,
    },
    /// Pool of resource {resource} could not provide {requested} devices after passing the capacity check ({available} available); pools were modified concurrently.
    AllocationRaceDetected {
        /// Resource whose pool failed.
        resource: ResourceName,
        /// Count asked from the pool.
        requested: usize,
        /// Addresses left in the pool at failure time.
        available: usize,
    },
    /// Mediated device {address} of resource {resource} has no parent device.
    MissingParent {
        /// Resource of the device.
        resource: ResourceName,
        /// UUID of the mediated device.
        address: HostDeviceAddress,
    },
    /// Failed to release a device of resource {resource}: {source}
    Release {
        /// Resource of the device.
        resource: ResourceName,
        /// Pool error.
        source: PoolError,
    },
}

/// What a requested device is used as in the guest.
///
/// GPUs and generic host devices share the allocation path; the class only decides the alias
/// prefix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Graphics device.
    Gpu,
    /// Any other passthrough device.
    #[default]
    HostDevice,
}

impl DeviceClass {
    /// Prefix of the aliases of devices of this class.
    pub fn alias_prefix(&self) -> &'static str {
        match self {
            DeviceClass::Gpu => "ua-gpu-",
            DeviceClass::HostDevice => "ua-hostdevice-",
        }
    }
}

fn default_count() -> usize {
    1
}

/// A guest's request for `count` devices of one resource.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceRequest {
    /// Guest-visible name, used to build the device alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// What the device is used as.
    #[serde(default)]
    pub class: DeviceClass,
    /// Requested resource.
    pub resource_name: ResourceName,
    /// Expected kind of the devices, if the guest cares.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<HostDeviceKind>,
    /// Number of devices.
    #[serde(default = "default_count")]
    pub count: usize,
    /// Guest PCI addresses, one per device, if the guest pins them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guest_addresses: Vec<PciAddress>,
}

impl DeviceRequest {
    /// Creates an anonymous request for `count` devices of any kind.
    pub fn new(resource_name: ResourceName, count: usize) -> Self {
        Self {
            name: None,
            class: DeviceClass::default(),
            resource_name,
            kind: None,
            count,
            guest_addresses: Vec::new(),
        }
    }

    fn alias(&self, unit: usize) -> Option<String> {
        let name = self.name.as_ref()?;
        let prefix = self.class.alias_prefix();
        Some(match self.count {
            1 => format!("{prefix}{name}"),
            _ => format!("{prefix}{name}-{unit}"),
        })
    }
}

/// One requested unit resolved to a host device, ready to be attached.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BoundDevice {
    /// Resource the device was taken from.
    pub resource_name: ResourceName,
    /// Kind of the device.
    pub kind: HostDeviceKind,
    /// Host address of the device.
    pub address: HostDeviceAddress,
    /// Parent PCI device, set for mediated devices only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<PciAddress>,
    /// Guest PCI address the device should be placed at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_address: Option<PciAddress>,
    /// Alias of the device in the domain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Binds device requests to addresses taken from a set of pools.
///
/// The allocator owns the pools for the duration of a launch attempt. It does no locking of its
/// own: callers sharing pools between concurrent launches must serialize whole
/// [`HostDeviceAllocator::allocate`] calls, see [`crate::shared::SharedAllocator`].
#[derive(Debug)]
pub struct HostDeviceAllocator<P = PoolSet> {
    pools: P,
}

impl<P: DevicePools> HostDeviceAllocator<P> {
    pub fn new(pools: P) -> Self {
        Self { pools }
    }

    pub fn pools(&self) -> &P {
        &self.pools
    }

    pub fn into_pools(self) -> P {
        self.pools
    }

    /// Binds every requested unit to a host device.
    ///
    /// The result holds one [`BoundDevice`] per requested unit, in request order, and within a
    /// request in pool order. On error the pools are left exactly as they were.
    pub fn allocate(
        &mut self,
        requests: &[DeviceRequest],
    ) -> Result<Vec<BoundDevice>, AllocatorError> {
        let metrics = &METRICS.app_metrics.allocator;
        metrics.allocate_count.inc();

        let result = self.try_allocate(requests);

        match &result {
            Ok(devices) => {
                metrics.devices_bound.add(devices.len() as u64);
                for device in devices {
                    info!(
                        "Bound {} device {} of resource {}",
                        device.kind, device.address, device.resource_name
                    );
                }
            }
            Err(err) => {
                metrics.allocate_fails.inc();
                match err {
                    AllocatorError::InsufficientDevices { .. } => {
                        metrics.insufficient_devices.inc();
                        warn!("Host device allocation failed: {err}");
                    }
                    AllocatorError::AllocationRaceDetected { .. }
                    | AllocatorError::MissingParent { .. } => {
                        metrics.allocation_races.inc();
                        error!("Host device allocation failed: {err}");
                    }
                    _ => {
                        metrics.validation_fails.inc();
                        warn!("Host device allocation failed: {err}");
                    }
                }
            }
        }

        result
    }

    /// Gives the addresses of `devices` back to their pools.
    ///
    /// Every device is released even if some fail; the first failure is returned.
    pub fn release(&mut self, devices: &[BoundDevice]) -> Result<(), AllocatorError> {
        let metrics = &METRICS.app_metrics.allocator;
        let mut first_error = None;

        for device in devices {
            match self.pools.release(&device.resource_name, &device.address) {
                Ok(()) => metrics.devices_released.inc(),
                Err(source) => {
                    metrics.release_fails.inc();
                    error!(
                        "Failed to release device {} of resource {}: {source}",
                        device.address, device.resource_name
                    );
                    first_error.get_or_insert(AllocatorError::Release {
                        resource: device.resource_name.clone(),
                        source,
                    });
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn try_allocate(
        &mut self,
        requests: &[DeviceRequest],
    ) -> Result<Vec<BoundDevice>, AllocatorError> {
        self.validate(requests)?;
        self.check_capacity(requests)?;
        self.commit(requests)
    }

    fn validate(&self, requests: &[DeviceRequest]) -> Result<(), AllocatorError> {
        let mut names = HashSet::new();
        let mut guest_addresses = HashSet::new();

        for (index, request) in requests.iter().enumerate() {
            let resource = &request.resource_name;
            let discovered = self
                .pools
                .resource_kind(resource)
                .ok_or_else(|| AllocatorError::UnknownResource(resource.clone()))?;

            if request.count < 1 {
                return Err(AllocatorError::InvalidCount {
                    index,
                    resource: resource.clone(),
                    count: request.count,
                });
            }

            if let Some(requested) = request.kind {
                if requested != discovered {
                    return Err(AllocatorError::KindMismatch {
                        resource: resource.clone(),
                        requested,
                        discovered,
                    });
                }
            }

            if !request.guest_addresses.is_empty() && request.guest_addresses.len() != request.count
            {
                return Err(AllocatorError::InvalidGuestAddresses {
                    index,
                    resource: resource.clone(),
                    hints: request.guest_addresses.len(),
                    count: request.count,
                });
            }

            if let Some(name) = &request.name {
                if !names.insert(name.as_str()) {
                    return Err(AllocatorError::DuplicateRequestName(name.clone()));
                }
            }

            for address in &request.guest_addresses {
                if !guest_addresses.insert(*address) {
                    return Err(AllocatorError::DuplicateGuestAddress(*address));
                }
            }
        }

        Ok(())
    }

    fn check_capacity(&self, requests: &[DeviceRequest]) -> Result<(), AllocatorError> {
        // Totals per resource, in order of first appearance so the reported shortage is stable.
        let mut totals: Vec<(&ResourceName, usize)> = Vec::new();
        for request in requests {
            match totals
                .iter_mut()
                .find(|(resource, _)| *resource == &request.resource_name)
            {
                Some((_, total)) => *total = total.saturating_add(request.count),
                None => totals.push((&request.resource_name, request.count)),
            }
        }

        for (resource, requested) in totals {
            let available = self.pools.available(resource);
            if requested > available {
                return Err(AllocatorError::InsufficientDevices {
                    resource: resource.clone(),
                    requested,
                    available,
                });
            }
        }

        Ok(())
    }

    fn commit(&mut self, requests: &[DeviceRequest]) -> Result<Vec<BoundDevice>, AllocatorError> {
        let mut committed: Vec<(&ResourceName, Vec<HostDeviceAddress>)> =
            Vec::with_capacity(requests.len());
        let mut devices = Vec::with_capacity(requests.iter().map(|r| r.count).sum());

        for request in requests {
            let resource = &request.resource_name;
            let Some(addresses) = self.pools.allocate_n(resource, request.count) else {
                let err = AllocatorError::AllocationRaceDetected {
                    resource: resource.clone(),
                    requested: request.count,
                    available: self.pools.available(resource),
                };
                self.rollback(committed);
                return Err(err);
            };

            let bound = self.bind(request, &addresses);
            committed.push((resource, addresses));
            match bound {
                Ok(bound) => devices.extend(bound),
                Err(err) => {
                    self.rollback(committed);
                    return Err(err);
                }
            }
        }

        Ok(devices)
    }

    fn bind(
        &self,
        request: &DeviceRequest,
        addresses: &[HostDeviceAddress],
    ) -> Result<Vec<BoundDevice>, AllocatorError> {
        let resource = &request.resource_name;

        addresses
            .iter()
            .enumerate()
            .map(|(unit, address)| -> Result<BoundDevice, AllocatorError> {
                let kind = address.kind();
                let parent = match kind {
                    HostDeviceKind::Pci => None,
                    HostDeviceKind::MediatedDevice => Some(
                        self.pools.parent_of(resource, address).ok_or_else(|| {
                            AllocatorError::MissingParent {
                                resource: resource.clone(),
                                address: *address,
                            }
                        })?,
                    ),
                };

                Ok(BoundDevice {
                    resource_name: resource.clone(),
                    kind,
                    address: *address,
                    parent,
                    guest_address: request.guest_addresses.get(unit).copied(),
                    alias: request.alias(unit),
                })
            })
            .collect()
    }

    fn rollback(&mut self, committed: Vec<(&ResourceName, Vec<HostDeviceAddress>)>) {
        for (resource, addresses) in committed.into_iter().rev() {
            for address in addresses.iter().rev() {
                // The addresses were handed out by this very call, so this only fails if the
                // pool implementation is broken.
                if let Err(err) = self.pools.release(resource, address) {
                    error!("Failed to roll back device {address} of resource {resource}: {err}");
                }
            }
        }
    }
}
