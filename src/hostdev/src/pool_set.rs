// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::address::{HostDeviceAddress, HostDeviceKind, PciAddress};
use crate::discovery::{DiscoveryError, DiscoverySnapshot};
use crate::pool::{AddressPool, PoolError};
use crate::resource::ResourceName;

/// Access to the pools of a node, as seen by the allocator.
///
/// Implementations only need to keep single pools consistent. Atomicity across pools is
/// provided by the allocator.
pub trait DevicePools {
    /// Kind of the devices of `resource`, or `None` if the resource was never discovered.
    fn resource_kind(&self, resource: &ResourceName) -> Option<HostDeviceKind>;

    /// Number of addresses of `resource` that can still be allocated.
    fn available(&self, resource: &ResourceName) -> usize;

    /// Allocates `count` addresses of `resource`, all or nothing.
    fn allocate_n(
        &mut self,
        resource: &ResourceName,
        count: usize,
    ) -> Option<Vec<HostDeviceAddress>>;

    /// Returns `address` to the pool of `resource`.
    fn release(
        &mut self,
        resource: &ResourceName,
        address: &HostDeviceAddress,
    ) -> Result<(), PoolError>;

    /// Parent PCI device of a mediated device address.
    fn parent_of(&self, resource: &ResourceName, address: &HostDeviceAddress)
    -> Option<PciAddress>;
}

/// Pool of a single resource, together with the discovery metadata of its devices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourcePool {
    kind: HostDeviceKind,
    pool: AddressPool,
    parents: HashMap<HostDeviceAddress, PciAddress>,
}

impl ResourcePool {
    pub fn kind(&self) -> HostDeviceKind {
        self.kind
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }
}

/// Per-resource usage figures, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    /// Resource the figures refer to.
    pub resource: ResourceName,
    /// Kind of the resource.
    pub kind: HostDeviceKind,
    /// Addresses that can be allocated.
    pub available: usize,
    /// Addresses already allocated.
    pub in_use: usize,
}

/// All pools of the node, keyed by resource name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolSet {
    pools: BTreeMap<ResourceName, ResourcePool>,
}

impl PoolSet {
    /// Builds the pools described by a discovery snapshot.
    ///
    /// Inconsistent discovery input is rejected here rather than at allocation time: every
    /// address must parse for the declared kind of its resource, mediated devices must name
    /// their parent, PCI devices must not, and no address may be reported twice on the node.
    pub fn from_snapshot(snapshot: &DiscoverySnapshot) -> Result<Self, DiscoveryError> {
        let mut pools = BTreeMap::new();
        let mut seen = HashSet::new();

        for resource in &snapshot.resources {
            if pools.contains_key(&resource.name) {
                return Err(DiscoveryError::DuplicateResource(resource.name.clone()));
            }

            let mut addresses = Vec::with_capacity(resource.devices.len());
            let mut parents = HashMap::new();

            for device in &resource.devices {
                let address =
                    HostDeviceAddress::parse(resource.kind, device.address.trim()).map_err(
                        |reason| DiscoveryError::InvalidAddress {
                            resource: resource.name.clone(),
                            kind: resource.kind,
                            address: device.address.clone(),
                            reason,
                        },
                    )?;

                if !seen.insert(address) {
                    return Err(DiscoveryError::DuplicateAddress {
                        resource: resource.name.clone(),
                        address: address.to_string(),
                    });
                }

                match (resource.kind, device.parent) {
                    (HostDeviceKind::MediatedDevice, Some(parent)) => {
                        parents.insert(address, parent);
                    }
                    (HostDeviceKind::MediatedDevice, None) => {
                        return Err(DiscoveryError::MissingParent {
                            resource: resource.name.clone(),
                            address: address.to_string(),
                        });
                    }
                    (HostDeviceKind::Pci, Some(_)) => {
                        return Err(DiscoveryError::UnexpectedParent {
                            resource: resource.name.clone(),
                            address: address.to_string(),
                        });
                    }
                    (HostDeviceKind::Pci, None) => (),
                }

                addresses.push(address);
            }

            let pool = AddressPool::new(addresses).map_err(|err| match err {
                PoolError::DuplicateAddress(address) => DiscoveryError::DuplicateAddress {
                    resource: resource.name.clone(),
                    address: address.to_string(),
                },
                // Pool construction only reports duplicates.
                _ => DiscoveryError::DuplicateResource(resource.name.clone()),
            })?;

            pools.insert(
                resource.name.clone(),
                ResourcePool {
                    kind: resource.kind,
                    pool,
                    parents,
                },
            );
        }

        Ok(Self { pools })
    }

    /// Returns the pool registered for `resource`.
    pub fn get(&self, resource: &ResourceName) -> Option<&ResourcePool> {
        self.pools.get(resource)
    }

    /// Resource names, sorted.
    pub fn resources(&self) -> impl Iterator<Item = &ResourceName> {
        self.pools.keys()
    }

    /// Usage figures of every pool, sorted by resource name.
    pub fn usage(&self) -> Vec<PoolUsage> {
        self.pools
            .iter()
            .map(|(resource, pool)| {
                let (available, in_use) = pool.pool.len();
                PoolUsage {
                    resource: resource.clone(),
                    kind: pool.kind,
                    available,
                    in_use,
                }
            })
            .collect()
    }
}

impl DevicePools for PoolSet {
    fn resource_kind(&self, resource: &ResourceName) -> Option<HostDeviceKind> {
        self.pools.get(resource).map(|pool| pool.kind)
    }

    fn available(&self, resource: &ResourceName) -> usize {
        self.pools
            .get(resource)
            .map_or(0, |pool| pool.pool.len().0)
    }

    fn allocate_n(
        &mut self,
        resource: &ResourceName,
        count: usize,
    ) -> Option<Vec<HostDeviceAddress>> {
        self.pools.get_mut(resource)?.pool.allocate_n(count)
    }

    fn release(
        &mut self,
        resource: &ResourceName,
        address: &HostDeviceAddress,
    ) -> Result<(), PoolError> {
        self.pools
            .get_mut(resource)
            .ok_or_else(|| PoolError::UnknownResource(resource.clone()))?
            .pool
            .release(address)
    }

    fn parent_of(
        &self,
        resource: &ResourceName,
        address: &HostDeviceAddress,
    ) -> Option<PciAddress> {
        self.pools.get(resource)?.parents.get(address).copied()
    }
}
