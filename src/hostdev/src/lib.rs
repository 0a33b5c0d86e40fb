// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host device allocation for guests launched on a node.
//!
//! Device plugins advertise passthrough devices (PCI functions and mediated devices) under
//! resource names. A launch attempt asks for a number of devices of some resources, and this
//! crate binds every requested unit to a concrete, exclusively owned host address:
//!
//! * [`discovery`] turns the advertised inventory into a [`DiscoverySnapshot`],
//! * [`PoolSet`] keeps one [`AddressPool`] per resource,
//! * [`HostDeviceAllocator`] binds [`DeviceRequest`]s to [`BoundDevice`]s, all or nothing,
//! * [`SharedAllocator`] serializes allocations of concurrent launches.

pub mod address;
pub mod allocator;
pub mod discovery;
pub mod launch_config;
pub mod logger;
pub mod pool;
pub mod pool_set;
pub mod resource;
pub mod shared;

pub use crate::address::{HostDeviceAddress, HostDeviceKind, PciAddress};
pub use crate::allocator::{
    AllocatorError, BoundDevice, DeviceClass, DeviceRequest, HostDeviceAllocator,
};
pub use crate::discovery::{DiscoveryError, DiscoverySnapshot, SysfsMdevParents};
pub use crate::launch_config::{ConfigError, LaunchConfig};
pub use crate::pool::{AddressPool, PoolError};
pub use crate::pool_set::{DevicePools, PoolSet, PoolUsage};
pub use crate::resource::ResourceName;
pub use crate::shared::SharedAllocator;
