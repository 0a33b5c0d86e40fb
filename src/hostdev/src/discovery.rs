// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Discovery snapshots: the inventory of passthrough devices present on the node when a launch
//! attempt starts.
//!
//! A snapshot is either supplied directly (usually as JSON) or assembled from the environment
//! variables that device plugins inject into the launcher:
//!
//! * `PCI_RESOURCE_<NAME>` - comma separated PCI addresses,
//! * `MDEV_PCI_RESOURCE_<NAME>` - comma separated mediated device UUIDs,
//!
//! where `<NAME>` is [`ResourceName::env_var_suffix`].

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::{HostDeviceKind, PciAddress};
use crate::resource::ResourceName;

/// Prefix of the variables listing PCI addresses of a resource.
pub const PCI_RESOURCE_PREFIX: &str = "PCI_RESOURCE_";
/// Prefix of the variables listing mediated device UUIDs of a resource.
pub const MDEV_RESOURCE_PREFIX: &str = "MDEV_PCI_RESOURCE_";
/// Default mount point of sysfs.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Errors associated with building pools out of discovery input.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum DiscoveryError {
    /// Resource {0} was reported more than once.
    DuplicateResource(ResourceName),
    /// Invalid address `{address}` for {kind} resource {resource}: {reason}
    InvalidAddress {
        /// Resource the address was reported for.
        resource: ResourceName,
        /// Kind declared for the resource.
        kind: HostDeviceKind,
        /// Offending address.
        address: String,
        /// Parsing failure.
        reason: String,
    },
    /// Address {address} of resource {resource} was already reported.
    DuplicateAddress {
        /// Resource reporting the address the second time.
        resource: ResourceName,
        /// Duplicated address.
        address: String,
    },
    /// Mediated device {address} of resource {resource} has no parent device.
    MissingParent {
        /// Resource of the device.
        resource: ResourceName,
        /// UUID of the mediated device.
        address: String,
    },
    /// PCI device {address} of resource {resource} cannot have a parent device.
    UnexpectedParent {
        /// Resource of the device.
        resource: ResourceName,
        /// Address of the PCI device.
        address: String,
    },
    /// Resource {0} is reported both as PCI and mediated devices.
    MixedKinds(ResourceName),
    /// Failed to resolve the parent of mediated device {uuid}: {source}
    ParentLookup {
        /// UUID of the mediated device.
        uuid: Uuid,
        /// Underlying sysfs error.
        source: io::Error,
    },
    /// Mediated device {uuid} has a malformed parent `{parent}`.
    InvalidParent {
        /// UUID of the mediated device.
        uuid: Uuid,
        /// Name found where the parent address was expected.
        parent: String,
    },
}

/// One device reported for a resource.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveredDevice {
    /// PCI address or mediated device UUID, depending on the resource kind.
    pub address: String,
    /// Parent PCI device. Mandatory for mediated devices, forbidden for PCI devices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<PciAddress>,
}

/// All devices reported for one resource.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveredResource {
    /// Name guests use to request these devices.
    pub name: ResourceName,
    /// Kind shared by every device of the resource.
    pub kind: HostDeviceKind,
    /// Devices in discovery order.
    #[serde(default)]
    pub devices: Vec<DiscoveredDevice>,
}

/// Point-in-time inventory of the passthrough devices of the node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoverySnapshot {
    /// Reported resources.
    pub resources: Vec<DiscoveredResource>,
}

/// Finds the parent PCI device of a mediated device.
pub trait MdevParentResolver {
    /// Returns the PCI address of the device `uuid` was created on.
    fn parent_of(&self, uuid: &Uuid) -> Result<PciAddress, DiscoveryError>;
}

/// Resolves mediated device parents through sysfs.
///
/// `<root>/bus/mdev/devices/<uuid>` links to the device directory, which lives inside the
/// directory of its parent, e.g. `../../../devices/pci0000:00/0000:00:02.0/<uuid>`.
#[derive(Debug, Clone)]
pub struct SysfsMdevParents {
    root: PathBuf,
}

impl SysfsMdevParents {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl Default for SysfsMdevParents {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_ROOT)
    }
}

impl MdevParentResolver for SysfsMdevParents {
    fn parent_of(&self, uuid: &Uuid) -> Result<PciAddress, DiscoveryError> {
        let link = self
            .root
            .join("bus/mdev/devices")
            .join(uuid.hyphenated().to_string());
        let target = std::fs::read_link(&link)
            .map_err(|source| DiscoveryError::ParentLookup { uuid: *uuid, source })?;

        let parent = target
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        parent
            .parse()
            .map_err(|_| DiscoveryError::InvalidParent {
                uuid: *uuid,
                parent,
            })
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

/// Builds a snapshot from device plugin environment variables.
///
/// Only the resources listed in `resources` are looked up, since variable names cannot be mapped
/// back to resource names. Resources without any variable are not part of the snapshot.
///
/// # Arguments
///
/// * `resources` - Resource names to look up, duplicates are ignored.
/// * `lookup` - Returns the value of an environment variable, if set.
/// * `parents` - Resolver used for mediated devices.
pub fn discover_from_env<'a, I, F, R>(
    resources: I,
    lookup: F,
    parents: &R,
) -> Result<DiscoverySnapshot, DiscoveryError>
where
    I: IntoIterator<Item = &'a ResourceName>,
    F: Fn(&str) -> Option<String>,
    R: MdevParentResolver + ?Sized,
{
    let mut snapshot = DiscoverySnapshot::default();

    for name in resources {
        if snapshot.resources.iter().any(|resource| &resource.name == name) {
            continue;
        }

        let suffix = name.env_var_suffix();
        let pci = lookup(&format!("{PCI_RESOURCE_PREFIX}{suffix}"));
        let mdev = lookup(&format!("{MDEV_RESOURCE_PREFIX}{suffix}"));

        let resource = match (pci, mdev) {
            (Some(_), Some(_)) => return Err(DiscoveryError::MixedKinds(name.clone())),
            (Some(list), None) => DiscoveredResource {
                name: name.clone(),
                kind: HostDeviceKind::Pci,
                devices: split_list(&list)
                    .map(|address| DiscoveredDevice {
                        address: address.to_string(),
                        parent: None,
                    })
                    .collect(),
            },
            (None, Some(list)) => {
                let mut devices = Vec::new();
                for address in split_list(&list) {
                    let uuid =
                        Uuid::parse_str(address).map_err(|err| DiscoveryError::InvalidAddress {
                            resource: name.clone(),
                            kind: HostDeviceKind::MediatedDevice,
                            address: address.to_string(),
                            reason: err.to_string(),
                        })?;
                    devices.push(DiscoveredDevice {
                        address: address.to_string(),
                        parent: Some(parents.parent_of(&uuid)?),
                    });
                }
                DiscoveredResource {
                    name: name.clone(),
                    kind: HostDeviceKind::MediatedDevice,
                    devices,
                }
            }
            (None, None) => {
                warn!("No devices published for resource {name}");
                continue;
            }
        };

        debug!(
            "Discovered {} {} device(s) for resource {name}",
            resource.devices.len(),
            resource.kind
        );
        snapshot.resources.push(resource);
    }

    Ok(snapshot)
}
