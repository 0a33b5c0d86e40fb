// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::allocator::DeviceRequest;
use crate::discovery::{DiscoveryError, DiscoverySnapshot, MdevParentResolver, discover_from_env};
use crate::logger::LoggerConfig;
use crate::pool_set::PoolSet;

/// Errors encountered when loading a launch configuration.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ConfigError {
    /// Unable to read launch configuration: {0}
    Read(std::io::Error),
    /// Invalid launch configuration: {0}
    InvalidJson(serde_json::Error),
    /// Invalid device discovery: {0}
    Discovery(#[from] DiscoveryError),
}

/// Everything needed to bind the host devices of one launch attempt, read from one JSON
/// document.
///
/// ```json
/// {
///   "logger": { "level": "Info" },
///   "discovery": {
///     "resources": [
///       { "name": "nvidia.com/TU104GL_Tesla_T4", "kind": "pci",
///         "devices": [{ "address": "0000:81:00.0" }] }
///     ]
///   },
///   "devices": [
///     { "name": "gpu0", "class": "gpu", "resource_name": "nvidia.com/TU104GL_Tesla_T4" }
///   ]
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LaunchConfig {
    /// Logger settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<LoggerConfig>,
    /// Devices present on the node. Read from the environment when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoverySnapshot>,
    /// Devices requested by the guest, in guest order.
    #[serde(default)]
    pub devices: Vec<DeviceRequest>,
}

impl LaunchConfig {
    pub fn from_json(config_json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(config_json).map_err(ConfigError::InvalidJson)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_json = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        Self::from_json(&config_json)
    }

    /// Builds the node pools this configuration allocates from.
    ///
    /// An embedded snapshot wins. Otherwise the environment is searched, through `lookup`, for
    /// every requested resource.
    pub fn build_pools<F, R>(&self, lookup: F, parents: &R) -> Result<PoolSet, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
        R: MdevParentResolver + ?Sized,
    {
        let pools = match &self.discovery {
            Some(snapshot) => PoolSet::from_snapshot(snapshot)?,
            None => {
                let snapshot = discover_from_env(
                    self.devices.iter().map(|request| &request.resource_name),
                    lookup,
                    parents,
                )?;
                PoolSet::from_snapshot(&snapshot)?
            }
        };
        Ok(pools)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use uuid::Uuid;
    use vmm_sys_util::tempfile::TempFile;

    use super::*;
    use crate::address::{HostDeviceKind, PciAddress};
    use crate::allocator::DeviceClass;
    use crate::logger::LevelFilter;
    use crate::pool_set::DevicePools;
    use crate::resource::ResourceName;

    const CONFIG: &str = r#"{
        "logger": { "level": "warning", "show_level": true },
        "discovery": {
            "resources": [
                { "name": "nvidia.com/TU104GL_Tesla_T4", "kind": "pci",
                  "devices": [{ "address": "0000:81:00.0" }, { "address": "0000:82:00.0" }] }
            ]
        },
        "devices": [
            { "name": "gpu0", "class": "gpu", "resource_name": "nvidia.com/TU104GL_Tesla_T4",
              "count": 2 }
        ]
    }"#;

    struct NoParents;

    impl MdevParentResolver for NoParents {
        fn parent_of(&self, uuid: &Uuid) -> Result<PciAddress, DiscoveryError> {
            Err(DiscoveryError::InvalidParent {
                uuid: *uuid,
                parent: String::new(),
            })
        }
    }

    struct OneParent(PciAddress);

    impl MdevParentResolver for OneParent {
        fn parent_of(&self, _: &Uuid) -> Result<PciAddress, DiscoveryError> {
            Ok(self.0)
        }
    }

    fn t4() -> ResourceName {
        ResourceName::new("nvidia.com/TU104GL_Tesla_T4").unwrap()
    }

    #[test]
    fn test_from_json() {
        let config = LaunchConfig::from_json(CONFIG).unwrap();

        let logger = config.logger.as_ref().unwrap();
        assert_eq!(logger.level, Some(LevelFilter::Warn));
        assert_eq!(logger.show_level, Some(true));

        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].class, DeviceClass::Gpu);
        assert_eq!(config.devices[0].count, 2);

        // The embedded snapshot is used, the environment is not consulted.
        let pools = config.build_pools(|_| None, &NoParents).unwrap();
        assert_eq!(pools.available(&t4()), 2);
    }

    #[test]
    fn test_from_json_errors() {
        assert!(matches!(
            LaunchConfig::from_json(r#"{ "devices": [], "drives": [] }"#),
            Err(ConfigError::InvalidJson(_))
        ));
        assert!(matches!(
            LaunchConfig::from_json(r#"{ "devices": [{ "resource_name": "a", "count": -1 }] }"#),
            Err(ConfigError::InvalidJson(_))
        ));
        assert!(matches!(
            LaunchConfig::from_file("/nonexistent/launch.json"),
            Err(ConfigError::Read(_))
        ));

        let config = LaunchConfig::from_json(
            r#"{ "discovery": { "resources": [
                { "name": "a", "kind": "pci", "devices": [{ "address": "0000:81:00.0" }] },
                { "name": "b", "kind": "pci", "devices": [{ "address": "0000:81:00.0" }] }
            ] } }"#,
        )
        .unwrap();
        assert!(matches!(
            config.build_pools(|_| None, &NoParents),
            Err(ConfigError::Discovery(
                DiscoveryError::DuplicateAddress { .. }
            ))
        ));
    }

    #[test]
    fn test_from_file() {
        let file = TempFile::new().unwrap();
        file.as_file().write_all(CONFIG.as_bytes()).unwrap();

        let config = LaunchConfig::from_file(file.as_path()).unwrap();
        assert_eq!(config, LaunchConfig::from_json(CONFIG).unwrap());
    }

    #[test]
    fn test_env_discovery() {
        let config = LaunchConfig::from_json(
            r#"{ "devices": [
                { "resource_name": "nvidia.com/TU104GL_Tesla_T4" },
                { "resource_name": "nvidia.com/GRID_T4-1Q", "kind": "mdev" },
                { "resource_name": "nvidia.com/TU104GL_Tesla_T4" }
            ] }"#,
        )
        .unwrap();

        let env = HashMap::from([
            (
                "PCI_RESOURCE_NVIDIA_COM_TU104GL_TESLA_T4",
                "0000:81:00.0, 0000:82:00.0",
            ),
            (
                "MDEV_PCI_RESOURCE_NVIDIA_COM_GRID_T4-1Q",
                "4b20d080-1b54-4048-85b3-a6a62d165c01",
            ),
        ]);
        let parent = PciAddress::new(0, 0x3b, 0, 0);
        let pools = config
            .build_pools(
                |key: &str| env.get(key).map(|value| value.to_string()),
                &OneParent(parent),
            )
            .unwrap();

        assert_eq!(pools.available(&t4()), 2);
        let grid = ResourceName::new("nvidia.com/GRID_T4-1Q").unwrap();
        assert_eq!(
            pools.resource_kind(&grid),
            Some(HostDeviceKind::MediatedDevice)
        );
        assert_eq!(pools.available(&grid), 1);
    }
}
