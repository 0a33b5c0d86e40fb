// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Resource name must not be empty.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub struct EmptyResourceName;

/// Logical name under which interchangeable host devices are grouped,
/// e.g. `nvidia.com/TU104GL_Tesla_T4`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ResourceName(String);

impl ResourceName {
    /// Creates a resource name, rejecting empty strings.
    pub fn new(name: impl Into<String>) -> Result<Self, EmptyResourceName> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(EmptyResourceName);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Suffix of the environment variables through which device plugins publish the
    /// addresses of this resource.
    pub fn env_var_suffix(&self) -> String {
        self.0
            .chars()
            .map(|c| match c {
                '.' | '/' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect()
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ResourceName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let name = String::deserialize(deserializer)?;
        ResourceName::new(name).map_err(D::Error::custom)
    }
}
