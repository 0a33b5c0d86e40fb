// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host device addresses and the device kinds they imply.

use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use serde::de::Visitor;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Errors associated with parsing a PCI address.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum PciAddressError {
    /// Malformed PCI address `{0}`, expected `segment:bus:device.function`.
    Malformed(String),
    /// Invalid hexadecimal field in PCI address `{0}`.
    InvalidField(String),
    /// PCI device number out of range in `{0}`.
    DeviceOutOfRange(String),
    /// PCI function number out of range in `{0}`.
    FunctionOutOfRange(String),
}

const MAX_DEVICE: u8 = 0x1f;
const MAX_FUNCTION: u8 = 0x7;

/// A PCI `segment:bus:device.function` locator.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress(u32);

impl PciAddress {
    /// Builds an address from its components. `device` and `function` are masked to 5 and 3 bits.
    pub fn new(segment: u16, bus: u8, device: u8, function: u8) -> Self {
        Self(
            (u32::from(segment) << 16)
                | (u32::from(bus) << 8)
                | (u32::from(device & MAX_DEVICE) << 3)
                | u32::from(function & MAX_FUNCTION),
        )
    }

    pub fn segment(&self) -> u16 {
        ((self.0 >> 16) & 0xffff) as u16
    }

    pub fn bus(&self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    pub fn device(&self) -> u8 {
        ((self.0 >> 3) & 0x1f) as u8
    }

    pub fn function(&self) -> u8 {
        (self.0 & 0x7) as u8
    }
}

impl From<u32> for PciAddress {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<PciAddress> for u32 {
    fn from(address: PciAddress) -> Self {
        address.0
    }
}

impl Debug for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:01x}",
            self.segment(),
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

impl FromStr for PciAddress {
    type Err = PciAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || PciAddressError::Malformed(s.to_string());
        let invalid = |_| PciAddressError::InvalidField(s.to_string());

        let (location, function) = s.split_once('.').ok_or_else(malformed)?;
        let mut items = location.split(':');
        let (Some(segment), Some(bus), Some(device), None) =
            (items.next(), items.next(), items.next(), items.next())
        else {
            return Err(malformed());
        };

        let segment = u16::from_str_radix(segment, 16).map_err(invalid)?;
        let bus = u8::from_str_radix(bus, 16).map_err(invalid)?;
        let device = u8::from_str_radix(device, 16).map_err(invalid)?;
        let function = u8::from_str_radix(function, 16).map_err(invalid)?;

        if device > MAX_DEVICE {
            return Err(PciAddressError::DeviceOutOfRange(s.to_string()));
        }
        if function > MAX_FUNCTION {
            return Err(PciAddressError::FunctionOutOfRange(s.to_string()));
        }

        Ok(PciAddress::new(segment, bus, device, function))
    }
}

struct PciAddressVisitor;

impl Visitor<'_> for PciAddressVisitor {
    type Value = PciAddress;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a PCI address string")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        PciAddress::from_str(v).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for PciAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(PciAddressVisitor)
    }
}

impl Serialize for PciAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// The kind of a passthrough device.
///
/// The kind decides what the attachment layer needs: a PCI device is attached by its bus
/// address, a mediated device by its UUID together with its parent PCI device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum HostDeviceKind {
    /// Physical PCI function bound to a passthrough driver.
    #[serde(rename = "pci")]
    Pci,
    /// Mediated device carved out of a parent PCI device.
    #[serde(rename = "mdev")]
    MediatedDevice,
}

impl Display for HostDeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostDeviceKind::Pci => write!(f, "pci"),
            HostDeviceKind::MediatedDevice => write!(f, "mdev"),
        }
    }
}

/// Identifier of one physical device instance on the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum HostDeviceAddress {
    /// PCI bus address of the device.
    Pci(PciAddress),
    /// UUID of the mediated device.
    Mediated(Uuid),
}

impl HostDeviceAddress {
    /// Parses `s` as an address of the given kind.
    pub fn parse(kind: HostDeviceKind, s: &str) -> Result<Self, String> {
        match kind {
            HostDeviceKind::Pci => PciAddress::from_str(s)
                .map(HostDeviceAddress::Pci)
                .map_err(|err| err.to_string()),
            HostDeviceKind::MediatedDevice => Uuid::parse_str(s)
                .map(HostDeviceAddress::Mediated)
                .map_err(|err| err.to_string()),
        }
    }

    /// Returns the kind implied by this address.
    pub fn kind(&self) -> HostDeviceKind {
        match self {
            HostDeviceAddress::Pci(_) => HostDeviceKind::Pci,
            HostDeviceAddress::Mediated(_) => HostDeviceKind::MediatedDevice,
        }
    }
}

impl Display for HostDeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostDeviceAddress::Pci(address) => Display::fmt(address, f),
            HostDeviceAddress::Mediated(uuid) => Display::fmt(uuid, f),
        }
    }
}

impl From<PciAddress> for HostDeviceAddress {
    fn from(address: PciAddress) -> Self {
        HostDeviceAddress::Pci(address)
    }
}

impl From<Uuid> for HostDeviceAddress {
    fn from(uuid: Uuid) -> Self {
        HostDeviceAddress::Mediated(uuid)
    }
}
