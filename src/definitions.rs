// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};

/// Identifies the hardware bus a device lives on.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BusType {
    Usb = 1,
}

impl BusType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(BusType::Usb),
            _ => None,
        }
    }

    /// Case-insensitive lookup by the name used in driver metadata.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("usb") {
            Some(BusType::Usb)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BusType::Usb => "usb",
        }
    }
}

/// Globally unique device identifier.
///
/// Packed as a u64 with the bus type in the top 32 bits and the bus-scoped
/// device id in the bottom 32 bits. This is the only place bits are
/// shifted; everything else goes through the accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    pub fn new(bus_type: BusType, bus_dev_id: u32) -> Self {
        Self(((bus_type as u64) << 32) | u64::from(bus_dev_id))
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        BusType::from_raw((raw >> 32) as u32).map(|_| Self(raw))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn bus_type(self) -> BusType {
        // Constructed only through new()/from_raw(), so the high half is a
        // valid bus type.
        BusType::from_raw((self.0 >> 32) as u32).unwrap_or(BusType::Usb)
    }

    pub fn bus_dev_id(self) -> u32 {
        self.0 as u32
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Summary of one USB interface, as reported by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbInterfaceSummary {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// USB-specific part of a device descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceExt {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interfaces: Vec<UsbInterfaceSummary>,
}

/// Bus-specific device payload. Opaque to the device registry; only the
/// owning bus extension looks inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceExt {
    Usb(UsbDeviceExt),
}

/// Immutable snapshot of a device as reported by its bus extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub bus_type: BusType,
    pub bus_dev_id: u32,
    pub description: String,
    pub ext: DeviceExt,
}

impl DeviceDescriptor {
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(self.bus_type, self.bus_dev_id)
    }
}

/// Separator between the package name and the component name in encoded
/// keys and in driver uids. Package names cannot contain it.
pub const KEY_SEPARATOR: &str = "-";

/// Identifies one driver extension component within an installed package.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageKey {
    pub package_name: String,
    pub component_name: String,
}

impl PackageKey {
    pub fn new(package_name: impl Into<String>, component_name: impl Into<String>) -> Self {
        Self { package_name: package_name.into(), component_name: component_name.into() }
    }

    pub fn encode(&self) -> String {
        format!("{}{}{}", self.package_name, KEY_SEPARATOR, self.component_name)
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let (package, component) = encoded.split_once(KEY_SEPARATOR)?;
        if package.is_empty() || component.is_empty() {
            return None;
        }
        Some(Self::new(package, component))
    }
}

impl std::fmt::Display for PackageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.package_name, KEY_SEPARATOR, self.component_name)
    }
}

/// USB matching criteria carried by a driver descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDriverExt {
    pub vids: Vec<u16>,
    pub pids: Vec<u16>,
}

/// Bus-specific part of a driver descriptor. Serialized inline into the
/// descriptor envelope, so the JSON stays flat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DriverExt {
    Usb(UsbDriverExt),
}

/// What a driver package declares about one driver, parsed from its
/// component metadata and persisted as JSON in the package store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverDescriptor {
    pub bus: String,
    pub vendor: String,
    pub version: String,
    pub description: String,
    #[serde(flatten)]
    pub ext: DriverExt,
}

/// Client-facing device summary returned by device queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceData {
    pub device_id: DeviceId,
    pub bus_type: BusType,
    pub description: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceData {
    pub fn from_descriptor(desc: &DeviceDescriptor) -> Self {
        let DeviceExt::Usb(ref usb) = desc.ext;
        Self {
            device_id: desc.device_id(),
            bus_type: desc.bus_type,
            description: desc.description.clone(),
            vendor_id: usb.vendor_id,
            product_id: usb.product_id,
        }
    }
}

/// Client-facing device detail including the matched driver, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoData {
    pub device: DeviceData,
    pub driver_uid: Option<String>,
}

/// Client-facing view of one stored driver package record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfoData {
    pub driver_uid: String,
    pub package_name: String,
    pub component_name: String,
    pub descriptor: DriverDescriptor,
}
