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

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::bus_extension::{BusExtension, DeviceChangeCallback};
use crate::definitions::{
    BusType, DeviceDescriptor, DeviceExt, DriverDescriptor, DriverExt, UsbDeviceExt,
    UsbDriverExt, UsbInterfaceSummary,
};
use crate::errors::{EdmError, EdmResult};

/// Raw USB hotplug notification, as delivered by the platform's USB
/// service glue.
#[derive(Debug, Clone)]
pub struct UsbHotplugInfo {
    pub bus_num: u8,
    pub dev_addr: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub description: String,
    pub interfaces: Vec<UsbInterfaceSummary>,
}

impl UsbHotplugInfo {
    /// Bus-scoped device id: bus number in the upper half, device address
    /// in the lower half.
    pub fn bus_dev_id(&self) -> u32 {
        (u32::from(self.bus_num) << 16) | u32::from(self.dev_addr)
    }
}

/// USB bus adapter. Translates hotplug notifications into device
/// descriptors and implements the vid/pid match predicate.
#[derive(Default)]
pub struct UsbBusExtension {
    callback: Mutex<Option<Arc<dyn DeviceChangeCallback>>>,
}

impl UsbBusExtension {
    pub fn new() -> Self {
        Self::default()
    }

    fn descriptor_for(info: &UsbHotplugInfo) -> DeviceDescriptor {
        DeviceDescriptor {
            bus_type: BusType::Usb,
            bus_dev_id: info.bus_dev_id(),
            description: info.description.clone(),
            ext: DeviceExt::Usb(UsbDeviceExt {
                vendor_id: info.vendor_id,
                product_id: info.product_id,
                interfaces: info.interfaces.clone(),
            }),
        }
    }

    fn callback(&self) -> EdmResult<Arc<dyn DeviceChangeCallback>> {
        self.callback
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| EdmError::InvalidObject("usb bus not initialized".to_string()))
    }

    /// Entry point for the platform's hotplug glue: a device appeared.
    pub async fn handle_device_arrival(&self, info: UsbHotplugInfo) -> EdmResult<()> {
        let descriptor = Self::descriptor_for(&info);
        debug!(
            "usb device arrived, busDevId {:#010x} vid {:#06x} pid {:#06x}",
            info.bus_dev_id(),
            info.vendor_id,
            info.product_id
        );
        self.callback()?.on_device_add(descriptor).await
    }

    /// Entry point for the platform's hotplug glue: a device went away.
    pub async fn handle_device_removal(&self, info: UsbHotplugInfo) -> EdmResult<()> {
        let descriptor = Self::descriptor_for(&info);
        debug!("usb device removed, busDevId {:#010x}", info.bus_dev_id());
        self.callback()?.on_device_remove(descriptor).await
    }
}

/// Parses a comma-separated list of hexadecimal ids, e.g. `"0B57,0B58"`.
/// Elements that do not parse are skipped with a warning.
fn parse_comma_hex_u16(value: &str) -> Vec<u16> {
    let mut ids = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match u16::from_str_radix(part.trim_start_matches("0x").trim_start_matches("0X"), 16) {
            Ok(id) => ids.push(id),
            Err(_) => warn!("ignoring unparsable id '{}' in '{}'", part, value),
        }
    }
    if ids.is_empty() {
        warn!("no ids parsed from '{}'", value);
    }
    ids
}

fn metadata_value<'a>(metadata: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    metadata
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

impl BusExtension for UsbBusExtension {
    fn bus_type(&self) -> BusType {
        BusType::Usb
    }

    fn set_device_change_callback(&self, callback: Arc<dyn DeviceChangeCallback>) -> EdmResult<()> {
        *self.callback.lock().unwrap() = Some(callback);
        Ok(())
    }

    fn match_driver(&self, driver: &DriverDescriptor, device: &DeviceDescriptor) -> bool {
        if !driver.bus.eq_ignore_ascii_case("usb") {
            warn!("driver bus '{}' not handled by the usb extension", driver.bus);
            return false;
        }
        if device.bus_type != BusType::Usb {
            warn!("device bus {:?} not handled by the usb extension", device.bus_type);
            return false;
        }
        let DriverExt::Usb(ref criteria) = driver.ext;
        let DeviceExt::Usb(ref usb) = device.ext;
        if !criteria.vids.contains(&usb.vendor_id) {
            debug!("vid {:#06x} not matched", usb.vendor_id);
            return false;
        }
        if !criteria.pids.contains(&usb.product_id) {
            debug!("pid {:#06x} not matched", usb.product_id);
            return false;
        }
        info!(
            "usb driver matched, vid {:#06x} pid {:#06x}",
            usb.vendor_id, usb.product_id
        );
        true
    }

    fn parse_driver_info(&self, metadata: &HashMap<String, String>) -> EdmResult<DriverDescriptor> {
        let bus = metadata_value(metadata, "bus")
            .ok_or_else(|| EdmError::InvalidParameter("driver metadata missing bus".to_string()))?;
        if !bus.eq_ignore_ascii_case("usb") {
            return Err(EdmError::Unsupported(format!("bus '{}' not handled here", bus)));
        }
        let vids = metadata_value(metadata, "vid").map(parse_comma_hex_u16).unwrap_or_default();
        let pids = metadata_value(metadata, "pid").map(parse_comma_hex_u16).unwrap_or_default();
        Ok(DriverDescriptor {
            bus: "usb".to_string(),
            vendor: metadata_value(metadata, "vendor").unwrap_or_default().to_string(),
            version: metadata_value(metadata, "version").unwrap_or_default().to_string(),
            description: metadata_value(metadata, "description").unwrap_or_default().to_string(),
            ext: DriverExt::Usb(UsbDriverExt { vids, pids }),
        })
    }
}
