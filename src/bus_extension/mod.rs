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

//! Bus extension seam: each supported hardware bus plugs in as a
//! [`BusExtension`] registered with the [`BusExtensionRegistry`].

pub mod usb;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, error, info};

use crate::definitions::{BusType, DeviceDescriptor, DriverDescriptor};
use crate::errors::{EdmError, EdmResult};

const MAX_BUS_EXTENSIONS: usize = 100;

/// Receives device arrival/removal events from a bus extension.
#[async_trait]
pub trait DeviceChangeCallback: Send + Sync {
    async fn on_device_add(&self, descriptor: DeviceDescriptor) -> EdmResult<()>;
    async fn on_device_remove(&self, descriptor: DeviceDescriptor) -> EdmResult<()>;
}

/// One hardware bus adapter. Owns the bus-specific parts of device and
/// driver descriptors; the core never looks inside them.
pub trait BusExtension: Send + Sync {
    fn bus_type(&self) -> BusType;

    /// Wires the bus to the device registry. Called once during init.
    fn set_device_change_callback(&self, callback: Arc<dyn DeviceChangeCallback>) -> EdmResult<()>;

    /// Whether the driver's declared criteria accept this device.
    fn match_driver(&self, driver: &DriverDescriptor, device: &DeviceDescriptor) -> bool;

    /// Builds a driver descriptor from a component's key/value metadata.
    fn parse_driver_info(&self, metadata: &HashMap<String, String>) -> EdmResult<DriverDescriptor>;
}

/// Explicit registry of bus extensions, built by the composition root.
#[derive(Default)]
pub struct BusExtensionRegistry {
    extensions: Mutex<HashMap<BusType, Arc<dyn BusExtension>>>,
}

impl BusExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a bus extension. Registering the same bus type twice is
    /// accepted and keeps the first registration.
    pub fn register(&self, extension: Arc<dyn BusExtension>) -> EdmResult<()> {
        let bus_type = extension.bus_type();
        let mut extensions = self.extensions.lock().unwrap();
        if extensions.len() >= MAX_BUS_EXTENSIONS {
            error!("bus extension limit reached, rejecting {:?}", bus_type);
            return Err(EdmError::InvalidObject("bus extension limit reached".to_string()));
        }
        if extensions.contains_key(&bus_type) {
            info!("bus type {:?} already registered", bus_type);
            return Ok(());
        }
        extensions.insert(bus_type, extension);
        debug!("bus type {:?} registered", bus_type);
        Ok(())
    }

    pub fn get(&self, bus_type: BusType) -> Option<Arc<dyn BusExtension>> {
        self.extensions.lock().unwrap().get(&bus_type).cloned()
    }

    /// Looks up a bus extension by the bus name used in driver metadata,
    /// case-insensitively.
    pub fn get_by_name(&self, bus_name: &str) -> Option<Arc<dyn BusExtension>> {
        let bus_type = BusType::from_name(bus_name)?;
        self.get(bus_type)
    }

    /// Hands the device change callback to every registered extension. A
    /// failing extension is logged and does not stop the others; the first
    /// error is returned once all have been attempted.
    pub fn init(&self, callback: Arc<dyn DeviceChangeCallback>) -> EdmResult<()> {
        let extensions: Vec<_> = self.extensions.lock().unwrap().values().cloned().collect();
        let mut first_err = None;
        for extension in extensions {
            match extension.set_device_change_callback(callback.clone()) {
                Ok(()) => debug!("bus extension {:?} initialized", extension.bus_type()),
                Err(e) => {
                    error!("bus extension {:?} init failed: {}", extension.bus_type(), e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
