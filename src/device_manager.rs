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

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::controller::DriverExtensionController;
use crate::definitions::{BusType, DeviceDescriptor, DeviceId, PackageKey};
use crate::device::{ConnectionCallback, Device, RemoteObject};
use crate::errors::{EdmError, EdmResult};
use crate::package_manager::DriverPkgManager;

const UNLOAD_IDLE_INTERVAL: Duration = Duration::from_secs(30);

/// Asks the hosting process to unload this service once it is idle.
pub trait UnloadRequester: Send + Sync {
    fn request_unload(&self);
}

struct UnloadState {
    requester: Arc<dyn UnloadRequester>,
    timer: Option<JoinHandle<()>>,
}

/// Device registry: tracks registered devices per bus, maintains the
/// package match index and drives driver connections for matched devices.
pub struct ExtDeviceManager {
    controller: Arc<DriverExtensionController>,
    pkg_manager: Arc<DriverPkgManager>,
    device_map: Mutex<HashMap<BusType, HashMap<DeviceId, Arc<Device>>>>,
    match_index: Mutex<HashMap<PackageKey, HashSet<DeviceId>>>,
    unload: Mutex<UnloadState>,
}

impl ExtDeviceManager {
    pub fn new(
        controller: Arc<DriverExtensionController>,
        pkg_manager: Arc<DriverPkgManager>,
        unload_requester: Arc<dyn UnloadRequester>,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller,
            pkg_manager,
            device_map: Mutex::new(HashMap::new()),
            match_index: Mutex::new(HashMap::new()),
            unload: Mutex::new(UnloadState { requester: unload_requester, timer: None }),
        })
    }

    pub fn controller(&self) -> &Arc<DriverExtensionController> {
        &self.controller
    }

    fn find_device(&self, device_id: DeviceId) -> Option<Arc<Device>> {
        self.device_map
            .lock()
            .unwrap()
            .get(&device_id.bus_type())?
            .get(&device_id)
            .cloned()
    }

    /// Registers a hotplugged device: upserts the registry entry, matches
    /// a driver if none is bound yet, and connects it. A device that is
    /// already connected is left alone. A device with no matching driver
    /// stays registered, waiting for a package install.
    pub async fn register_device(self: &Arc<Self>, descriptor: DeviceDescriptor) -> EdmResult<()> {
        let device_id = descriptor.device_id();
        let (device, already_connected) = {
            let mut map = self.device_map.lock().unwrap();
            let bus_map = map.entry(descriptor.bus_type).or_default();
            match bus_map.get(&device_id) {
                Some(existing) => {
                    info!("device {} already registered", device_id);
                    (existing.clone(), existing.remote().is_some())
                }
                None => {
                    let device = Device::new(descriptor);
                    bus_map.insert(device_id, device.clone());
                    info!("registered device {}", device_id);
                    (device, false)
                }
            }
        };
        if already_connected {
            return Ok(());
        }

        if !device.has_driver() {
            if let Some(matched) = self.pkg_manager.query_match_driver(&device.descriptor()) {
                device.bind_driver(matched.package, matched.driver_uid);
            }
        }
        self.cancel_unload_timer();

        let Some(package) = device.package() else {
            debug!("device {} has no driver yet, waiting for a package install", device_id);
            return Ok(());
        };
        self.add_device_to_match_index(&device, &package).await
    }

    /// Unregisters a device. A device with a live driver connection is
    /// only marked; it leaves the registry when the disconnect completes.
    /// Unknown devices are ignored.
    pub async fn unregister_device(self: &Arc<Self>, descriptor: &DeviceDescriptor) -> EdmResult<()> {
        let device_id = descriptor.device_id();
        let found = {
            let mut map = self.device_map.lock().unwrap();
            let Some(bus_map) = map.get_mut(&descriptor.bus_type) else {
                return Ok(());
            };
            let Some(device) = bus_map.get(&device_id).cloned() else {
                return Ok(());
            };
            let package = device.package();
            if device.remote().is_some() {
                device.mark_unregistered();
            } else {
                bus_map.remove(&device_id);
            }
            info!("unregistered device {}", device_id);
            Some((device, package))
        };
        let Some((device, package)) = found else {
            return Ok(());
        };
        self.unload_self();

        let Some(package) = package else {
            return Ok(());
        };
        self.remove_device_from_match_index(&device, &package).await
    }

    /// Records the device under its package key and connects the driver.
    async fn add_device_to_match_index(
        self: &Arc<Self>,
        device: &Arc<Device>,
        package: &PackageKey,
    ) -> EdmResult<()> {
        let device_id = device.device_id();
        {
            let mut index = self.match_index.lock().unwrap();
            let ids = index.entry(package.clone()).or_default();
            if !ids.insert(device_id) {
                debug!("device {} already tracked under {}", device_id, package);
            }
        }
        device.connect_auto(&self.controller, self).await.map_err(|e| {
            error!("device {} failed to connect {}: {}", device_id, package, e);
            e
        })
    }

    /// Drops the device from its package's index entry; when the entry
    /// empties, the driver connection is torn down.
    async fn remove_device_from_match_index(
        &self,
        device: &Arc<Device>,
        package: &PackageKey,
    ) -> EdmResult<()> {
        let device_id = device.device_id();
        let disconnect = {
            let mut index = self.match_index.lock().unwrap();
            match index.get_mut(package) {
                None => {
                    debug!("package {} not in the match index", package);
                    return Ok(());
                }
                Some(ids) if !ids.contains(&device_id) => {
                    debug!("device {} already dropped from {}", device_id, package);
                    return Ok(());
                }
                Some(ids) if ids.len() > 1 => {
                    ids.remove(&device_id);
                    false
                }
                Some(_) => {
                    index.remove(package);
                    true
                }
            }
        };
        if disconnect {
            debug!("last device of {} gone, disconnecting", package);
            device.disconnect(&self.controller).await?;
        }
        Ok(())
    }

    /// Drops every match-index entry of one package (or all of them) and
    /// returns the device ids that were tracked there.
    pub fn delete_packages_from_match_index(
        &self,
        package_name: Option<&str>,
    ) -> HashSet<DeviceId> {
        let mut index = self.match_index.lock().unwrap();
        let mut device_ids = HashSet::new();
        match package_name {
            None => index.clear(),
            Some(name) => {
                index.retain(|key, ids| {
                    if key.package_name == name {
                        device_ids.extend(ids.iter().copied());
                        false
                    } else {
                        true
                    }
                });
            }
        }
        device_ids
    }

    /// Re-runs driver matching after the package store changed. Devices
    /// in `affected` lose their binding first; with `drivers_reset` every
    /// device does. Unregistered and still-connected devices are skipped.
    pub async fn match_driver_infos(
        self: &Arc<Self>,
        affected: &HashSet<DeviceId>,
        drivers_reset: bool,
    ) {
        info!("re-running driver matching over {} affected devices", affected.len());
        let devices: Vec<Arc<Device>> = {
            let map = self.device_map.lock().unwrap();
            map.values().flat_map(|m| m.values().cloned()).collect()
        };
        for device in devices {
            let device_id = device.device_id();
            if drivers_reset {
                device.clear_driver();
                device.reset_connection();
            }
            if affected.contains(&device_id) {
                device.clear_driver();
                if device.remote().is_some() && !device.is_unregistered() {
                    debug!("device {} lost its driver package, disconnecting", device_id);
                    if let Err(e) = device.disconnect(&self.controller).await {
                        warn!("device {} disconnect after losing its package failed: {}", device_id, e);
                    }
                    continue;
                }
            }
            if device.is_unregistered() || device.remote().is_some() {
                continue;
            }
            let Some(matched) = self.pkg_manager.query_match_driver(&device.descriptor()) else {
                debug!("device {} still has no driver", device_id);
                continue;
            };
            device.bind_driver(matched.package.clone(), matched.driver_uid);
            if let Err(e) = self.add_device_to_match_index(&device, &matched.package).await {
                warn!("device {} could not be connected after re-match: {}", device_id, e);
            }
        }
    }

    /// Account switch: stop every bound driver component for the previous
    /// user and forget the match index.
    pub async fn clear_matched_drivers(&self, user_id: i32) {
        info!("clearing matched drivers for user {}", user_id);
        let packages: Vec<PackageKey> = {
            let mut index = self.match_index.lock().unwrap();
            let packages = index.keys().cloned().collect();
            index.clear();
            packages
        };
        for package in packages {
            if let Err(e) = self.controller.stop_driver_extension(&package, Some(user_id)).await {
                warn!("failed to stop {}: {}", package, e);
            }
        }
    }

    /// Active (not soft-unregistered) devices on one bus.
    pub fn query_devices(&self, bus_type: BusType) -> Vec<Arc<DeviceDescriptor>> {
        let map = self.device_map.lock().unwrap();
        let Some(bus_map) = map.get(&bus_type) else {
            debug!("no devices on bus {:?}", bus_type);
            return Vec::new();
        };
        bus_map
            .values()
            .filter(|d| !d.is_unregistered())
            .map(|d| d.descriptor())
            .collect()
    }

    pub fn query_all_devices(&self) -> Vec<Arc<Device>> {
        let map = self.device_map.lock().unwrap();
        map.values()
            .flat_map(|m| m.values())
            .filter(|d| !d.is_unregistered())
            .cloned()
            .collect()
    }

    pub fn query_devices_by_id(&self, device_id: DeviceId) -> Vec<Arc<Device>> {
        self.find_device(device_id)
            .into_iter()
            .filter(|d| !d.is_unregistered())
            .collect()
    }

    fn device_by_id(&self, device_id: DeviceId) -> EdmResult<Arc<Device>> {
        self.find_device(device_id)
            .ok_or_else(|| EdmError::NotFound(format!("no device {}", device_id)))
    }

    /// Client-driven connect with a callback handle.
    pub async fn connect_device(
        self: &Arc<Self>,
        device_id: DeviceId,
        callback: Arc<dyn ConnectionCallback>,
    ) -> EdmResult<()> {
        let device = self.device_by_id(device_id)?;
        device.connect(callback, &self.controller, self).await
    }

    pub async fn disconnect_device(&self, device_id: DeviceId) -> EdmResult<()> {
        let device = self.device_by_id(device_id)?;
        device.disconnect(&self.controller).await
    }

    pub fn total_active_devices(&self) -> usize {
        let map = self.device_map.lock().unwrap();
        map.values().flat_map(|m| m.values()).filter(|d| !d.is_unregistered()).count()
    }

    /// Routes a connect completion to its device.
    pub(crate) async fn handle_connect_done(
        &self,
        device_id: DeviceId,
        remote: Option<Arc<dyn RemoteObject>>,
        status: i32,
    ) -> EdmResult<()> {
        let device = self.device_by_id(device_id)?;
        device.on_connect_complete(remote, status);
        Ok(())
    }

    /// Routes a disconnect completion to its device, finishes a deferred
    /// unregistration, stops the driver component and re-evaluates the
    /// idle timer.
    pub(crate) async fn handle_disconnect_done(
        self: &Arc<Self>,
        device_id: DeviceId,
        status: i32,
    ) -> EdmResult<()> {
        let device = self.device_by_id(device_id)?;
        let outcome = device.on_disconnect_complete(status);
        if outcome.unregistered {
            let mut map = self.device_map.lock().unwrap();
            if let Some(bus_map) = map.get_mut(&device_id.bus_type()) {
                bus_map.remove(&device_id);
                info!("removed device {} after its driver disconnected", device_id);
            }
        }
        if let Some(package) = outcome.package {
            if let Err(e) = self.controller.stop_driver_extension(&package, None).await {
                warn!("failed to stop {}: {}", package, e);
            }
        }
        self.unload_self();
        Ok(())
    }

    fn cancel_unload_timer(&self) {
        if let Some(timer) = self.unload.lock().unwrap().timer.take() {
            timer.abort();
        }
    }

    /// Arms the idle unload timer when no active devices remain. Any
    /// pending timer is dropped first; the requester fires only if the
    /// registry is still empty when the timer expires.
    pub fn unload_self(self: &Arc<Self>) {
        let active = self.total_active_devices();
        let mut unload = self.unload.lock().unwrap();
        if let Some(timer) = unload.timer.take() {
            timer.abort();
        }
        if active != 0 {
            debug!("{} devices still active, no unload", active);
            return;
        }
        let registry = Arc::downgrade(self);
        unload.timer = Some(tokio::spawn(async move {
            sleep(UNLOAD_IDLE_INTERVAL).await;
            let Some(registry) = registry.upgrade() else {
                return;
            };
            if registry.total_active_devices() == 0 {
                info!("no devices registered, requesting service unload");
                registry.unload.lock().unwrap().requester.request_unload();
            }
        }));
    }

    #[cfg(test)]
    pub(crate) fn match_index_snapshot(&self) -> HashMap<PackageKey, HashSet<DeviceId>> {
        self.match_index.lock().unwrap().clone()
    }
}
