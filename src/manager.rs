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

//! Composition root: wires the bus extensions, the package manager and the
//! device registry together and exposes the client-facing operations.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, error, info};
use tokio::select;
use tokio::sync::mpsc;

use crate::bus_extension::usb::UsbBusExtension;
use crate::bus_extension::{BusExtensionRegistry, DeviceChangeCallback};
use crate::controller::{ComponentActivator, DriverExtensionController};
use crate::definitions::{BusType, DeviceData, DeviceDescriptor, DeviceId, DeviceInfoData, DriverInfoData};
use crate::device::ConnectionCallback;
use crate::device_manager::{ExtDeviceManager, UnloadRequester};
use crate::errors::{EdmError, EdmResult};
use crate::package_manager::{DriverComponentProvider, DriverPkgManager, PackageChange};
use crate::package_store::PkgStore;
use crate::service::{spawn_service, ServiceHandle};

/// Feeds bus hotplug events into the device registry.
struct DevChangeCallback {
    registry: Arc<ExtDeviceManager>,
}

#[async_trait]
impl DeviceChangeCallback for DevChangeCallback {
    async fn on_device_add(&self, descriptor: DeviceDescriptor) -> EdmResult<()> {
        self.registry.register_device(descriptor).await
    }

    async fn on_device_remove(&self, descriptor: DeviceDescriptor) -> EdmResult<()> {
        self.registry.unregister_device(&descriptor).await
    }
}

/// The external device manager service.
///
/// Owns every subsystem; the host process supplies the platform
/// collaborators and the package store, feeds hotplug and package events
/// in, and calls the query/bind operations on behalf of clients.
pub struct DriverExtMgr {
    bus_registry: Arc<BusExtensionRegistry>,
    usb: Arc<UsbBusExtension>,
    pkg_manager: Arc<DriverPkgManager>,
    registry: Arc<ExtDeviceManager>,
    package_events_tx: mpsc::UnboundedSender<PackageChange>,
    package_events_rx: Mutex<Option<mpsc::UnboundedReceiver<PackageChange>>>,
}

impl DriverExtMgr {
    pub fn new(
        store: Arc<PkgStore>,
        activator: Arc<dyn ComponentActivator>,
        provider: Arc<dyn DriverComponentProvider>,
        unload_requester: Arc<dyn UnloadRequester>,
        current_user: i32,
    ) -> EdmResult<Arc<Self>> {
        let bus_registry = Arc::new(BusExtensionRegistry::new());
        let usb = Arc::new(UsbBusExtension::new());
        bus_registry.register(usb.clone())?;

        let pkg_manager = Arc::new(DriverPkgManager::new(
            store,
            bus_registry.clone(),
            provider,
            current_user,
        ));
        let controller = Arc::new(DriverExtensionController::new(activator));
        let registry = ExtDeviceManager::new(controller, pkg_manager.clone(), unload_requester);
        let (package_events_tx, package_events_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            bus_registry,
            usb,
            pkg_manager,
            registry,
            package_events_tx,
            package_events_rx: Mutex::new(Some(package_events_rx)),
        }))
    }

    /// Wires the registered bus extensions to the device registry. Call
    /// once before feeding hotplug events.
    pub fn init(self: &Arc<Self>) -> EdmResult<()> {
        let callback = Arc::new(DevChangeCallback { registry: self.registry.clone() });
        self.bus_registry.init(callback)
    }

    pub fn bus_registry(&self) -> &Arc<BusExtensionRegistry> {
        &self.bus_registry
    }

    /// The USB adapter, for the host's hotplug glue.
    pub fn usb_extension(&self) -> &Arc<UsbBusExtension> {
        &self.usb
    }

    pub fn device_registry(&self) -> &Arc<ExtDeviceManager> {
        &self.registry
    }

    /// Sender for package install/update/removal notifications; consumed
    /// by the loop spawned in [`DriverExtMgr::run`].
    pub fn package_change_sender(&self) -> mpsc::UnboundedSender<PackageChange> {
        self.package_events_tx.clone()
    }

    /// Spawns the package reconciliation event loop.
    pub fn run(self: &Arc<Self>) -> EdmResult<ServiceHandle> {
        let mut events = self
            .package_events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| EdmError::InvalidObject("event loop already running".to_string()))?;
        let mgr = self.clone();
        Ok(spawn_service(move |mut stop| async move {
            info!("package event loop started");
            loop {
                select! {
                    biased;
                    _ = stop.signaled() => {
                        info!("package event loop stopping");
                        break;
                    }
                    event = events.recv() => match event {
                        Some(change) => mgr.handle_package_change(change).await,
                        None => {
                            info!("package event channel closed");
                            break;
                        }
                    }
                }
            }
        }))
    }

    /// Applies one package change: invalidate the match index, reconcile
    /// the store, then re-run matching for the affected and unbound
    /// devices. Events for a non-current user are ignored.
    pub async fn handle_package_change(self: &Arc<Self>, change: PackageChange) {
        if !self.pkg_manager.is_current_user(change.user_id) {
            info!("ignoring package event of user {} ({})", change.user_id, change.package_name);
            return;
        }
        debug!("package {} changed: {:?}", change.package_name, change.kind);
        let affected = self.registry.delete_packages_from_match_index(Some(&change.package_name));
        if let Err(e) = self.pkg_manager.reconcile_package(&change) {
            error!("failed to reconcile package {}: {}", change.package_name, e);
            return;
        }
        self.registry.match_driver_infos(&affected, false).await;
    }

    /// Account switch: stop the previous user's driver components, adopt
    /// the new user and re-match everything against their packages.
    pub async fn handle_user_switch(self: &Arc<Self>, user_id: i32) {
        let previous = self.pkg_manager.current_user();
        if previous == user_id {
            return;
        }
        info!("switching active user {} -> {}", previous, user_id);
        self.registry.clear_matched_drivers(previous).await;
        self.pkg_manager.set_current_user(user_id);
        self.pkg_manager.reset_scan();
        self.registry.match_driver_infos(&HashSet::new(), true).await;
    }

    /// Lists the active devices of one bus.
    pub fn query_devices(&self, bus_type_raw: u32) -> EdmResult<Vec<DeviceData>> {
        let bus_type = BusType::from_raw(bus_type_raw).ok_or_else(|| {
            EdmError::InvalidParameter(format!("unknown bus type {}", bus_type_raw))
        })?;
        Ok(self
            .registry
            .query_devices(bus_type)
            .iter()
            .map(|d| DeviceData::from_descriptor(d))
            .collect())
    }

    /// Connects a client to a device's driver extension.
    pub async fn bind_device(
        &self,
        device_id: DeviceId,
        callback: Arc<dyn ConnectionCallback>,
    ) -> EdmResult<()> {
        self.registry.connect_device(device_id, callback).await
    }

    /// Releases a client-driven driver connection.
    pub async fn unbind_device(&self, device_id: DeviceId) -> EdmResult<()> {
        self.registry.disconnect_device(device_id).await
    }

    /// Device details including the matched driver, for one device or all
    /// of them.
    pub fn query_device_info(&self, device_id: Option<DeviceId>) -> Vec<DeviceInfoData> {
        let devices = match device_id {
            Some(id) => self.registry.query_devices_by_id(id),
            None => self.registry.query_all_devices(),
        };
        devices
            .iter()
            .map(|d| DeviceInfoData {
                device: DeviceData::from_descriptor(&d.descriptor()),
                driver_uid: d.driver_uid(),
            })
            .collect()
    }

    /// Stored driver package details, optionally for one driver uid.
    pub fn query_driver_info(&self, driver_uid: Option<&str>) -> EdmResult<Vec<DriverInfoData>> {
        self.pkg_manager.query_driver_info(driver_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_extension::usb::UsbHotplugInfo;
    use crate::definitions::PackageKey;
    use crate::device::{ConnectNotifier, RemoteObject};
    use crate::package_manager::{DriverComponent, PackageChangeKind};
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    struct TestRemote(u64);

    impl RemoteObject for TestRemote {
        fn object_id(&self) -> u64 {
            self.0
        }
    }

    #[derive(Default)]
    struct AutoActivator {
        stops: AtomicUsize,
    }

    #[async_trait]
    impl ComponentActivator for AutoActivator {
        async fn start_component(&self, _package: &PackageKey) -> EdmResult<()> {
            Ok(())
        }

        async fn stop_component(
            &self,
            _package: &PackageKey,
            _user_id: Option<i32>,
        ) -> EdmResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn connect_component(
            &self,
            _package: &PackageKey,
            notifier: Arc<ConnectNotifier>,
            device_id: DeviceId,
        ) -> EdmResult<()> {
            tokio::spawn(async move {
                let _ = notifier
                    .on_connect_done(Some(Arc::new(TestRemote(device_id.raw()))), 0)
                    .await;
            });
            Ok(())
        }

        async fn disconnect_component(&self, notifier: Arc<ConnectNotifier>) -> EdmResult<()> {
            tokio::spawn(async move {
                let _ = notifier.on_disconnect_done(0).await;
            });
            Ok(())
        }
    }

    struct FakeProvider {
        components: Mutex<Vec<DriverComponent>>,
    }

    impl DriverComponentProvider for FakeProvider {
        fn fetch_driver_components(
            &self,
            package_name: Option<&str>,
            _user_id: i32,
        ) -> Vec<DriverComponent> {
            self.components
                .lock()
                .unwrap()
                .iter()
                .filter(|c| package_name.map_or(true, |n| c.package_name == n))
                .cloned()
                .collect()
        }
    }

    struct NoUnload;

    impl UnloadRequester for NoUnload {
        fn request_unload(&self) {}
    }

    struct ClientCallback {
        connects: AtomicUsize,
        unbinds: AtomicUsize,
    }

    impl ClientCallback {
        fn new() -> Arc<Self> {
            Arc::new(Self { connects: AtomicUsize::new(0), unbinds: AtomicUsize::new(0) })
        }
    }

    impl ConnectionCallback for ClientCallback {
        fn object_id(&self) -> u64 {
            1
        }

        fn on_connect(
            &self,
            _device_id: DeviceId,
            remote: Option<Arc<dyn RemoteObject>>,
            status: i32,
        ) {
            assert!(remote.is_some());
            assert_eq!(status, 0);
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_unbind(&self, _device_id: DeviceId, _status: i32) {
            self.unbinds.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnect(&self, _device_id: DeviceId, _status: i32) {}

        fn closed(&self) -> BoxFuture<'static, ()> {
            Box::pin(std::future::pending())
        }
    }

    fn usb_component(package: &str, vid: &str, pid: &str) -> DriverComponent {
        DriverComponent {
            package_name: package.to_string(),
            component_name: "entry".to_string(),
            access_token_id: 9,
            user_id: 100,
            app_index: 0,
            metadata: [
                ("bus".to_string(), "usb".to_string()),
                ("vid".to_string(), vid.to_string()),
                ("pid".to_string(), pid.to_string()),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn hotplug(bus_num: u8, dev_addr: u8, vid: u16, pid: u16) -> UsbHotplugInfo {
        UsbHotplugInfo {
            bus_num,
            dev_addr,
            vendor_id: vid,
            product_id: pid,
            description: "test device".to_string(),
            interfaces: vec![],
        }
    }

    struct Setup {
        mgr: Arc<DriverExtMgr>,
        provider: Arc<FakeProvider>,
        activator: Arc<AutoActivator>,
    }

    fn setup(components: Vec<DriverComponent>) -> Setup {
        let _ = env_logger::builder().is_test(true).try_init();
        let provider = Arc::new(FakeProvider { components: Mutex::new(components) });
        let activator = Arc::new(AutoActivator::default());
        let mgr = DriverExtMgr::new(
            Arc::new(PkgStore::open_in_memory().unwrap()),
            activator.clone(),
            provider.clone(),
            Arc::new(NoUnload),
            100,
        )
        .unwrap();
        mgr.init().unwrap();
        Setup { mgr, provider, activator }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn plugged_device_gets_its_driver_and_serves_clients() {
        let s = setup(vec![usb_component("com.acme.driver", "12ab", "34cd")]);

        let info = hotplug(1, 2, 0x12ab, 0x34cd);
        s.mgr.usb_extension().handle_device_arrival(info.clone()).await.unwrap();

        let device_id = DeviceId::new(BusType::Usb, info.bus_dev_id());
        wait_until(|| {
            s.mgr.query_device_info(Some(device_id)).first().map_or(false, |i| i.driver_uid.is_some())
        })
        .await;

        let devices = s.mgr.query_devices(BusType::Usb as u32).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].vendor_id, 0x12ab);

        let callback = ClientCallback::new();
        s.mgr.bind_device(device_id, callback.clone()).await.unwrap();
        wait_until(|| callback.connects.load(Ordering::SeqCst) == 1).await;

        s.mgr.usb_extension().handle_device_removal(info).await.unwrap();
        wait_until(|| callback.unbinds.load(Ordering::SeqCst) == 1).await;
        assert!(s.mgr.query_devices(BusType::Usb as u32).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn package_install_event_binds_a_waiting_device() {
        let s = setup(vec![]);
        let loop_handle = s.mgr.run().unwrap();
        let events = s.mgr.package_change_sender();

        let info = hotplug(1, 2, 0x12ab, 0x34cd);
        s.mgr.usb_extension().handle_device_arrival(info.clone()).await.unwrap();
        let device_id = DeviceId::new(BusType::Usb, info.bus_dev_id());
        assert!(s.mgr.query_device_info(Some(device_id))[0].driver_uid.is_none());

        s.provider
            .components
            .lock()
            .unwrap()
            .push(usb_component("com.acme.driver", "12ab", "34cd"));
        events
            .send(PackageChange {
                kind: PackageChangeKind::Added,
                package_name: "com.acme.driver".to_string(),
                user_id: 100,
            })
            .unwrap();

        wait_until(|| {
            s.mgr.query_device_info(Some(device_id)).first().map_or(false, |i| i.driver_uid.is_some())
        })
        .await;
        assert_eq!(s.mgr.query_driver_info(None).unwrap().len(), 1);

        loop_handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn package_removal_event_unbinds_its_devices() {
        let s = setup(vec![usb_component("com.acme.driver", "12ab", "34cd")]);
        let loop_handle = s.mgr.run().unwrap();
        let events = s.mgr.package_change_sender();

        let info = hotplug(1, 2, 0x12ab, 0x34cd);
        s.mgr.usb_extension().handle_device_arrival(info).await.unwrap();
        let device_id = DeviceId::new(BusType::Usb, 0x0001_0002);
        wait_until(|| {
            s.mgr.query_device_info(Some(device_id)).first().map_or(false, |i| i.driver_uid.is_some())
        })
        .await;

        s.provider.components.lock().unwrap().clear();
        events
            .send(PackageChange {
                kind: PackageChangeKind::Removed,
                package_name: "com.acme.driver".to_string(),
                user_id: 100,
            })
            .unwrap();

        wait_until(|| {
            s.mgr.query_device_info(Some(device_id)).first().map_or(false, |i| i.driver_uid.is_none())
        })
        .await;
        assert!(s.mgr.query_driver_info(None).unwrap().is_empty());

        loop_handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn events_of_other_users_are_ignored() {
        let s = setup(vec![]);
        let mgr = s.mgr.clone();

        // Run the initial (empty) scan first so the later readback does
        // not pick the package up through it.
        assert!(mgr.query_driver_info(None).unwrap().is_empty());

        s.provider
            .components
            .lock()
            .unwrap()
            .push(usb_component("com.acme.driver", "12ab", "34cd"));
        mgr.handle_package_change(PackageChange {
            kind: PackageChangeKind::Added,
            package_name: "com.acme.driver".to_string(),
            user_id: 101,
        })
        .await;
        assert!(mgr.query_driver_info(None).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn user_switch_stops_drivers_and_rematches() {
        let s = setup(vec![usb_component("com.acme.driver", "12ab", "34cd")]);

        let info = hotplug(1, 2, 0x12ab, 0x34cd);
        s.mgr.usb_extension().handle_device_arrival(info).await.unwrap();
        let device_id = DeviceId::new(BusType::Usb, 0x0001_0002);
        wait_until(|| {
            s.mgr.query_device_info(Some(device_id)).first().map_or(false, |i| i.driver_uid.is_some())
        })
        .await;

        // The new user has no driver packages installed.
        s.provider.components.lock().unwrap().clear();
        s.mgr.handle_user_switch(101).await;

        assert_eq!(s.activator.stops.load(Ordering::SeqCst), 1);
        assert!(s.mgr.query_device_info(Some(device_id))[0].driver_uid.is_none());
        assert!(s.mgr.query_driver_info(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_arguments_are_reported() {
        let s = setup(vec![]);
        let err = s.mgr.query_devices(99).unwrap_err();
        assert!(matches!(err, EdmError::InvalidParameter(_)));

        let err = s
            .mgr
            .bind_device(DeviceId::new(BusType::Usb, 5), ClientCallback::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EdmError::NotFound(_)));

        let err = s.mgr.unbind_device(DeviceId::new(BusType::Usb, 5)).await.unwrap_err();
        assert!(matches!(err, EdmError::NotFound(_)));

        assert!(s.mgr.run().is_ok());
        assert!(matches!(s.mgr.run(), Err(EdmError::InvalidObject(_))));
    }
}
