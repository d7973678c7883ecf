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
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use tokio::time::sleep;

use crate::controller::DriverExtensionController;
use crate::definitions::{DeviceDescriptor, DeviceId, PackageKey};
use crate::device_manager::ExtDeviceManager;
use crate::errors::{EdmError, EdmResult};

// Component resolution can fail while the driver package is still being
// installed; the automatic connect path waits out up to 3 s of that.
const CONNECT_RETRY_ATTEMPTS: u32 = 30;
const CONNECT_RETRY_PERIOD: Duration = Duration::from_millis(100);

/// Opaque capability handed back by a connected driver extension.
pub trait RemoteObject: Send + Sync {
    fn object_id(&self) -> u64;
}

/// Client-side callback handle for bind/unbind notifications.
///
/// Completion statuses are the platform's raw result codes, zero meaning
/// success.
pub trait ConnectionCallback: Send + Sync {
    /// Stable identity of the callback object; registering the same
    /// identity twice keeps a single entry.
    fn object_id(&self) -> u64;

    fn on_connect(&self, device_id: DeviceId, remote: Option<Arc<dyn RemoteObject>>, status: i32);

    fn on_unbind(&self, device_id: DeviceId, status: i32);

    fn on_disconnect(&self, device_id: DeviceId, status: i32);

    /// Resolves when the client side of the callback goes away. The
    /// callback is then dropped from its device.
    fn closed(&self) -> BoxFuture<'static, ()> {
        Box::pin(std::future::pending())
    }
}

/// What the controller remembers about an in-flight or live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub package: PackageKey,
    pub device_id: DeviceId,
}

/// Receives connection completions from the platform and routes them to
/// the owning registry by device id.
pub struct ConnectNotifier {
    device_id: DeviceId,
    registry: Weak<ExtDeviceManager>,
    record: Mutex<Option<ConnectionRecord>>,
}

impl ConnectNotifier {
    pub fn new(device_id: DeviceId, registry: Weak<ExtDeviceManager>) -> Arc<Self> {
        Arc::new(Self { device_id, registry, record: Mutex::new(None) })
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn has_record(&self) -> bool {
        self.record.lock().unwrap().is_some()
    }

    pub fn record(&self) -> Option<ConnectionRecord> {
        self.record.lock().unwrap().clone()
    }

    pub(crate) fn install_record(&self, record: ConnectionRecord) {
        *self.record.lock().unwrap() = Some(record);
    }

    pub(crate) fn clear_record(&self) {
        *self.record.lock().unwrap() = None;
    }

    /// Called by the platform when the connect request completes.
    pub async fn on_connect_done(
        &self,
        remote: Option<Arc<dyn RemoteObject>>,
        status: i32,
    ) -> EdmResult<()> {
        let registry = self.registry.upgrade().ok_or_else(|| {
            EdmError::InvalidObject("device registry is gone".to_string())
        })?;
        registry.handle_connect_done(self.device_id, remote, status).await
    }

    /// Called by the platform when the connection ends.
    pub async fn on_disconnect_done(&self, status: i32) -> EdmResult<()> {
        let registry = self.registry.upgrade().ok_or_else(|| {
            EdmError::InvalidObject("device registry is gone".to_string())
        })?;
        registry.handle_disconnect_done(self.device_id, status).await
    }
}

#[derive(Default)]
struct DeviceState {
    package: Option<PackageKey>,
    driver_uid: Option<String>,
    remote: Option<Arc<dyn RemoteObject>>,
    callbacks: HashMap<u64, Arc<dyn ConnectionCallback>>,
    notifier: Option<Arc<ConnectNotifier>>,
    unregistered: bool,
}

/// What the registry must do after a disconnect completion has been
/// applied to the device.
pub(crate) struct DisconnectOutcome {
    pub unregistered: bool,
    pub package: Option<PackageKey>,
}

/// One registered device and its driver connection state.
///
/// Connect/disconnect sequences are serialized by an async op lock; the
/// mutable state sits behind a plain mutex that is never held across an
/// await. Completion fan-out collects the callbacks under the lock and
/// invokes them after releasing it.
pub struct Device {
    descriptor: Arc<DeviceDescriptor>,
    op_lock: tokio::sync::Mutex<()>,
    inner: Mutex<DeviceState>,
}

impl Device {
    pub fn new(descriptor: DeviceDescriptor) -> Arc<Self> {
        Arc::new(Self {
            descriptor: Arc::new(descriptor),
            op_lock: tokio::sync::Mutex::new(()),
            inner: Mutex::new(DeviceState::default()),
        })
    }

    pub fn descriptor(&self) -> Arc<DeviceDescriptor> {
        self.descriptor.clone()
    }

    pub fn device_id(&self) -> DeviceId {
        self.descriptor.device_id()
    }

    pub fn package(&self) -> Option<PackageKey> {
        self.inner.lock().unwrap().package.clone()
    }

    pub fn driver_uid(&self) -> Option<String> {
        self.inner.lock().unwrap().driver_uid.clone()
    }

    pub fn has_driver(&self) -> bool {
        self.inner.lock().unwrap().package.is_some()
    }

    pub fn remote(&self) -> Option<Arc<dyn RemoteObject>> {
        self.inner.lock().unwrap().remote.clone()
    }

    pub fn is_unregistered(&self) -> bool {
        self.inner.lock().unwrap().unregistered
    }

    pub(crate) fn bind_driver(&self, package: PackageKey, driver_uid: String) {
        let mut state = self.inner.lock().unwrap();
        state.package = Some(package);
        state.driver_uid = Some(driver_uid);
    }

    pub(crate) fn clear_driver(&self) {
        let mut state = self.inner.lock().unwrap();
        state.package = None;
        state.driver_uid = None;
    }

    pub(crate) fn clear_remote(&self) {
        self.inner.lock().unwrap().remote = None;
    }

    /// Forgets the remote and the notifier entirely. Used when drivers are
    /// reset wholesale; the stale notifier may still carry a connection
    /// record that would block a reconnect.
    pub(crate) fn reset_connection(&self) {
        let mut state = self.inner.lock().unwrap();
        state.remote = None;
        state.notifier = None;
    }

    /// Marks the device as gone while its driver connection still winds
    /// down; the registry drops it once the disconnect completes.
    pub(crate) fn mark_unregistered(&self) {
        self.inner.lock().unwrap().unregistered = true;
    }

    /// Adds a client callback, keyed by its object identity, and watches
    /// its `closed()` future so a vanished client is cleaned up.
    pub fn register_callback(self: &Arc<Self>, callback: Arc<dyn ConnectionCallback>) {
        let id = callback.object_id();
        let inserted = {
            let mut state = self.inner.lock().unwrap();
            if state.callbacks.contains_key(&id) {
                debug!("callback {} already registered on device {}", id, self.device_id());
                false
            } else {
                state.callbacks.insert(id, callback.clone());
                true
            }
        };
        if inserted {
            self.spawn_closed_watch(id, &callback);
        }
    }

    fn spawn_closed_watch(self: &Arc<Self>, id: u64, callback: &Arc<dyn ConnectionCallback>) {
        let closed = callback.closed();
        let device = Arc::downgrade(self);
        tokio::spawn(async move {
            closed.await;
            if let Some(device) = device.upgrade() {
                debug!("callback {} went away, dropping it", id);
                device.remove_callback(id);
            }
        });
    }

    pub fn remove_callback(&self, object_id: u64) {
        self.inner.lock().unwrap().callbacks.remove(&object_id);
    }

    #[cfg(test)]
    pub(crate) fn callback_count(&self) -> usize {
        self.inner.lock().unwrap().callbacks.len()
    }

    fn ensure_notifier(&self, registry: &Arc<ExtDeviceManager>) -> Arc<ConnectNotifier> {
        let mut state = self.inner.lock().unwrap();
        if let Some(notifier) = &state.notifier {
            return notifier.clone();
        }
        let notifier = ConnectNotifier::new(self.descriptor.device_id(), Arc::downgrade(registry));
        state.notifier = Some(notifier.clone());
        notifier
    }

    fn fresh_notifier(&self, registry: &Arc<ExtDeviceManager>) -> Arc<ConnectNotifier> {
        let notifier = ConnectNotifier::new(self.descriptor.device_id(), Arc::downgrade(registry));
        self.inner.lock().unwrap().notifier = Some(notifier.clone());
        notifier
    }

    fn notifier(&self) -> Option<Arc<ConnectNotifier>> {
        self.inner.lock().unwrap().notifier.clone()
    }

    /// Connects the matched driver extension, retrying while the component
    /// is not resolvable yet. Used by the hotplug/reconciliation path.
    pub async fn connect_auto(
        self: &Arc<Self>,
        controller: &DriverExtensionController,
        registry: &Arc<ExtDeviceManager>,
    ) -> EdmResult<()> {
        let _op = self.op_lock.lock().await;
        let device_id = self.device_id();
        let package = self.package().ok_or_else(|| {
            EdmError::InvalidObject(format!("device {} has no driver bound", device_id))
        })?;
        let notifier = self.ensure_notifier(registry);
        // A duplicate hotplug arrival can land while the first connect is
        // still pending; that request will finish the job.
        if notifier.has_record() {
            debug!("device {} already has a connect in flight", device_id);
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            match controller.connect_driver_extension(&package, &notifier, device_id).await {
                Ok(()) => return Ok(()),
                Err(EdmError::ComponentNotResolvable(_)) if attempt < CONNECT_RETRY_ATTEMPTS => {
                    attempt += 1;
                    warn!(
                        "component {} not resolvable for device {}, retry {}",
                        package, device_id, attempt
                    );
                    self.clear_remote();
                    sleep(CONNECT_RETRY_PERIOD).await;
                }
                Err(e) => {
                    error!("device {} failed to connect {}: {}", device_id, package, e);
                    return Err(e);
                }
            }
        }
    }

    /// Client-driven connect. If a remote is already live the callback is
    /// answered immediately; if a connect is in flight its completion will
    /// answer the callback; otherwise a fresh connect request is issued.
    ///
    /// Registering the callback and deciding how to answer it happen under
    /// one lock, so a completion racing this call either includes the
    /// callback in its fan-out or leaves a remote for the immediate
    /// answer, never neither.
    pub async fn connect(
        self: &Arc<Self>,
        callback: Arc<dyn ConnectionCallback>,
        controller: &DriverExtensionController,
        registry: &Arc<ExtDeviceManager>,
    ) -> EdmResult<()> {
        enum Next {
            Answer(Arc<dyn RemoteObject>),
            RideInFlight,
            IssueConnect,
        }
        let _op = self.op_lock.lock().await;
        let device_id = self.device_id();
        let id = callback.object_id();
        let (inserted, next) = {
            let mut state = self.inner.lock().unwrap();
            let inserted = if state.callbacks.contains_key(&id) {
                debug!("callback {} already registered on device {}", id, device_id);
                false
            } else {
                state.callbacks.insert(id, callback.clone());
                true
            };
            let next = if let Some(remote) = state.remote.clone() {
                Next::Answer(remote)
            } else if state.notifier.as_ref().map_or(false, |n| n.has_record()) {
                Next::RideInFlight
            } else {
                Next::IssueConnect
            };
            (inserted, next)
        };
        if inserted {
            self.spawn_closed_watch(id, &callback);
        }
        match next {
            Next::Answer(remote) => {
                callback.on_connect(device_id, Some(remote), 0);
                Ok(())
            }
            Next::RideInFlight => {
                debug!("device {} already has a connect in flight", device_id);
                Ok(())
            }
            Next::IssueConnect => {
                let Some(package) = self.package() else {
                    self.remove_callback(id);
                    return Err(EdmError::NotFound(format!(
                        "device {} has no matched driver",
                        device_id
                    )));
                };
                let notifier = self.fresh_notifier(registry);
                if let Err(e) =
                    controller.connect_driver_extension(&package, &notifier, device_id).await
                {
                    self.remove_callback(id);
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Issues a disconnect request for the live connection, if any.
    pub async fn disconnect(&self, controller: &DriverExtensionController) -> EdmResult<()> {
        let _op = self.op_lock.lock().await;
        let device_id = self.device_id();
        let notifier = self.notifier().ok_or_else(|| {
            EdmError::InvalidObject(format!("device {} was never connected", device_id))
        })?;
        let Some(record) = notifier.record() else {
            info!("device {} already disconnected", device_id);
            return Ok(());
        };
        controller.disconnect_driver_extension(&record.package, &notifier, device_id).await
    }

    /// Applies a connect completion and fans it out to the registered
    /// callbacks.
    pub(crate) fn on_connect_complete(&self, remote: Option<Arc<dyn RemoteObject>>, status: i32) {
        let device_id = self.device_id();
        let failed = remote.is_none() || status != 0;
        if failed {
            error!("device {} connect completion reported failure {}", device_id, status);
        }
        let callbacks: Vec<_> = {
            let mut state = self.inner.lock().unwrap();
            state.remote = remote.clone();
            // A failed connect leaves a dead record behind; drop the
            // notifier so the next connect starts fresh instead of
            // mistaking it for an in-flight request.
            if failed {
                if let Some(notifier) = state.notifier.take() {
                    notifier.clear_record();
                }
            }
            state.callbacks.values().cloned().collect()
        };
        for callback in callbacks {
            callback.on_connect(device_id, remote.clone(), status);
        }
    }

    /// Applies a disconnect completion: drops the remote and the
    /// connection record, notifies and clears the callbacks, and reports
    /// what the registry still has to do.
    pub(crate) fn on_disconnect_complete(&self, status: i32) -> DisconnectOutcome {
        let device_id = self.device_id();
        if status != 0 {
            error!("device {} disconnect completion reported failure {}", device_id, status);
        }
        let (callbacks, unregistered, package) = {
            let mut state = self.inner.lock().unwrap();
            state.remote = None;
            if let Some(notifier) = &state.notifier {
                notifier.clear_record();
            }
            let callbacks: Vec<_> = state.callbacks.drain().map(|(_, c)| c).collect();
            (callbacks, state.unregistered, state.package.clone())
        };
        for callback in &callbacks {
            callback.on_unbind(device_id, status);
            callback.on_disconnect(device_id, status);
        }
        DisconnectOutcome { unregistered, package }
    }
}
