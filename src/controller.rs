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

use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};

use crate::definitions::{DeviceId, PackageKey};
use crate::device::{ConnectNotifier, ConnectionRecord};
use crate::errors::{EdmError, EdmResult};

/// The platform's component-activation subsystem, injected. Connection
/// completions are delivered asynchronously by the platform calling
/// [`ConnectNotifier::on_connect_done`] / [`ConnectNotifier::on_disconnect_done`].
#[async_trait]
pub trait ComponentActivator: Send + Sync {
    async fn start_component(&self, package: &PackageKey) -> EdmResult<()>;

    async fn stop_component(&self, package: &PackageKey, user_id: Option<i32>) -> EdmResult<()>;

    async fn connect_component(
        &self,
        package: &PackageKey,
        notifier: Arc<ConnectNotifier>,
        device_id: DeviceId,
    ) -> EdmResult<()>;

    async fn disconnect_component(&self, notifier: Arc<ConnectNotifier>) -> EdmResult<()>;
}

/// Drives driver extension component lifecycle through the activator and
/// keeps one connection record per notifier.
pub struct DriverExtensionController {
    activator: Arc<dyn ComponentActivator>,
}

impl DriverExtensionController {
    pub fn new(activator: Arc<dyn ComponentActivator>) -> Self {
        Self { activator }
    }

    pub async fn start_driver_extension(&self, package: &PackageKey) -> EdmResult<()> {
        info!("starting driver extension {}", package);
        self.activator.start_component(package).await
    }

    pub async fn stop_driver_extension(
        &self,
        package: &PackageKey,
        user_id: Option<i32>,
    ) -> EdmResult<()> {
        info!("stopping driver extension {}", package);
        self.activator.stop_component(package, user_id).await
    }

    /// Issues a connect request. The notifier must not already carry a
    /// live connection record; on activator failure the installed record
    /// is rolled back so the notifier can be reused.
    pub async fn connect_driver_extension(
        &self,
        package: &PackageKey,
        notifier: &Arc<ConnectNotifier>,
        device_id: DeviceId,
    ) -> EdmResult<()> {
        info!("connecting driver extension {} for device {}", package, device_id);
        if notifier.has_record() {
            error!("notifier already carries a connection record, use a fresh one");
            return Err(EdmError::InvalidObject(
                "notifier already has a live connection".to_string(),
            ));
        }
        notifier.install_record(ConnectionRecord { package: package.clone(), device_id });
        let result = self
            .activator
            .connect_component(package, notifier.clone(), device_id)
            .await;
        if let Err(ref e) = result {
            error!("connect request for {} failed: {}", package, e);
            notifier.clear_record();
        }
        result
    }

    /// Issues a disconnect request after validating that the notifier's
    /// record matches the given package and device.
    pub async fn disconnect_driver_extension(
        &self,
        package: &PackageKey,
        notifier: &Arc<ConnectNotifier>,
        device_id: DeviceId,
    ) -> EdmResult<()> {
        info!("disconnecting driver extension {} for device {}", package, device_id);
        let record = notifier.record().ok_or_else(|| {
            EdmError::InvalidParameter("notifier has no connection record".to_string())
        })?;
        if record.package != *package || record.device_id != device_id {
            error!("package or device does not match the connection record");
            return Err(EdmError::InvalidObject(
                "connection record mismatch".to_string(),
            ));
        }
        self.activator.disconnect_component(notifier.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::BusType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    #[derive(Default)]
    struct RecordingActivator {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        fail_connect: bool,
    }

    #[async_trait]
    impl ComponentActivator for RecordingActivator {
        async fn start_component(&self, _package: &PackageKey) -> EdmResult<()> {
            Ok(())
        }

        async fn stop_component(
            &self,
            _package: &PackageKey,
            _user_id: Option<i32>,
        ) -> EdmResult<()> {
            Ok(())
        }

        async fn connect_component(
            &self,
            package: &PackageKey,
            _notifier: Arc<ConnectNotifier>,
            _device_id: DeviceId,
        ) -> EdmResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                Err(EdmError::ComponentNotResolvable(package.to_string()))
            } else {
                Ok(())
            }
        }

        async fn disconnect_component(&self, _notifier: Arc<ConnectNotifier>) -> EdmResult<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn notifier(device_id: DeviceId) -> Arc<ConnectNotifier> {
        ConnectNotifier::new(device_id, Weak::new())
    }

    #[tokio::test]
    async fn connect_installs_record_and_rejects_reuse() {
        let activator = Arc::new(RecordingActivator::default());
        let controller = DriverExtensionController::new(activator.clone());
        let package = PackageKey::new("com.acme.driver", "entry");
        let id = DeviceId::new(BusType::Usb, 7);
        let notifier = notifier(id);

        controller.connect_driver_extension(&package, &notifier, id).await.unwrap();
        assert!(notifier.has_record());

        let err = controller.connect_driver_extension(&package, &notifier, id).await.unwrap_err();
        assert!(matches!(err, EdmError::InvalidObject(_)));
        assert_eq!(activator.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_connect_rolls_the_record_back() {
        let activator = Arc::new(RecordingActivator { fail_connect: true, ..Default::default() });
        let controller = DriverExtensionController::new(activator);
        let package = PackageKey::new("com.acme.driver", "entry");
        let id = DeviceId::new(BusType::Usb, 7);
        let notifier = notifier(id);

        let err = controller.connect_driver_extension(&package, &notifier, id).await.unwrap_err();
        assert!(matches!(err, EdmError::ComponentNotResolvable(_)));
        assert!(!notifier.has_record());
    }

    #[tokio::test]
    async fn disconnect_validates_the_record() {
        let activator = Arc::new(RecordingActivator::default());
        let controller = DriverExtensionController::new(activator.clone());
        let package = PackageKey::new("com.acme.driver", "entry");
        let id = DeviceId::new(BusType::Usb, 7);
        let notifier = notifier(id);

        let err = controller.disconnect_driver_extension(&package, &notifier, id).await.unwrap_err();
        assert!(matches!(err, EdmError::InvalidParameter(_)));

        controller.connect_driver_extension(&package, &notifier, id).await.unwrap();

        let other = PackageKey::new("com.other.driver", "entry");
        let err = controller.disconnect_driver_extension(&other, &notifier, id).await.unwrap_err();
        assert!(matches!(err, EdmError::InvalidObject(_)));
        assert_eq!(activator.disconnects.load(Ordering::SeqCst), 0);

        controller.disconnect_driver_extension(&package, &notifier, id).await.unwrap();
        assert_eq!(activator.disconnects.load(Ordering::SeqCst), 1);
    }
}
