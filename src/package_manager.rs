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
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};

use crate::bus_extension::BusExtensionRegistry;
use crate::definitions::{
    DeviceDescriptor, DriverDescriptor, DriverInfoData, PackageKey, KEY_SEPARATOR,
};
use crate::errors::EdmResult;
use crate::package_store::{DriverPackageRecord, PkgStore};

/// Declared driver component of an installed package, as reported by the
/// platform's package subsystem.
#[derive(Debug, Clone)]
pub struct DriverComponent {
    pub package_name: String,
    pub component_name: String,
    pub access_token_id: u64,
    pub user_id: i64,
    pub app_index: i64,
    /// Key/value metadata declared by the component; parsed by the bus
    /// extension named in its `bus` entry.
    pub metadata: HashMap<String, String>,
}

/// The platform's package subsystem, injected.
pub trait DriverComponentProvider: Send + Sync {
    /// Lists the driver components declared by one package, or by every
    /// installed package when no name is given.
    fn fetch_driver_components(
        &self,
        package_name: Option<&str>,
        user_id: i32,
    ) -> Vec<DriverComponent>;
}

/// A package install/update/removal notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageChangeKind {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageChange {
    pub kind: PackageChangeKind,
    pub package_name: String,
    pub user_id: i32,
}

/// Result of matching a device against the stored driver packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverMatch {
    pub package: PackageKey,
    pub driver_uid: String,
}

/// Matching engine over the persisted driver package records.
///
/// The store is populated lazily by a full scan on first use, then kept
/// current by package-change reconciliation.
pub struct DriverPkgManager {
    store: Arc<PkgStore>,
    bus_registry: Arc<BusExtensionRegistry>,
    provider: Arc<dyn DriverComponentProvider>,
    current_user: AtomicI32,
    scanned: Mutex<bool>,
}

impl DriverPkgManager {
    pub fn new(
        store: Arc<PkgStore>,
        bus_registry: Arc<BusExtensionRegistry>,
        provider: Arc<dyn DriverComponentProvider>,
        current_user: i32,
    ) -> Self {
        Self {
            store,
            bus_registry,
            provider,
            current_user: AtomicI32::new(current_user),
            scanned: Mutex::new(false),
        }
    }

    pub fn current_user(&self) -> i32 {
        self.current_user.load(Ordering::SeqCst)
    }

    pub fn set_current_user(&self, user_id: i32) {
        self.current_user.store(user_id, Ordering::SeqCst);
    }

    pub fn is_current_user(&self, user_id: i32) -> bool {
        self.current_user() == user_id
    }

    /// Forgets the scan state so the next query rescans installed
    /// packages. Used after the active user changes.
    pub fn reset_scan(&self) {
        *self.scanned.lock().unwrap() = false;
    }

    fn build_records(&self, components: Vec<DriverComponent>) -> Vec<DriverPackageRecord> {
        let mut records = Vec::with_capacity(components.len());
        for component in components {
            let Some(bus_name) = component
                .metadata
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("bus"))
                .map(|(_, v)| v.clone())
            else {
                warn!(
                    "component {} of {} declares no bus, skipping",
                    component.component_name, component.package_name
                );
                continue;
            };
            let Some(extension) = self.bus_registry.get_by_name(&bus_name) else {
                warn!("no bus extension for '{}', skipping {}", bus_name, component.package_name);
                continue;
            };
            let descriptor = match extension.parse_driver_info(&component.metadata) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!(
                        "component {} of {} has unparsable driver metadata: {}",
                        component.component_name, component.package_name, e
                    );
                    continue;
                }
            };
            let driver_info_json = match serde_json::to_string(&descriptor) {
                Ok(json) => json,
                Err(e) => {
                    error!("failed to serialize driver descriptor: {}", e);
                    continue;
                }
            };
            records.push(DriverPackageRecord {
                driver_uid: format!(
                    "{}{}{}",
                    component.component_name, KEY_SEPARATOR, component.access_token_id
                ),
                user_id: component.user_id,
                app_index: component.app_index,
                package_component_key: PackageKey::new(
                    component.package_name.clone(),
                    component.component_name.clone(),
                )
                .encode(),
                package_name: component.package_name,
                component_name: component.component_name,
                driver_info_json,
            });
        }
        records
    }

    /// Runs the one-time full scan of installed driver packages if it has
    /// not happened yet.
    fn ensure_scanned(&self) -> EdmResult<()> {
        let mut scanned = self.scanned.lock().unwrap();
        if *scanned {
            return Ok(());
        }
        let components = self.provider.fetch_driver_components(None, self.current_user());
        let records = self.build_records(components);
        self.store.replace_package_records(None, &records)?;
        *scanned = true;
        info!("initial driver package scan stored {} records", records.len());
        Ok(())
    }

    /// Finds the first stored driver whose criteria accept the device.
    /// Iteration order is the store's row order, so the result is
    /// deterministic for a given store state. Rows that fail to parse are
    /// skipped; a match query must not die on one bad package.
    pub fn query_match_driver(&self, device: &DeviceDescriptor) -> Option<DriverMatch> {
        if let Err(e) = self.ensure_scanned() {
            error!("driver package scan failed: {}", e);
            return None;
        }
        let records = match self.store.query_records(None) {
            Ok(records) => records,
            Err(e) => {
                error!("driver package query failed: {}", e);
                return None;
            }
        };
        for record in records {
            let descriptor: DriverDescriptor = match serde_json::from_str(&record.driver_info_json)
            {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    warn!("stored driver {} has a malformed descriptor: {}", record.driver_uid, e);
                    continue;
                }
            };
            let Some(extension) = self.bus_registry.get_by_name(&descriptor.bus) else {
                warn!("stored driver {} names unknown bus '{}'", record.driver_uid, descriptor.bus);
                continue;
            };
            if extension.match_driver(&descriptor, device) {
                info!("device {} matched driver {}", device.device_id(), record.driver_uid);
                return Some(DriverMatch {
                    package: PackageKey::new(record.package_name, record.component_name),
                    driver_uid: record.driver_uid,
                });
            }
        }
        debug!("no driver matched device {}", device.device_id());
        None
    }

    /// Reads stored records back as client-facing driver info. Unlike
    /// matching, a malformed row aborts the query.
    pub fn query_driver_info(&self, driver_uid: Option<&str>) -> EdmResult<Vec<DriverInfoData>> {
        self.ensure_scanned()?;
        self.store
            .query_records(driver_uid)?
            .into_iter()
            .map(|record| {
                let descriptor = serde_json::from_str(&record.driver_info_json)?;
                Ok(DriverInfoData {
                    driver_uid: record.driver_uid,
                    package_name: record.package_name,
                    component_name: record.component_name,
                    descriptor,
                })
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn store_for_tests(&self) -> &Arc<PkgStore> {
        &self.store
    }

    /// Applies one package change to the store: re-reads the package's
    /// declared components and swaps its rows in one transaction. An
    /// added/updated package that no longer declares driver components is
    /// treated like a removal.
    pub fn reconcile_package(&self, change: &PackageChange) -> EdmResult<()> {
        match change.kind {
            PackageChangeKind::Added | PackageChangeKind::Updated => {
                let components = self
                    .provider
                    .fetch_driver_components(Some(&change.package_name), change.user_id);
                if components.is_empty() {
                    info!(
                        "package {} no longer declares driver components, dropping its rows",
                        change.package_name
                    );
                    self.store.delete_package_records(&change.package_name)?;
                } else {
                    let records = self.build_records(components);
                    self.store.replace_package_records(Some(&change.package_name), &records)?;
                }
            }
            PackageChangeKind::Removed => {
                self.store.delete_package_records(&change.package_name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_extension::usb::UsbBusExtension;
    use crate::definitions::{BusType, DeviceExt, UsbDeviceExt};
    use crate::errors::EdmError;

    struct FakeProvider {
        components: Vec<DriverComponent>,
    }

    impl DriverComponentProvider for FakeProvider {
        fn fetch_driver_components(
            &self,
            package_name: Option<&str>,
            _user_id: i32,
        ) -> Vec<DriverComponent> {
            self.components
                .iter()
                .filter(|c| package_name.map_or(true, |n| c.package_name == n))
                .cloned()
                .collect()
        }
    }

    fn usb_component(package: &str, component: &str, token: u64, vid: &str, pid: &str) -> DriverComponent {
        let metadata = [
            ("bus".to_string(), "usb".to_string()),
            ("vendor".to_string(), "acme".to_string()),
            ("vid".to_string(), vid.to_string()),
            ("pid".to_string(), pid.to_string()),
        ]
        .into_iter()
        .collect();
        DriverComponent {
            package_name: package.to_string(),
            component_name: component.to_string(),
            access_token_id: token,
            user_id: 100,
            app_index: 0,
            metadata,
        }
    }

    fn usb_device(vid: u16, pid: u16) -> DeviceDescriptor {
        DeviceDescriptor {
            bus_type: BusType::Usb,
            bus_dev_id: 0x0001_0001,
            description: "test".to_string(),
            ext: DeviceExt::Usb(UsbDeviceExt { vendor_id: vid, product_id: pid, interfaces: vec![] }),
        }
    }

    fn manager(components: Vec<DriverComponent>) -> DriverPkgManager {
        let registry = Arc::new(BusExtensionRegistry::new());
        registry.register(Arc::new(UsbBusExtension::new())).unwrap();
        DriverPkgManager::new(
            Arc::new(PkgStore::open_in_memory().unwrap()),
            registry,
            Arc::new(FakeProvider { components }),
            100,
        )
    }

    #[test]
    fn first_match_query_scans_installed_packages() {
        let mgr = manager(vec![usb_component("com.acme.driver", "entry", 77, "12ab", "34cd")]);
        let matched = mgr.query_match_driver(&usb_device(0x12ab, 0x34cd)).unwrap();
        assert_eq!(matched.package, PackageKey::new("com.acme.driver", "entry"));
        assert_eq!(matched.driver_uid, "entry-77");

        assert!(mgr.query_match_driver(&usb_device(0x12ab, 0xffff)).is_none());
    }

    #[test]
    fn components_without_usable_metadata_are_skipped() {
        let mut bad = usb_component("com.bad.driver", "entry", 1, "12ab", "34cd");
        bad.metadata.remove("bus");
        let mgr = manager(vec![bad, usb_component("com.acme.driver", "entry", 2, "12ab", "34cd")]);
        let matched = mgr.query_match_driver(&usb_device(0x12ab, 0x34cd)).unwrap();
        assert_eq!(matched.package.package_name, "com.acme.driver");
        assert_eq!(mgr.query_driver_info(None).unwrap().len(), 1);
    }

    #[test]
    fn reconcile_swaps_and_removes_package_rows() {
        let mgr = manager(vec![usb_component("com.acme.driver", "entry", 5, "aa", "bb")]);
        mgr.query_match_driver(&usb_device(1, 1));

        mgr.reconcile_package(&PackageChange {
            kind: PackageChangeKind::Updated,
            package_name: "com.acme.driver".to_string(),
            user_id: 100,
        })
        .unwrap();
        assert_eq!(mgr.query_driver_info(None).unwrap().len(), 1);

        mgr.reconcile_package(&PackageChange {
            kind: PackageChangeKind::Removed,
            package_name: "com.acme.driver".to_string(),
            user_id: 100,
        })
        .unwrap();
        assert!(mgr.query_driver_info(None).unwrap().is_empty());
        assert!(mgr.query_match_driver(&usb_device(0xaa, 0xbb)).is_none());
    }

    #[test]
    fn malformed_stored_row_is_skipped_by_matching_but_fails_readback() {
        let store = Arc::new(PkgStore::open_in_memory().unwrap());
        store
            .replace_package_records(
                None,
                &[crate::package_store::DriverPackageRecord {
                    driver_uid: "broken-1".to_string(),
                    user_id: 100,
                    app_index: 0,
                    package_component_key: "com.broken.driver-entry".to_string(),
                    package_name: "com.broken.driver".to_string(),
                    component_name: "entry".to_string(),
                    driver_info_json: "{not json".to_string(),
                }],
            )
            .unwrap();
        let registry = Arc::new(BusExtensionRegistry::new());
        registry.register(Arc::new(UsbBusExtension::new())).unwrap();
        let mgr = DriverPkgManager::new(
            store,
            registry,
            Arc::new(FakeProvider { components: vec![] }),
            100,
        );
        // Mark as scanned so the provider's empty result does not wipe the
        // hand-planted row.
        *mgr.scanned.lock().unwrap() = true;

        assert!(mgr.query_match_driver(&usb_device(1, 1)).is_none());
        let err = mgr.query_driver_info(None).unwrap_err();
        assert!(matches!(err, EdmError::Descriptor(_)));
    }
}
