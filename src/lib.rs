pub mod bus_extension;
pub mod controller;
pub mod definitions;
pub mod device;
pub mod device_manager;
pub mod errors;
pub mod manager;
pub mod package_manager;
pub mod package_store;
pub mod service;

pub use bus_extension::usb::{UsbBusExtension, UsbHotplugInfo};
pub use bus_extension::{BusExtension, BusExtensionRegistry, DeviceChangeCallback};
pub use controller::{ComponentActivator, DriverExtensionController};
pub use definitions::{
    BusType, DeviceData, DeviceDescriptor, DeviceExt, DeviceId, DeviceInfoData, DriverDescriptor,
    DriverExt, DriverInfoData, PackageKey, UsbDeviceExt, UsbDriverExt, UsbInterfaceSummary,
};
pub use device::{ConnectNotifier, ConnectionCallback, ConnectionRecord, Device, RemoteObject};
pub use device_manager::{ExtDeviceManager, UnloadRequester};
pub use errors::{EdmError, EdmResult};
pub use manager::DriverExtMgr;
pub use package_manager::{
    DriverComponent, DriverComponentProvider, DriverMatch, DriverPkgManager, PackageChange,
    PackageChangeKind,
};
pub use package_store::{DriverPackageRecord, PkgStore};
pub use service::{spawn_service, ServiceHandle, StopHandle};
