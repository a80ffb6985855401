pub mod pci_device;
pub mod tlb_handle;
pub mod tlb_window;

pub use pci_device::{
    enumerate_devices, enumerate_devices_info, read_kmd_version, BarMapping, DmaBuffer, PciDevice,
    PciDeviceInfo,
};
pub use tlb_handle::TlbHandle;
pub use tlb_window::TlbWindow;
