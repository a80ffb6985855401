//! Per-transport implementations of "read/write N bytes at (core, addr)".

pub mod device_memcpy;
pub mod ethernet;
pub mod jtag;
pub mod pcie;

use std::sync::Arc;

use crate::error::Result;
use crate::types::XyPair;

pub use ethernet::EthernetProtocol;
pub use jtag::JtagProtocol;
pub use pcie::{DynamicTlb, PcieProtocol, HANG_READ_VALUE};

/// The transport behind one chip. A flat sum type: each variant is a small
/// struct implementing the same capability set. The PCIe variant is shared
/// because the remote tunnel rides the local chip's PCIe path.
#[derive(Debug)]
pub enum DeviceProtocol {
    Pcie(Arc<PcieProtocol>),
    Ethernet(EthernetProtocol),
    Jtag(JtagProtocol),
}

impl DeviceProtocol {
    pub fn write_to_device(&self, mem: &[u8], core: XyPair, addr: u64) -> Result<()> {
        match self {
            DeviceProtocol::Pcie(p) => p.write_to_device(mem, core, addr),
            DeviceProtocol::Ethernet(p) => p.write_to_device(mem, core, addr),
            DeviceProtocol::Jtag(p) => p.write_to_device(mem, core, addr),
        }
    }

    pub fn read_from_device(&self, mem: &mut [u8], core: XyPair, addr: u64) -> Result<()> {
        match self {
            DeviceProtocol::Pcie(p) => p.read_from_device(mem, core, addr),
            DeviceProtocol::Ethernet(p) => p.read_from_device(mem, core, addr),
            DeviceProtocol::Jtag(p) => p.read_from_device(mem, core, addr),
        }
    }

    /// Blocks until prior writes through this protocol are observable by a
    /// subsequent read. A no-op on transports that complete synchronously.
    pub fn wait_for_non_mmio_flush(&self) -> Result<()> {
        match self {
            DeviceProtocol::Pcie(_) => Ok(()),
            DeviceProtocol::Ethernet(p) => p.wait_for_non_mmio_flush(),
            DeviceProtocol::Jtag(p) => p.wait_for_non_mmio_flush(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, DeviceProtocol::Ethernet(_))
    }
}
