//! Uniform read/write contract over silicon TLB windows and simulators.

pub mod rtl;
pub mod silicon;
pub mod ttsim;

use std::path::Path;
use std::sync::Arc;

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::pcie::pci_device::PciDevice;
use crate::simulation::TtSimChip;
use crate::types::tlb::{TlbData, TlbMapping, TlbOrdering};
use crate::types::XyPair;

pub use rtl::RtlDeviceIo;
pub use silicon::SiliconDeviceIo;
pub use ttsim::TtSimDeviceIo;

/// Which simulator backs the device I/O, when any does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationType {
    TtSim,
    RtlSimulation,
}

/// Uniform device window contract: silicon TLB, TTSim library, or RTL
/// simulator process behind the same operations.
pub trait DeviceIo: Send {
    fn write32(&mut self, offset: u64, value: u32) -> Result<()>;
    fn read32(&mut self, offset: u64) -> Result<u32>;
    fn write_register(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn read_register(&mut self, offset: u64, data: &mut [u8]) -> Result<()>;
    fn write_block(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn read_block(&mut self, offset: u64, data: &mut [u8]) -> Result<()>;

    /// Reroute the window to `(core, addr)` and write `data`.
    fn write_block_reconfigure(
        &mut self,
        data: &[u8],
        core: XyPair,
        addr: u64,
        ordering: TlbOrdering,
    ) -> Result<()>;

    /// Reroute the window to `(core, addr)` and read into `data`.
    fn read_block_reconfigure(
        &mut self,
        data: &mut [u8],
        core: XyPair,
        addr: u64,
        ordering: TlbOrdering,
    ) -> Result<()>;

    /// Multicast `data` to the core rectangle.
    fn noc_multicast_write_reconfigure(
        &mut self,
        data: &[u8],
        core_start: XyPair,
        core_end: XyPair,
        addr: u64,
        ordering: TlbOrdering,
    ) -> Result<()>;

    fn get_size(&self) -> u64;
    fn get_base_address(&self) -> u64;
    fn configure(&mut self, new_config: TlbData) -> Result<()>;
}

/// Select the device-I/O implementation: a simulator flavor when requested,
/// otherwise silicon through a freshly allocated TLB window. `arch` names
/// the simulated architecture; silicon and TTSim carry their own.
#[allow(clippy::too_many_arguments)]
pub fn create_device_io(
    simulation_type: Option<SimulationType>,
    arch: Arch,
    pci_device: Option<Arc<PciDevice>>,
    ttsim_chip: Option<Arc<TtSimChip>>,
    simulator_directory: Option<&Path>,
    size: u64,
    tlb_mapping: TlbMapping,
    base_address: u64,
    config: TlbData,
) -> Result<Box<dyn DeviceIo>> {
    match simulation_type {
        None => {
            let pci_device = pci_device.ok_or_else(|| {
                Error::InvalidArgument("silicon device I/O requires a PCI device".into())
            })?;
            Ok(Box::new(SiliconDeviceIo::new(
                pci_device,
                size,
                tlb_mapping,
                config,
            )?))
        }
        Some(SimulationType::TtSim) => {
            let chip = ttsim_chip.ok_or_else(|| {
                Error::InvalidArgument("TTSim device I/O requires a loaded simulator chip".into())
            })?;
            Ok(Box::new(TtSimDeviceIo::new(chip, size, base_address, config)))
        }
        Some(SimulationType::RtlSimulation) => {
            let _ = simulator_directory;
            Ok(Box::new(RtlDeviceIo::new(arch, size, base_address, config)?))
        }
    }
}
