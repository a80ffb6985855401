//! Per-chip façade: the stable upper API.

pub mod arc_messenger;
pub mod local;
pub mod remote;
pub mod sim;

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::types::{ChipId, RiscType, TensixSoftResetOptions, XyPair};

pub use arc_messenger::{ArcMessenger, ARC_MSG_DEFAULT_TIMEOUT};
pub use local::{LocalChip, MEMBAR_FLAG};
pub use remote::RemoteChip;
pub use sim::SimChip;

/// One accelerator chip, however it is attached. Callers program against
/// this surface; the variant decides how each operation routes.
#[derive(Debug)]
pub enum Chip {
    Local(LocalChip),
    Remote(RemoteChip),
    Simulation(SimChip),
}

impl Chip {
    pub fn chip_id(&self) -> ChipId {
        match self {
            Chip::Local(chip) => chip.chip_id(),
            Chip::Remote(chip) => chip.chip_id(),
            Chip::Simulation(chip) => chip.chip_id(),
        }
    }

    pub fn arch(&self) -> Arch {
        match self {
            Chip::Local(chip) => chip.arch(),
            Chip::Remote(chip) => chip.arch(),
            Chip::Simulation(chip) => chip.arch(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Chip::Remote(_))
    }

    pub fn write_to_device(&self, core: XyPair, src: &[u8], addr: u64) -> Result<()> {
        match self {
            Chip::Local(chip) => chip.write_to_device(core, src, addr),
            Chip::Remote(chip) => chip.write_to_device(core, src, addr),
            Chip::Simulation(chip) => chip.write_to_device(core, src, addr),
        }
    }

    pub fn read_from_device(&self, core: XyPair, dest: &mut [u8], addr: u64) -> Result<()> {
        match self {
            Chip::Local(chip) => chip.read_from_device(core, dest, addr),
            Chip::Remote(chip) => chip.read_from_device(core, dest, addr),
            Chip::Simulation(chip) => chip.read_from_device(core, dest, addr),
        }
    }

    pub fn write_to_sysmem(&self, channel: u16, src: &[u8], dest_offset: u64) -> Result<()> {
        match self {
            Chip::Local(chip) => chip.write_to_sysmem(channel, src, dest_offset),
            _ => Err(Error::Configuration(
                "sysmem is only present on locally attached chips".into(),
            )),
        }
    }

    pub fn read_from_sysmem(&self, channel: u16, dest: &mut [u8], src_offset: u64) -> Result<()> {
        match self {
            Chip::Local(chip) => chip.read_from_sysmem(channel, dest, src_offset),
            _ => Err(Error::Configuration(
                "sysmem is only present on locally attached chips".into(),
            )),
        }
    }

    pub fn dma_write_to_device(&self, src: &[u8], core: XyPair, addr: u64) -> Result<()> {
        match self {
            Chip::Local(chip) => chip.dma_write_to_device(src, core, addr),
            Chip::Remote(chip) => chip.write_to_device(core, src, addr),
            Chip::Simulation(chip) => chip.write_to_device(core, src, addr),
        }
    }

    pub fn dma_read_from_device(&self, dest: &mut [u8], core: XyPair, addr: u64) -> Result<()> {
        match self {
            Chip::Local(chip) => chip.dma_read_from_device(dest, core, addr),
            Chip::Remote(chip) => chip.read_from_device(core, dest, addr),
            Chip::Simulation(chip) => chip.read_from_device(core, dest, addr),
        }
    }

    pub fn noc_multicast_write(
        &self,
        src: &[u8],
        core_start: XyPair,
        core_end: XyPair,
        addr: u64,
    ) -> Result<()> {
        match self {
            Chip::Local(chip) => chip.noc_multicast_write(src, core_start, core_end, addr),
            Chip::Remote(chip) => chip.noc_multicast_write(src, core_start, core_end, addr),
            Chip::Simulation(chip) => chip.noc_multicast_write(src, core_start, core_end, addr),
        }
    }

    pub fn l1_membar(&self, cores: &[XyPair]) -> Result<()> {
        match self {
            Chip::Local(chip) => chip.l1_membar(cores),
            Chip::Remote(chip) => chip.l1_membar(cores),
            Chip::Simulation(chip) => chip.l1_membar(cores),
        }
    }

    pub fn dram_membar(&self, cores: &[XyPair]) -> Result<()> {
        match self {
            Chip::Local(chip) => chip.dram_membar(cores),
            // The flush drains remote DRAM writes; the L1 discipline covers
            // the rest.
            Chip::Remote(chip) => chip.wait_for_non_mmio_flush(),
            Chip::Simulation(_) => Ok(()),
        }
    }

    pub fn wait_for_non_mmio_flush(&self) -> Result<()> {
        match self {
            Chip::Local(chip) => chip.wait_for_non_mmio_flush(),
            Chip::Remote(chip) => chip.wait_for_non_mmio_flush(),
            Chip::Simulation(chip) => chip.wait_for_non_mmio_flush(),
        }
    }

    pub fn send_tensix_risc_reset(
        &self,
        core: XyPair,
        soft_resets: TensixSoftResetOptions,
    ) -> Result<()> {
        match self {
            Chip::Local(chip) => chip.send_tensix_risc_reset(core, soft_resets),
            Chip::Remote(chip) => chip.send_tensix_risc_reset(core, soft_resets),
            Chip::Simulation(chip) => chip.send_tensix_risc_reset(core, soft_resets),
        }
    }

    pub fn assert_risc_reset(&self, core: XyPair, selected: RiscType) -> Result<()> {
        match self {
            Chip::Local(chip) => chip.assert_risc_reset(core, selected),
            Chip::Remote(chip) => chip.assert_risc_reset(core, selected),
            Chip::Simulation(chip) => chip.assert_risc_reset(core, selected),
        }
    }

    pub fn deassert_risc_reset(
        &self,
        core: XyPair,
        selected: RiscType,
        staggered_start: bool,
    ) -> Result<()> {
        match self {
            Chip::Local(chip) => chip.deassert_risc_reset(core, selected, staggered_start),
            Chip::Remote(chip) => chip.deassert_risc_reset(core, selected, staggered_start),
            Chip::Simulation(chip) => chip.deassert_risc_reset(core, selected, staggered_start),
        }
    }

    pub fn arc_msg(
        &self,
        msg_code: u32,
        wait_for_done: bool,
        arg0: u16,
        arg1: u16,
        timeout: std::time::Duration,
    ) -> Result<(u32, u32, u32)> {
        match self {
            Chip::Local(chip) => chip.arc_msg(msg_code, wait_for_done, arg0, arg1, timeout),
            _ => Err(Error::Configuration(
                "ARC messages require a locally attached chip".into(),
            )),
        }
    }
}
