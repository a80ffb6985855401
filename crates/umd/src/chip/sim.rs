//! The chip façade for a simulated chip.

use std::sync::Mutex;

use crate::arch::Arch;
use crate::error::Result;
use crate::simulation::SimulationChip;
use crate::sync::{LockManager, MutexKind, MutexType};
use crate::types::{ChipId, RiscType, TensixSoftResetOptions, XyPair};

/// Wraps a simulation chip behind the same surface as silicon. Simulators
/// are single-threaded, so every operation runs under the simulator mutex.
pub struct SimChip {
    chip_id: ChipId,
    arch: Arch,
    chip: Mutex<SimulationChip>,
    lock_manager: LockManager,
}

impl SimChip {
    pub fn new(chip_id: ChipId, chip: SimulationChip) -> Result<Self> {
        let lock_manager = LockManager;
        lock_manager.initialize_mutex(MutexType::Simulator, MutexKind::SystemWide)?;
        Ok(Self {
            chip_id,
            arch: chip.arch(),
            chip: Mutex::new(chip),
            lock_manager,
        })
    }

    pub fn chip_id(&self) -> ChipId {
        self.chip_id
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    fn with_chip<T>(
        &self,
        f: impl FnOnce(&mut SimulationChip) -> Result<T>,
    ) -> Result<T> {
        let _guard = self
            .lock_manager
            .acquire_mutex(MutexType::Simulator, MutexKind::SystemWide)?;
        let mut chip = self
            .chip
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut chip)
    }

    pub fn start_device(&self) -> Result<()> {
        self.with_chip(|chip| chip.start_device())
    }

    pub fn close_device(&self) -> Result<()> {
        self.with_chip(|chip| chip.close_device())
    }

    /// Drive the emulated Ethernet links until they are all up.
    pub fn connect_eth_links(&self) -> Result<bool> {
        self.with_chip(|chip| chip.connect_eth_links())
    }

    pub fn write_to_device(&self, core: XyPair, src: &[u8], addr: u64) -> Result<()> {
        self.with_chip(|chip| chip.write_to_device(core, src, addr))
    }

    pub fn read_from_device(&self, core: XyPair, dest: &mut [u8], addr: u64) -> Result<()> {
        self.with_chip(|chip| chip.read_from_device(core, dest, addr))
    }

    /// Simulator transactions are synchronous; nothing to flush.
    pub fn wait_for_non_mmio_flush(&self) -> Result<()> {
        Ok(())
    }

    /// Multicast is emulated by unicast iteration, skipping the columns
    /// that host DRAM rather than tensix inside the rectangle.
    pub fn noc_multicast_write(
        &self,
        src: &[u8],
        core_start: XyPair,
        core_end: XyPair,
        addr: u64,
    ) -> Result<()> {
        let excluded = self.arch.multicast_excluded_columns();
        self.with_chip(|chip| {
            for x in core_start.x..=core_end.x {
                if excluded.contains(&x) {
                    continue;
                }
                for y in core_start.y..=core_end.y {
                    chip.write_to_device(XyPair::new(x, y), src, addr)?;
                }
            }
            Ok(())
        })
    }

    /// Simulated memory is coherent with the message ordering; the membar
    /// reduces to the sentinel round trip.
    pub fn l1_membar(&self, cores: &[XyPair]) -> Result<()> {
        let flag = super::local::MEMBAR_FLAG.to_le_bytes();
        let barrier = self.arch.l1_barrier_base();
        self.with_chip(|chip| {
            for &core in cores {
                chip.write_to_device(core, &flag, barrier)?;
            }
            for &core in cores {
                let mut value = [0u8; 4];
                chip.read_from_device(core, &mut value, barrier)?;
            }
            Ok(())
        })
    }

    pub fn send_tensix_risc_reset(
        &self,
        core: XyPair,
        soft_resets: TensixSoftResetOptions,
    ) -> Result<()> {
        self.with_chip(|chip| chip.send_tensix_risc_reset(core, soft_resets))
    }

    pub fn assert_risc_reset(&self, core: XyPair, selected: RiscType) -> Result<()> {
        self.with_chip(|chip| chip.assert_risc_reset(core, selected))
    }

    pub fn deassert_risc_reset(
        &self,
        core: XyPair,
        selected: RiscType,
        staggered_start: bool,
    ) -> Result<()> {
        self.with_chip(|chip| chip.deassert_risc_reset(core, selected, staggered_start))
    }
}

impl std::fmt::Debug for SimChip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimChip")
            .field("chip_id", &self.chip_id)
            .field("arch", &self.arch)
            .finish()
    }
}
