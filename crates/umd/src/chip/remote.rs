//! The chip façade for a chip with no direct PCIe link, reached through a
//! local gateway chip's Ethernet cores.

use std::sync::Arc;

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::protocol::{DeviceProtocol, EthernetProtocol};
use crate::types::{ChipId, EthCoord, RiscType, TensixSoftResetOptions, XyPair};

use super::local::LocalChip;

pub struct RemoteChip {
    chip_id: ChipId,
    target: EthCoord,
    local_chip: Arc<LocalChip>,
    protocol: DeviceProtocol,
}

impl RemoteChip {
    /// Attach to the chip at `target`, tunneling through `local_chip`.
    pub fn open(chip_id: ChipId, local_chip: Arc<LocalChip>, target: EthCoord) -> Result<Self> {
        if local_chip.arch() != Arch::Wormhole {
            return Err(Error::Configuration(
                "creating a remote chip is supported only for Wormhole".into(),
            ));
        }
        let remote_communication = local_chip.remote_communication()?;
        Ok(Self {
            chip_id,
            target,
            local_chip,
            protocol: DeviceProtocol::Ethernet(EthernetProtocol::new(
                remote_communication,
                target,
            )),
        })
    }

    pub fn chip_id(&self) -> ChipId {
        self.chip_id
    }

    pub fn arch(&self) -> Arch {
        self.local_chip.arch()
    }

    pub fn target(&self) -> EthCoord {
        self.target
    }

    pub fn protocol(&self) -> &DeviceProtocol {
        &self.protocol
    }

    pub fn write_to_device(&self, core: XyPair, src: &[u8], addr: u64) -> Result<()> {
        self.protocol.write_to_device(src, core, addr)
    }

    pub fn read_from_device(&self, core: XyPair, dest: &mut [u8], addr: u64) -> Result<()> {
        self.protocol.read_from_device(dest, core, addr)
    }

    /// Required before any host read that must observe prior remote writes.
    pub fn wait_for_non_mmio_flush(&self) -> Result<()> {
        self.protocol.wait_for_non_mmio_flush()
    }

    /// Remote multicast is decomposed: the tunnel carries unicast frames.
    pub fn noc_multicast_write(
        &self,
        src: &[u8],
        core_start: XyPair,
        core_end: XyPair,
        addr: u64,
    ) -> Result<()> {
        let excluded = self.arch().multicast_excluded_columns();
        for x in core_start.x..=core_end.x {
            if excluded.contains(&x) {
                continue;
            }
            for y in core_start.y..=core_end.y {
                self.write_to_device(XyPair::new(x, y), src, addr)?;
            }
        }
        Ok(())
    }

    pub fn l1_membar(&self, cores: &[XyPair]) -> Result<()> {
        // Remote writes are only ordered once the tunnel drained.
        self.wait_for_non_mmio_flush()?;
        let flag = super::local::MEMBAR_FLAG.to_le_bytes();
        for &core in cores {
            self.write_to_device(core, &flag, self.arch().l1_barrier_base())?;
        }
        self.wait_for_non_mmio_flush()?;
        for &core in cores {
            let mut value = [0u8; 4];
            self.read_from_device(core, &mut value, self.arch().l1_barrier_base())?;
            if u32::from_le_bytes(value) != super::local::MEMBAR_FLAG {
                return Err(Error::Configuration(format!(
                    "membar readback mismatch on remote core {core}"
                )));
            }
        }
        Ok(())
    }

    pub fn send_tensix_risc_reset(
        &self,
        core: XyPair,
        soft_resets: TensixSoftResetOptions,
    ) -> Result<()> {
        let value = soft_resets.bits().to_le_bytes();
        self.write_to_device(core, &value, self.arch().tensix_soft_reset_addr())?;
        self.wait_for_non_mmio_flush()
    }

    pub fn assert_risc_reset(&self, core: XyPair, selected: RiscType) -> Result<()> {
        let update = self.arch().get_soft_reset_reg_value(selected)?;
        let addr = self.arch().tensix_soft_reset_addr();
        self.wait_for_non_mmio_flush()?;
        let mut value = [0u8; 4];
        self.read_from_device(core, &mut value, addr)?;
        let value = u32::from_le_bytes(value) | update;
        self.write_to_device(core, &value.to_le_bytes(), addr)?;
        self.wait_for_non_mmio_flush()
    }

    pub fn deassert_risc_reset(
        &self,
        core: XyPair,
        selected: RiscType,
        staggered_start: bool,
    ) -> Result<()> {
        let update = self.arch().get_soft_reset_reg_value(selected)?;
        let addr = self.arch().tensix_soft_reset_addr();
        self.wait_for_non_mmio_flush()?;
        let mut value = [0u8; 4];
        self.read_from_device(core, &mut value, addr)?;
        let mut value = u32::from_le_bytes(value) & !update;
        if staggered_start {
            value |= TensixSoftResetOptions::STAGGERED_START.bits();
        }
        self.write_to_device(core, &value.to_le_bytes(), addr)?;
        self.wait_for_non_mmio_flush()
    }
}

impl std::fmt::Debug for RemoteChip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteChip")
            .field("chip_id", &self.chip_id)
            .field("target", &self.target)
            .finish()
    }
}
