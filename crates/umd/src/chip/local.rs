//! The chip façade for a locally attached (PCIe or JTAG) device.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::arch::{wormhole, Arch};
use crate::chip_helpers::{SysmemManager, TlbManager, Writer};
use crate::error::{Error, Result};
use crate::jtag::JtagDevice;
use crate::pcie::pci_device::PciDevice;
use crate::protocol::pcie::PcieProtocol;
use crate::protocol::{DeviceProtocol, JtagProtocol};
use crate::remote::RemoteCommunication;
use crate::sync::{LockManager, MutexKind, MutexType};
use crate::types::tlb::TlbOrdering;
use crate::types::{ChipId, RiscType, TensixSoftResetOptions, XyPair};

use super::arc_messenger::ArcMessenger;

/// Sentinel the membars write and read back.
pub const MEMBAR_FLAG: u32 = 187;

/// Token the DMA engine writes to the completion page when a transfer is
/// done.
const DMA_COMPLETION_TOKEN: u32 = 1;

const DMA_TIMEOUT: Duration = Duration::from_secs(10);
const MEMBAR_TIMEOUT: Duration = Duration::from_secs(1);

/// One locally attached chip: device handle, transport, TLB inventory,
/// sysmem channels and the serializing mutexes.
pub struct LocalChip {
    chip_id: ChipId,
    arch: Arch,
    pci_device: Option<Arc<PciDevice>>,
    protocol: DeviceProtocol,
    tlb_manager: Option<Mutex<TlbManager>>,
    sysmem: Option<SysmemManager>,
    arc_messenger: Option<ArcMessenger>,
    lock_manager: LockManager,
}

impl LocalChip {
    /// Open a chip over PCIe and stand up its helpers. `num_host_mem_channels`
    /// may be zero for workloads that never touch sysmem.
    pub fn open_pcie(
        chip_id: ChipId,
        pci_device_num: usize,
        num_host_mem_channels: u32,
    ) -> Result<Self> {
        let pci_device = Arc::new(PciDevice::open(pci_device_num)?);
        let arch = pci_device.get_arch();

        let pcie_protocol = Arc::new(PcieProtocol::new(Arc::clone(&pci_device))?);
        let arc_messenger = ArcMessenger::new(Arc::clone(&pcie_protocol))?;

        let mut sysmem = SysmemManager::new(Arc::clone(&pci_device));
        if num_host_mem_channels > 0 {
            sysmem.init_hugepages(num_host_mem_channels)?;
        }

        Ok(Self {
            chip_id,
            arch,
            pci_device: Some(Arc::clone(&pci_device)),
            protocol: DeviceProtocol::Pcie(pcie_protocol),
            tlb_manager: Some(Mutex::new(TlbManager::new(pci_device))),
            sysmem: Some(sysmem),
            arc_messenger: Some(arc_messenger),
            lock_manager: LockManager,
        })
    }

    /// Open a chip over JTAG. Diagnostic path: no TLBs, no sysmem, no DMA.
    pub fn open_jtag(chip_id: ChipId, jtag_device: Arc<JtagDevice>, jlink_id: u8) -> Result<Self> {
        let arch = jtag_device.get_jtag_arch(jlink_id);
        Ok(Self {
            chip_id,
            arch,
            pci_device: None,
            protocol: DeviceProtocol::Jtag(JtagProtocol::new(jtag_device, jlink_id)),
            tlb_manager: None,
            sysmem: None,
            arc_messenger: None,
            lock_manager: LockManager,
        })
    }

    pub fn chip_id(&self) -> ChipId {
        self.chip_id
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn pci_device(&self) -> Option<&Arc<PciDevice>> {
        self.pci_device.as_ref()
    }

    pub fn protocol(&self) -> &DeviceProtocol {
        &self.protocol
    }

    /// The PCIe protocol, for collaborators that ride it (remote tunnel).
    pub fn pcie_protocol(&self) -> Option<Arc<PcieProtocol>> {
        match &self.protocol {
            DeviceProtocol::Pcie(p) => Some(Arc::clone(p)),
            _ => None,
        }
    }

    /// Build the remote tunnel rooted at this chip.
    pub fn remote_communication(&self) -> Result<Arc<RemoteCommunication>> {
        let pcie = self.pcie_protocol().ok_or_else(|| {
            Error::Configuration("remote tunneling requires a PCIe-attached gateway chip".into())
        })?;
        Ok(Arc::new(RemoteCommunication::new(pcie)?))
    }

    // ---- device I/O ----

    pub fn write_to_device(&self, core: XyPair, src: &[u8], addr: u64) -> Result<()> {
        self.protocol.write_to_device(src, core, addr)
    }

    pub fn read_from_device(&self, core: XyPair, dest: &mut [u8], addr: u64) -> Result<()> {
        self.protocol.read_from_device(dest, core, addr)
    }

    pub fn wait_for_non_mmio_flush(&self) -> Result<()> {
        self.protocol.wait_for_non_mmio_flush()
    }

    // ---- sysmem ----

    pub fn write_to_sysmem(&self, channel: u16, src: &[u8], dest_offset: u64) -> Result<()> {
        self.sysmem()?.write_to_sysmem(channel, src, dest_offset)
    }

    pub fn read_from_sysmem(&self, channel: u16, dest: &mut [u8], src_offset: u64) -> Result<()> {
        self.sysmem()?.read_from_sysmem(channel, dest, src_offset)
    }

    pub fn sysmem(&self) -> Result<&SysmemManager> {
        self.sysmem.as_ref().ok_or_else(|| {
            Error::Configuration("sysmem is not available on this transport".into())
        })
    }

    // ---- static TLB management ----

    pub fn configure_tlb(
        &self,
        core: XyPair,
        tlb_size: u64,
        address: u64,
        ordering: TlbOrdering,
    ) -> Result<()> {
        self.tlb_manager()?
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .configure_tlb(core, tlb_size, address, ordering)
    }

    pub fn get_static_tlb_writer(&self, core: XyPair) -> Result<Writer> {
        self.tlb_manager()?
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_static_tlb_writer(core)
    }

    fn tlb_manager(&self) -> Result<&Mutex<TlbManager>> {
        self.tlb_manager.as_ref().ok_or_else(|| {
            Error::Configuration("TLB windows are not available on this transport".into())
        })
    }

    // ---- multicast ----

    /// Multicast `src` into the rectangle. True NOC multicast where the
    /// transport supports it; JTAG decomposes into unicasts.
    pub fn noc_multicast_write(
        &self,
        src: &[u8],
        core_start: XyPair,
        core_end: XyPair,
        addr: u64,
    ) -> Result<()> {
        match &self.protocol {
            DeviceProtocol::Pcie(pcie) => {
                let tlb_index = self.arch.reg_tlb();
                let mut addr = addr;
                let mut remaining = src;
                while !remaining.is_empty() {
                    let tlb = pcie.set_dynamic_tlb_broadcast(
                        tlb_index,
                        addr,
                        core_start,
                        core_end,
                        TlbOrdering::Strict,
                    )?;
                    let transfer_size = remaining.len().min(tlb.remaining_size as usize);
                    pcie.write_block(tlb.bar_offset, &remaining[..transfer_size])?;
                    remaining = &remaining[transfer_size..];
                    addr += transfer_size as u64;
                }
                Ok(())
            }
            _ => {
                for x in core_start.x..=core_end.x {
                    for y in core_start.y..=core_end.y {
                        self.write_to_device(XyPair::new(x, y), src, addr)?;
                    }
                }
                Ok(())
            }
        }
    }

    // ---- membars ----

    /// Order prior writes to the listed cores' L1 before subsequent reads:
    /// write the sentinel to the barrier address, then read it back.
    pub fn l1_membar(&self, cores: &[XyPair]) -> Result<()> {
        self.membar_at(cores, self.arch.l1_barrier_base())
    }

    /// Same discipline over the DRAM barrier address.
    pub fn dram_membar(&self, cores: &[XyPair]) -> Result<()> {
        self.membar_at(cores, self.arch.dram_barrier_base())
    }

    fn membar_at(&self, cores: &[XyPair], barrier_addr: u64) -> Result<()> {
        let flag = MEMBAR_FLAG.to_le_bytes();
        for &core in cores {
            self.write_to_device(core, &flag, barrier_addr)?;
        }
        // The read-back is the ordering point; a stale value means the
        // barrier write has not landed yet.
        for &core in cores {
            let start = Instant::now();
            loop {
                let mut value = [0u8; 4];
                self.read_from_device(core, &mut value, barrier_addr)?;
                if u32::from_le_bytes(value) == MEMBAR_FLAG {
                    break;
                }
                if start.elapsed() > MEMBAR_TIMEOUT {
                    return Err(Error::Timeout {
                        what: format!("membar acknowledgement from core {core}"),
                        elapsed: start.elapsed(),
                    });
                }
                std::hint::spin_loop();
            }
        }
        Ok(())
    }

    // ---- DMA staging ----

    /// Write through the DMA staging engine where available, otherwise fall
    /// back to the MMIO path.
    pub fn dma_write_to_device(&self, src: &[u8], core: XyPair, addr: u64) -> Result<()> {
        let Some(device) = self.pci_device.as_ref() else {
            return self.write_to_device(core, src, addr);
        };
        let Some(dma) = device.dma_buffer() else {
            return self.write_to_device(core, src, addr);
        };

        let mut offset = 0usize;
        while offset < src.len() {
            let chunk = (src.len() - offset).min(dma.size as usize);
            unsafe {
                std::ptr::copy_nonoverlapping(src[offset..].as_ptr(), dma.as_mut_ptr(), chunk);
            }
            self.run_dma_transfer(core, addr + offset as u64, chunk as u32, true)?;
            offset += chunk;
        }
        Ok(())
    }

    /// Read through the DMA staging engine where available, otherwise fall
    /// back to the MMIO path.
    pub fn dma_read_from_device(&self, dest: &mut [u8], core: XyPair, addr: u64) -> Result<()> {
        let Some(device) = self.pci_device.as_ref() else {
            return self.read_from_device(core, dest, addr);
        };
        let Some(dma) = device.dma_buffer() else {
            return self.read_from_device(core, dest, addr);
        };

        let mut offset = 0usize;
        while offset < dest.len() {
            let chunk = (dest.len() - offset).min(dma.size as usize);
            self.run_dma_transfer(core, addr + offset as u64, chunk as u32, false)?;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    dma.as_ptr(),
                    dest[offset..].as_mut_ptr(),
                    chunk,
                );
            }
            offset += chunk;
        }
        Ok(())
    }

    /// Program one ARC DMA request and poll the completion page. The request
    /// block lives in ARC CSM; the engine reports completion by writing a
    /// token to the completion page because this path has no interrupt.
    fn run_dma_transfer(&self, core: XyPair, addr: u64, size: u32, to_device: bool) -> Result<()> {
        let device = self.pci_device.as_ref().unwrap();
        let dma = device.dma_buffer().unwrap();
        if self.arch != Arch::Wormhole {
            return Err(Error::Configuration(
                "the ARC DMA engine is only present on Wormhole".into(),
            ));
        }

        // Clear the completion token from any previous transfer.
        unsafe { (dma.completion_ptr() as *mut u32).write_volatile(0) };

        let noc_addr = self.noc_dma_address(core, addr);
        let bar0 = &device.bar0_uc;
        let request = wormhole::ARC_CSM_DMA_REQUEST_OFFSET as u64;

        // Request block: chip address (low word), host physical (low word),
        // completion flag address, pack word, repeat. High words travel in
        // their own register.
        bar0.write32(request, noc_addr as u32)?;
        bar0.write32(request + 4, dma.buffer_pa as u32)?;
        bar0.write32(request + 8, dma.completion_pa as u32)?;
        let pack = (size & 0x0FFF_FFFF)
            | ((to_device as u32) << 28)
            | (1 << 30)  // write the completion flag on done
            | (1 << 31); // trigger
        bar0.write32(request + 12, pack)?;
        let repeat = 1 | (((noc_addr >> 32 != 0) as u32) << 31);
        bar0.write32(request + 16, repeat)?;
        bar0.write32(
            wormhole::ARC_CSM_DMA_HOST_PHYS_ADDR_HIGH_OFFSET as u64,
            (dma.buffer_pa >> 32) as u32,
        )?;

        // Kick the ARC firmware.
        let misc_cntl = self.arch.arc_reset_arc_misc_cntl_offset() as u64;
        let misc = bar0.read32(misc_cntl)?;
        bar0.write32(misc_cntl, misc | (1 << 16))?;

        let start = Instant::now();
        loop {
            let token = unsafe { dma.completion_ptr().read_volatile() };
            if token == DMA_COMPLETION_TOKEN {
                return Ok(());
            }
            if start.elapsed() > DMA_TIMEOUT {
                return Err(Error::Timeout {
                    what: format!("DMA completion for {size} bytes at core {core}"),
                    elapsed: start.elapsed(),
                });
            }
            std::hint::spin_loop();
        }
    }

    fn noc_dma_address(&self, core: XyPair, addr: u64) -> u64 {
        let local_bits = wormhole::NOC_ADDR_LOCAL_BITS;
        let id_bits = wormhole::NOC_ADDR_NODE_ID_BITS;
        addr | ((core.y as u64) << local_bits) | ((core.x as u64) << (local_bits + id_bits))
    }

    // ---- resets ----

    /// Overwrite the core's soft-reset register with `soft_resets`.
    pub fn send_tensix_risc_reset(
        &self,
        core: XyPair,
        soft_resets: TensixSoftResetOptions,
    ) -> Result<()> {
        let value = soft_resets.bits().to_le_bytes();
        self.write_to_device(core, &value, self.arch.tensix_soft_reset_addr())?;
        self.wait_for_non_mmio_flush()
    }

    /// OR the selected RISCs into the core's soft-reset register.
    pub fn assert_risc_reset(&self, core: XyPair, selected: RiscType) -> Result<()> {
        let update = self.arch.get_soft_reset_reg_value(selected)?;
        let addr = self.arch.tensix_soft_reset_addr();
        let mut value = [0u8; 4];
        self.read_from_device(core, &mut value, addr)?;
        let value = u32::from_le_bytes(value) | update;
        self.write_to_device(core, &value.to_le_bytes(), addr)?;
        self.wait_for_non_mmio_flush()
    }

    /// Clear the selected RISCs in the core's soft-reset register. With
    /// `staggered_start`, the request flag rides bit 31 so firmware offsets
    /// the cores' start times instead of releasing them simultaneously.
    pub fn deassert_risc_reset(
        &self,
        core: XyPair,
        selected: RiscType,
        staggered_start: bool,
    ) -> Result<()> {
        let update = self.arch.get_soft_reset_reg_value(selected)?;
        let addr = self.arch.tensix_soft_reset_addr();
        let mut value = [0u8; 4];
        self.read_from_device(core, &mut value, addr)?;
        let mut value = u32::from_le_bytes(value) & !update;
        if staggered_start {
            value |= TensixSoftResetOptions::STAGGERED_START.bits();
        }
        self.write_to_device(core, &value.to_le_bytes(), addr)?;
        self.wait_for_non_mmio_flush()
    }

    // ---- ARC messages ----

    /// Send a firmware message and return `(exit_code, out3, out4)`.
    pub fn arc_msg(
        &self,
        msg_code: u32,
        wait_for_done: bool,
        arg0: u16,
        arg1: u16,
        timeout: Duration,
    ) -> Result<(u32, u32, u32)> {
        let messenger = self.arc_messenger.as_ref().ok_or_else(|| {
            Error::Configuration("ARC messages are not available on this transport".into())
        })?;
        if !wait_for_done {
            debug!(msg_code = format_args!("{msg_code:#x}"), "arc_msg without wait");
        }
        let mut return_values = [0u32; 2];
        let exit_code = messenger.send_message(
            msg_code,
            wait_for_done,
            &mut return_values,
            arg0,
            arg1,
            timeout,
        )?;
        if exit_code != 0 {
            warn!(
                msg_code = format_args!("{msg_code:#x}"),
                exit_code, "ARC message returned nonzero exit code"
            );
        }
        Ok((exit_code, return_values[0], return_values[1]))
    }

    /// The per-device I/O mutex, exposed for callers that compose several
    /// transfers into one critical section.
    pub fn acquire_io_mutex(&self) -> Result<crate::sync::MutexGuard> {
        let device_num = self
            .pci_device
            .as_ref()
            .map(|d| d.get_device_num())
            .unwrap_or(self.chip_id as usize);
        self.lock_manager
            .acquire_mutex(MutexType::DeviceIo(device_num), MutexKind::SystemWide)
    }
}

impl std::fmt::Debug for LocalChip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChip")
            .field("chip_id", &self.chip_id)
            .field("arch", &self.arch)
            .field("remote", &false)
            .finish()
    }
}
