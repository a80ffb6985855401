//! PCIe transport: dynamic-TLB block transfers over the BAR mappings.

use std::sync::Arc;

use tracing::trace;

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::pcie::pci_device::PciDevice;
use crate::pcie::tlb_window::write_tlb_reg;
use crate::sync::{LockManager, MutexKind, MutexType};
use crate::types::tlb::{TlbData, TlbOrdering};
use crate::types::XyPair;

use super::device_memcpy::{memcpy_from_device, memcpy_to_device};

/// Canary value an all-ones PCIe read returns when the chip stops answering.
pub const HANG_READ_VALUE: u32 = 0xFFFF_FFFF;

/// Result of programming a dynamic TLB.
#[derive(Debug, Clone, Copy)]
pub struct DynamicTlb {
    /// Offset the address is mapped to, within the PCI BAR.
    pub bar_offset: u64,
    /// Bytes remaining between `bar_offset` and the end of the TLB.
    pub remaining_size: u64,
}

pub struct PcieProtocol {
    pci_device: Arc<PciDevice>,
    lock_manager: LockManager,
}

impl PcieProtocol {
    pub fn new(pci_device: Arc<PciDevice>) -> Result<Self> {
        let lock_manager = LockManager;
        lock_manager.initialize_mutex(
            MutexType::DeviceIo(pci_device.get_device_num()),
            MutexKind::SystemWide,
        )?;
        Ok(Self {
            pci_device,
            lock_manager,
        })
    }

    pub fn pci_device(&self) -> &Arc<PciDevice> {
        &self.pci_device
    }

    fn arch(&self) -> Arch {
        self.pci_device.get_arch()
    }

    pub fn write_to_device(&self, mem: &[u8], core: XyPair, addr: u64) -> Result<()> {
        let _lock = self.lock_manager.acquire_mutex(
            MutexType::DeviceIo(self.pci_device.get_device_num()),
            MutexKind::SystemWide,
        )?;
        let tlb_index = self.arch().reg_tlb();
        let mut addr = addr;
        let mut remaining = mem;
        while !remaining.is_empty() {
            let tlb = self.set_dynamic_tlb_unicast(tlb_index, core, addr, TlbOrdering::Strict)?;
            let transfer_size = remaining.len().min(tlb.remaining_size as usize);
            self.write_block(tlb.bar_offset, &remaining[..transfer_size])?;
            remaining = &remaining[transfer_size..];
            addr += transfer_size as u64;
        }
        Ok(())
    }

    pub fn read_from_device(&self, mem: &mut [u8], core: XyPair, addr: u64) -> Result<()> {
        let _lock = self.lock_manager.acquire_mutex(
            MutexType::DeviceIo(self.pci_device.get_device_num()),
            MutexKind::SystemWide,
        )?;
        let tlb_index = self.arch().reg_tlb();
        let mut offset = 0usize;
        while offset < mem.len() {
            let tlb = self.set_dynamic_tlb_unicast(
                tlb_index,
                core,
                addr + offset as u64,
                TlbOrdering::Strict,
            )?;
            let transfer_size = (mem.len() - offset).min(tlb.remaining_size as usize);
            self.read_block(tlb.bar_offset, &mut mem[offset..offset + transfer_size])?;
            offset += transfer_size;
        }
        Ok(())
    }

    /// Resolve `byte_addr` to a destination pointer: BAR4 above the pivot on
    /// architectures that have one, otherwise BAR0 (write-combined where the
    /// mapping covers the address, uncached above it).
    fn block_ptr(&self, byte_addr: u64, len: u64) -> Result<*mut u8> {
        if let (Some(bar4_wc), Some(pivot)) =
            (self.pci_device.bar4_wc.as_ref(), self.arch().bar0_wc_pivot())
        {
            if byte_addr >= pivot {
                return bar4_wc.ptr_at(byte_addr - pivot, len);
            }
        }
        if let Some(bar0_wc) = self.pci_device.bar0_wc.as_ref() {
            if byte_addr + len <= bar0_wc.len() {
                return bar0_wc.ptr_at(byte_addr, len);
            }
        }
        self.pci_device.bar0_uc.ptr_at(byte_addr, len)
    }

    pub fn write_block(&self, byte_addr: u64, data: &[u8]) -> Result<()> {
        let dest = self.block_ptr(byte_addr, data.len() as u64)?;
        if self.arch().needs_custom_memcpy() {
            unsafe { memcpy_to_device(dest, data) };
        } else {
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len()) };
        }
        Ok(())
    }

    pub fn read_block(&self, byte_addr: u64, data: &mut [u8]) -> Result<()> {
        let src = self.block_ptr(byte_addr, data.len() as u64)? as *const u8;
        if self.arch().needs_custom_memcpy() {
            unsafe { memcpy_from_device(data, src) };
        } else {
            unsafe { std::ptr::copy_nonoverlapping(src, data.as_mut_ptr(), data.len()) };
        }

        if data.len() >= 4 {
            let first_word = u32::from_le_bytes(data[..4].try_into().unwrap());
            self.detect_hang_read(first_word)?;
        }
        Ok(())
    }

    /// Program dynamic TLB `tlb_index` to route `(start..=end, address)` and
    /// return where the window landed in the BAR.
    pub fn set_dynamic_tlb(
        &self,
        tlb_index: u32,
        start: XyPair,
        end: XyPair,
        address: u64,
        multicast: bool,
        ordering: TlbOrdering,
    ) -> Result<DynamicTlb> {
        let arch = self.arch();
        let (start, end) = if multicast {
            arch.multicast_workaround(start, end)
        } else {
            (start, end)
        };

        trace!(
            tlb_index,
            start = %start,
            end = %end,
            address = format_args!("{address:#x}"),
            multicast,
            ?ordering,
            "set_dynamic_tlb"
        );

        let tlb_config = arch.get_tlb_configuration(tlb_index);
        let reg_size = arch.tlb_cfg_reg_size_bytes();
        let tlb_address = address / tlb_config.size;
        let local_address = address % tlb_config.size;
        let tlb_base = tlb_config.window_base();
        let tlb_cfg_reg = tlb_config.cfg_reg_addr(reg_size);

        let data = TlbData {
            local_offset: tlb_address,
            x_end: end.x as u64,
            y_end: end.y as u64,
            x_start: start.x as u64,
            y_start: start.y as u64,
            noc_sel: crate::use_noc1() as u64,
            mcast: multicast,
            ordering,
            linked: false,
            // Blackhole A0 can deadlock when reads and writes share a static
            // VC, even through different TLBs; it runs with dynamic VC.
            static_vc: arch.use_static_vc(),
            static_vc_num: arch.static_vc(),
        };
        let (lower, upper) = data.apply_offset(tlb_config.offsets);
        write_tlb_reg(&self.pci_device.bar0_uc, tlb_cfg_reg, lower, upper, reg_size)?;

        Ok(DynamicTlb {
            bar_offset: tlb_base + local_address,
            remaining_size: tlb_config.size - local_address,
        })
    }

    pub fn set_dynamic_tlb_unicast(
        &self,
        tlb_index: u32,
        target: XyPair,
        address: u64,
        ordering: TlbOrdering,
    ) -> Result<DynamicTlb> {
        self.set_dynamic_tlb(tlb_index, XyPair::new(0, 0), target, address, false, ordering)
    }

    pub fn set_dynamic_tlb_broadcast(
        &self,
        tlb_index: u32,
        address: u64,
        start: XyPair,
        end: XyPair,
        ordering: TlbOrdering,
    ) -> Result<DynamicTlb> {
        self.set_dynamic_tlb(tlb_index, start, end, address, true, ordering)
    }

    /// All-ones is also a legal data value; confirm with the ARC scratch
    /// register before declaring the hardware dead.
    pub fn detect_hang_read(&self, data_read: u32) -> Result<()> {
        if data_read == HANG_READ_VALUE && self.is_hardware_hung()? {
            return Err(Error::HardwareHang);
        }
        Ok(())
    }

    pub fn is_hardware_hung(&self) -> Result<bool> {
        let scratch = self
            .pci_device
            .bar0_uc
            .read32(self.arch().read_checking_offset() as u64)?;
        Ok(scratch == HANG_READ_VALUE)
    }
}

impl std::fmt::Debug for PcieProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcieProtocol")
            .field("device", &self.pci_device.get_device_num())
            .finish()
    }
}
