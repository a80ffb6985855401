//! A TLB handle bound to a routing configuration.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::device_memcpy::{memcpy_from_device, memcpy_to_device};
use crate::types::tlb::{TlbData, TlbOrdering};
use crate::types::XyPair;

use super::pci_device::{BarMapping, PciDevice};
use super::tlb_handle::TlbHandle;

/// Full memory fence. Compiles to `mfence` on x86-64, `dmb ish` on ARM64 and
/// `fence iorw,iorw` on RISC-V.
#[inline]
pub(crate) fn mfence() {
    fence(Ordering::SeqCst);
}

/// Write a TLB configuration register: one 64-bit store for the lower half,
/// plus one 32-bit store for the upper word of 12-byte registers.
///
/// The trailing fence is the load-bearing part. The register lives in
/// uncached memory while data stores usually go through write-combine
/// mappings; without the fence a weakly-ordered host may commit data stores
/// ahead of the configuration store and route them through the previous
/// window target. ARM64 and RISC-V also need the leading fence because they
/// have no uncached-store ordering to rely on.
pub(crate) fn write_tlb_reg(
    bar0_uc: &BarMapping,
    byte_addr: u32,
    value_lower: u64,
    value_upper: u64,
    tlb_cfg_reg_size: u32,
) -> Result<()> {
    if tlb_cfg_reg_size != 8 && tlb_cfg_reg_size != 12 {
        return Err(Error::InvalidArgument(
            "hardware supports only 64-bit or 96-bit TLB config registers".into(),
        ));
    }

    let dest_qw = bar0_uc.ptr_at(byte_addr as u64, tlb_cfg_reg_size as u64)? as *mut u64;

    #[cfg(any(target_arch = "aarch64", target_arch = "riscv64"))]
    mfence();

    unsafe {
        dest_qw.write_volatile(value_lower);
        if tlb_cfg_reg_size > 8 {
            let dest_extra_dw = (dest_qw as *mut u8).add(8) as *mut u32;
            dest_extra_dw.write_volatile(value_upper as u32);
        }
    }

    mfence();
    Ok(())
}

/// A TLB handle plus its current routing configuration. Every read or write
/// through the window happens only after the configuration has been written
/// to the chip's TLB configuration register for this id.
pub struct TlbWindow {
    handle: TlbHandle,
    device: Arc<PciDevice>,
    config: TlbData,
    /// Window-aligned device address the window currently routes to.
    base_address: u64,
}

impl TlbWindow {
    /// Bind a fresh handle to `config` and program the hardware register.
    /// `config.local_offset` carries the byte address to route to.
    pub fn new(handle: TlbHandle, device: Arc<PciDevice>, config: TlbData) -> Result<Self> {
        let mut window = Self {
            handle,
            device,
            config,
            base_address: 0,
        };
        window.configure(config)?;
        Ok(window)
    }

    pub fn handle(&self) -> &TlbHandle {
        &self.handle
    }

    pub fn get_size(&self) -> u64 {
        self.handle.size()
    }

    pub fn get_base_address(&self) -> u64 {
        self.base_address
    }

    pub fn config(&self) -> &TlbData {
        &self.config
    }

    /// Reprogram the window. Permitted at any time; ordered against later
    /// data stores by the fence inside the register write.
    pub fn configure(&mut self, new_config: TlbData) -> Result<()> {
        let arch = self.device.get_arch();
        let tlb_config = arch.get_tlb_configuration(self.handle.tlb_id());
        let reg_size = arch.tlb_cfg_reg_size_bytes();

        // The kernel allocates ids out of the same index space the address
        // map describes; a size disagreement means the id is not ours.
        if tlb_config.size != self.handle.size() {
            return Err(Error::InvalidArgument(format!(
                "TLB id {} maps to a {:#x}-byte window, but the handle owns {:#x} bytes",
                self.handle.tlb_id(),
                tlb_config.size,
                self.handle.size()
            )));
        }

        let address = new_config.local_offset;
        let mut hw_config = new_config;
        hw_config.local_offset = address / tlb_config.size;

        let (lower, upper) = hw_config.apply_offset(tlb_config.offsets);
        let cfg_reg = tlb_config.cfg_reg_addr(reg_size);
        write_tlb_reg(&self.device.bar0_uc, cfg_reg, lower, upper, reg_size)?;

        self.config = new_config;
        self.base_address = (address / tlb_config.size) * tlb_config.size;
        Ok(())
    }

    fn validate(&self, offset: u64, size: u64) -> Result<()> {
        if offset + size > self.get_size() {
            return Err(Error::InvalidArgument(format!(
                "access at {offset:#x}+{size:#x} exceeds TLB window of {:#x} bytes",
                self.get_size()
            )));
        }
        Ok(())
    }

    pub fn write32(&self, offset: u64, value: u32) -> Result<()> {
        self.validate(offset, 4)?;
        unsafe {
            (self.handle.base().add(offset as usize) as *mut u32).write_volatile(value);
        }
        Ok(())
    }

    pub fn read32(&self, offset: u64) -> Result<u32> {
        self.validate(offset, 4)?;
        Ok(unsafe { (self.handle.base().add(offset as usize) as *const u32).read_volatile() })
    }

    /// Register accesses are word-granular on every architecture.
    pub fn write_register(&self, offset: u64, data: &[u8]) -> Result<()> {
        if data.len() % 4 != 0 || offset % 4 != 0 {
            return Err(Error::InvalidArgument(
                "register access must be 4-byte aligned".into(),
            ));
        }
        self.validate(offset, data.len() as u64)?;
        let mut dest = unsafe { self.handle.base().add(offset as usize) } as *mut u32;
        for chunk in data.chunks_exact(4) {
            let word = u32::from_le_bytes(chunk.try_into().unwrap());
            unsafe {
                dest.write_volatile(word);
                dest = dest.add(1);
            }
        }
        Ok(())
    }

    pub fn read_register(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        if data.len() % 4 != 0 || offset % 4 != 0 {
            return Err(Error::InvalidArgument(
                "register access must be 4-byte aligned".into(),
            ));
        }
        self.validate(offset, data.len() as u64)?;
        let mut src = unsafe { self.handle.base().add(offset as usize) } as *const u32;
        for chunk in data.chunks_exact_mut(4) {
            let word = unsafe {
                let w = src.read_volatile();
                src = src.add(1);
                w
            };
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    pub fn write_block(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.validate(offset, data.len() as u64)?;
        let dest = unsafe { self.handle.base().add(offset as usize) };
        if self.device.get_arch().needs_custom_memcpy() {
            unsafe { memcpy_to_device(dest, data) };
        } else {
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len()) };
        }
        Ok(())
    }

    pub fn read_block(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        self.validate(offset, data.len() as u64)?;
        let src = unsafe { self.handle.base().add(offset as usize) as *const u8 };
        if self.device.get_arch().needs_custom_memcpy() {
            unsafe { memcpy_from_device(data, src) };
        } else {
            unsafe { std::ptr::copy_nonoverlapping(src, data.as_mut_ptr(), data.len()) };
        }
        Ok(())
    }

    /// Route `(core, addr)` through this window with the requested ordering
    /// and write `data`, striding across the window as needed.
    pub fn write_block_reconfigure(
        &mut self,
        data: &[u8],
        core: XyPair,
        addr: u64,
        ordering: TlbOrdering,
    ) -> Result<()> {
        let mut addr = addr;
        let mut remaining = data;
        while !remaining.is_empty() {
            let offset_in_window = self.route_unicast(core, addr, ordering)?;
            let chunk = remaining
                .len()
                .min((self.get_size() - offset_in_window) as usize);
            self.write_block(offset_in_window, &remaining[..chunk])?;
            remaining = &remaining[chunk..];
            addr += chunk as u64;
        }
        Ok(())
    }

    pub fn read_block_reconfigure(
        &mut self,
        data: &mut [u8],
        core: XyPair,
        addr: u64,
        ordering: TlbOrdering,
    ) -> Result<()> {
        let mut offset = 0usize;
        while offset < data.len() {
            let offset_in_window = self.route_unicast(core, addr + offset as u64, ordering)?;
            let chunk = (data.len() - offset).min((self.get_size() - offset_in_window) as usize);
            self.read_block(offset_in_window, &mut data[offset..offset + chunk])?;
            offset += chunk;
        }
        Ok(())
    }

    /// Multicast `data` to the `[core_start, core_end]` rectangle. The
    /// architecture workaround keeps the PCIe column out of the rectangle so
    /// the multicast cannot back up behind its own source node.
    pub fn noc_multicast_write_reconfigure(
        &mut self,
        data: &[u8],
        core_start: XyPair,
        core_end: XyPair,
        addr: u64,
        ordering: TlbOrdering,
    ) -> Result<()> {
        let arch = self.device.get_arch();
        let (start, end) = arch.multicast_workaround(core_start, core_end);
        let mut addr = addr;
        let mut remaining = data;
        while !remaining.is_empty() {
            let config = TlbData {
                local_offset: addr,
                x_end: end.x as u64,
                y_end: end.y as u64,
                x_start: start.x as u64,
                y_start: start.y as u64,
                noc_sel: self.config.noc_sel,
                mcast: true,
                ordering,
                linked: false,
                static_vc: arch.use_static_vc(),
                static_vc_num: arch.static_vc(),
            };
            self.configure(config)?;
            let offset_in_window = addr - self.base_address;
            let chunk = remaining
                .len()
                .min((self.get_size() - offset_in_window) as usize);
            self.write_block(offset_in_window, &remaining[..chunk])?;
            remaining = &remaining[chunk..];
            addr += chunk as u64;
        }
        Ok(())
    }

    /// Point the window at `(core, addr)`; returns the in-window offset of
    /// `addr`.
    fn route_unicast(&mut self, core: XyPair, addr: u64, ordering: TlbOrdering) -> Result<u64> {
        let arch = self.device.get_arch();
        let config = TlbData {
            local_offset: addr,
            x_end: core.x as u64,
            y_end: core.y as u64,
            x_start: 0,
            y_start: 0,
            noc_sel: self.config.noc_sel,
            mcast: false,
            ordering,
            linked: false,
            static_vc: arch.use_static_vc(),
            static_vc_num: arch.static_vc(),
        };
        self.configure(config)?;
        Ok(addr - self.base_address)
    }
}

impl std::fmt::Debug for TlbWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlbWindow")
            .field("tlb_id", &self.handle.tlb_id())
            .field("size", &self.get_size())
            .field("base_address", &self.base_address)
            .finish()
    }
}
