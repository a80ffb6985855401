//! Silicon device I/O: a thin wrapper over one TLB window.

use std::sync::Arc;

use crate::error::Result;
use crate::pcie::pci_device::PciDevice;
use crate::pcie::tlb_window::TlbWindow;
use crate::types::tlb::{TlbData, TlbMapping, TlbOrdering};
use crate::types::XyPair;

use super::DeviceIo;

pub struct SiliconDeviceIo {
    tlb_window: TlbWindow,
}

impl SiliconDeviceIo {
    pub fn new(
        pci_device: Arc<PciDevice>,
        size: u64,
        tlb_mapping: TlbMapping,
        config: TlbData,
    ) -> Result<Self> {
        let handle = pci_device.allocate_tlb(size, tlb_mapping)?;
        let tlb_window = TlbWindow::new(handle, pci_device, config)?;
        Ok(Self { tlb_window })
    }

    pub fn tlb_window(&self) -> &TlbWindow {
        &self.tlb_window
    }
}

impl DeviceIo for SiliconDeviceIo {
    fn write32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.tlb_window.write32(offset, value)
    }

    fn read32(&mut self, offset: u64) -> Result<u32> {
        self.tlb_window.read32(offset)
    }

    fn write_register(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.tlb_window.write_register(offset, data)
    }

    fn read_register(&mut self, offset: u64, data: &mut [u8]) -> Result<()> {
        self.tlb_window.read_register(offset, data)
    }

    fn write_block(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.tlb_window.write_block(offset, data)
    }

    fn read_block(&mut self, offset: u64, data: &mut [u8]) -> Result<()> {
        self.tlb_window.read_block(offset, data)
    }

    fn write_block_reconfigure(
        &mut self,
        data: &[u8],
        core: XyPair,
        addr: u64,
        ordering: TlbOrdering,
    ) -> Result<()> {
        self.tlb_window
            .write_block_reconfigure(data, core, addr, ordering)
    }

    fn read_block_reconfigure(
        &mut self,
        data: &mut [u8],
        core: XyPair,
        addr: u64,
        ordering: TlbOrdering,
    ) -> Result<()> {
        self.tlb_window
            .read_block_reconfigure(data, core, addr, ordering)
    }

    fn noc_multicast_write_reconfigure(
        &mut self,
        data: &[u8],
        core_start: XyPair,
        core_end: XyPair,
        addr: u64,
        ordering: TlbOrdering,
    ) -> Result<()> {
        self.tlb_window
            .noc_multicast_write_reconfigure(data, core_start, core_end, addr, ordering)
    }

    fn get_size(&self) -> u64 {
        self.tlb_window.get_size()
    }

    fn get_base_address(&self) -> u64 {
        self.tlb_window.get_base_address()
    }

    fn configure(&mut self, new_config: TlbData) -> Result<()> {
        self.tlb_window.configure(new_config)
    }
}
