//! TTSim device I/O: the window is emulated over the simulator library's
//! PCI-memory and tile entry points.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::simulation::TtSimChip;
use crate::types::tlb::{TlbData, TlbOrdering};
use crate::types::XyPair;

use super::DeviceIo;

pub struct TtSimDeviceIo {
    chip: Arc<TtSimChip>,
    /// The simulator library is single-threaded.
    device_lock: Mutex<()>,
    window_size: u64,
    base_address: u64,
    config: TlbData,
}

impl TtSimDeviceIo {
    pub fn new(chip: Arc<TtSimChip>, window_size: u64, base_address: u64, config: TlbData) -> Self {
        Self {
            chip,
            device_lock: Mutex::new(()),
            window_size,
            base_address,
            config,
        }
    }

    fn validate(&self, offset: u64, size: u64) -> Result<()> {
        if offset + size > self.window_size {
            return Err(Error::InvalidArgument(format!(
                "access at {offset:#x}+{size:#x} exceeds simulated window of {:#x} bytes",
                self.window_size
            )));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.device_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DeviceIo for TtSimDeviceIo {
    fn write32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.validate(offset, 4)?;
        let _lock = self.lock();
        self.chip
            .pci_mem_write(self.base_address + offset, &value.to_le_bytes());
        Ok(())
    }

    fn read32(&mut self, offset: u64) -> Result<u32> {
        self.validate(offset, 4)?;
        let _lock = self.lock();
        let mut word = [0u8; 4];
        self.chip.pci_mem_read(self.base_address + offset, &mut word);
        Ok(u32::from_le_bytes(word))
    }

    fn write_register(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.validate(offset, data.len() as u64)?;
        let _lock = self.lock();
        self.chip.pci_mem_write(self.base_address + offset, data);
        Ok(())
    }

    fn read_register(&mut self, offset: u64, data: &mut [u8]) -> Result<()> {
        self.validate(offset, data.len() as u64)?;
        let _lock = self.lock();
        self.chip.pci_mem_read(self.base_address + offset, data);
        Ok(())
    }

    fn write_block(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.write_register(offset, data)
    }

    fn read_block(&mut self, offset: u64, data: &mut [u8]) -> Result<()> {
        self.read_register(offset, data)
    }

    fn write_block_reconfigure(
        &mut self,
        data: &[u8],
        core: XyPair,
        addr: u64,
        _ordering: TlbOrdering,
    ) -> Result<()> {
        // The simulator addresses tiles directly; no window striding needed.
        let _lock = self.lock();
        self.chip.write_to_device(core, data, addr);
        Ok(())
    }

    fn read_block_reconfigure(
        &mut self,
        data: &mut [u8],
        core: XyPair,
        addr: u64,
        _ordering: TlbOrdering,
    ) -> Result<()> {
        let _lock = self.lock();
        self.chip.read_from_device(core, data, addr);
        Ok(())
    }

    fn noc_multicast_write_reconfigure(
        &mut self,
        data: &[u8],
        core_start: XyPair,
        core_end: XyPair,
        addr: u64,
        _ordering: TlbOrdering,
    ) -> Result<()> {
        // Emulated by unicast iteration; skip the columns that host DRAM
        // rather than tensix.
        let excluded = self.chip.arch().multicast_excluded_columns();
        let _lock = self.lock();
        for x in core_start.x..=core_end.x {
            if excluded.contains(&x) {
                continue;
            }
            for y in core_start.y..=core_end.y {
                self.chip.write_to_device(XyPair::new(x, y), data, addr);
            }
        }
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.window_size
    }

    fn get_base_address(&self) -> u64 {
        self.base_address
    }

    fn configure(&mut self, new_config: TlbData) -> Result<()> {
        self.config = new_config;
        self.base_address = new_config.local_offset;
        Ok(())
    }
}

impl std::fmt::Debug for TtSimDeviceIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtSimDeviceIo")
            .field("window_size", &self.window_size)
            .field("base_address", &self.base_address)
            .finish()
    }
}
