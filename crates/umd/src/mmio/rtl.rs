//! RTL-simulator device I/O: framed messages to the simulator process.

use std::sync::Mutex;

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::simulation::host::SimulationHost;
use crate::simulation::message::{MessageType, ReadMessageData, WriteMessageData};
use crate::types::tlb::{TlbData, TlbOrdering};
use crate::types::XyPair;

use super::DeviceIo;

pub struct RtlDeviceIo {
    host: Mutex<SimulationHost>,
    arch: Arch,
    window_size: u64,
    base_address: u64,
    config: TlbData,
}

impl RtlDeviceIo {
    /// Bind the messaging socket and wait for the simulator to connect.
    pub fn new(arch: Arch, window_size: u64, base_address: u64, config: TlbData) -> Result<Self> {
        let mut host = SimulationHost::init()?;
        host.start_host()?;
        Ok(Self {
            host: Mutex::new(host),
            arch,
            window_size,
            base_address,
            config,
        })
    }

    pub fn arch(&self) -> Arch {
        self.arch
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

    /// The window's routed core; the simulator resolves `(core, addr)`.
    fn window_core(&self) -> XyPair {
        XyPair::new(self.config.x_end as u32, self.config.y_end as u32)
    }

    fn send_write(&self, core: XyPair, addr: u64, data: &[u8]) -> Result<()> {
        let head = WriteMessageData {
            core,
            l1_dest: addr,
            size: data.len() as u32,
        };
        let mut payload = Vec::with_capacity(head.to_bytes().len() + data.len());
        payload.extend_from_slice(&head.to_bytes());
        payload.extend_from_slice(data);
        let mut host = self.lock_host();
        host.exchange(MessageType::WriteToDevice, &payload)?;
        Ok(())
    }

    fn send_read(&self, core: XyPair, addr: u64, data: &mut [u8]) -> Result<()> {
        let head = ReadMessageData {
            core,
            l1_src: addr,
            size: data.len() as u32,
        };
        let mut host = self.lock_host();
        let response = host.exchange(MessageType::ReadFromDevice, &head.to_bytes())?;
        if response.len() != data.len() {
            return Err(Error::Simulator(format!(
                "read returned {} bytes, expected {}",
                response.len(),
                data.len()
            )));
        }
        data.copy_from_slice(&response);
        Ok(())
    }

    fn lock_host(&self) -> std::sync::MutexGuard<'_, SimulationHost> {
        self.host
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DeviceIo for RtlDeviceIo {
    fn write32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.validate(offset, 4)?;
        self.send_write(
            self.window_core(),
            self.base_address + offset,
            &value.to_le_bytes(),
        )
    }

    fn read32(&mut self, offset: u64) -> Result<u32> {
        self.validate(offset, 4)?;
        let mut word = [0u8; 4];
        self.send_read(self.window_core(), self.base_address + offset, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    fn write_register(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.validate(offset, data.len() as u64)?;
        self.send_write(self.window_core(), self.base_address + offset, data)
    }

    fn read_register(&mut self, offset: u64, data: &mut [u8]) -> Result<()> {
        self.validate(offset, data.len() as u64)?;
        self.send_read(self.window_core(), self.base_address + offset, data)
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
        self.send_write(core, addr, data)
    }

    fn read_block_reconfigure(
        &mut self,
        data: &mut [u8],
        core: XyPair,
        addr: u64,
        _ordering: TlbOrdering,
    ) -> Result<()> {
        self.send_read(core, addr, data)
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
        let excluded = self.arch.multicast_excluded_columns();
        for x in core_start.x..=core_end.x {
            if excluded.contains(&x) {
                continue;
            }
            for y in core_start.y..=core_end.y {
                self.send_write(XyPair::new(x, y), addr, data)?;
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

impl std::fmt::Debug for RtlDeviceIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtlDeviceIo")
            .field("window_size", &self.window_size)
            .field("base_address", &self.base_address)
            .finish()
    }
}
