//! JTAG transport: word-at-a-time transfers through the probe library.

use std::sync::Arc;

use crate::error::Result;
use crate::jtag::JtagDevice;
use crate::types::XyPair;

#[derive(Debug)]
pub struct JtagProtocol {
    jtag_device: Arc<JtagDevice>,
    chip_id: u8,
}

impl JtagProtocol {
    pub fn new(jtag_device: Arc<JtagDevice>, chip_id: u8) -> Self {
        Self {
            jtag_device,
            chip_id,
        }
    }

    pub fn jtag_device(&self) -> &Arc<JtagDevice> {
        &self.jtag_device
    }

    pub fn write_to_device(&self, mem: &[u8], core: XyPair, addr: u64) -> Result<()> {
        let noc_id = crate::use_noc1() as u8;
        self.jtag_device
            .write(self.chip_id, mem, core.x as u8, core.y as u8, addr, noc_id)
    }

    pub fn read_from_device(&self, mem: &mut [u8], core: XyPair, addr: u64) -> Result<()> {
        let noc_id = crate::use_noc1() as u8;
        self.jtag_device
            .read(self.chip_id, mem, core.x as u8, core.y as u8, addr, noc_id)
    }

    /// JTAG transactions complete synchronously; there is nothing to flush.
    pub fn wait_for_non_mmio_flush(&self) -> Result<()> {
        Ok(())
    }
}
