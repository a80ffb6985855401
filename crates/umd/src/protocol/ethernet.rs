//! Ethernet transport: every transaction rides the remote tunnel.

use std::sync::Arc;

use crate::error::Result;
use crate::remote::RemoteCommunication;
use crate::types::{EthCoord, XyPair};

#[derive(Debug)]
pub struct EthernetProtocol {
    remote_communication: Arc<RemoteCommunication>,
    target_chip: EthCoord,
}

impl EthernetProtocol {
    pub fn new(remote_communication: Arc<RemoteCommunication>, target_chip: EthCoord) -> Self {
        Self {
            remote_communication,
            target_chip,
        }
    }

    pub fn target_chip(&self) -> EthCoord {
        self.target_chip
    }

    pub fn remote_communication(&self) -> &Arc<RemoteCommunication> {
        &self.remote_communication
    }

    pub fn write_to_device(&self, mem: &[u8], core: XyPair, addr: u64) -> Result<()> {
        self.remote_communication
            .write_to_non_mmio(self.target_chip, core, mem, addr)
    }

    pub fn read_from_device(&self, mem: &mut [u8], core: XyPair, addr: u64) -> Result<()> {
        self.remote_communication
            .read_non_mmio(self.target_chip, core, mem, addr)
    }

    pub fn wait_for_non_mmio_flush(&self) -> Result<()> {
        self.remote_communication.wait_for_non_mmio_flush()
    }
}
