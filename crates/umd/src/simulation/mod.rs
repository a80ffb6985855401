//! Simulator chip hosting.
//!
//! Two incarnations share one capability set: TTSim runs as a shared
//! library inside this process, the RTL simulator runs as a child process
//! reached over anonymous pipes.

pub mod eth_link;
pub mod host;
pub mod message;
pub mod process_manager;
pub mod ttsim_chip;

use std::path::{Path, PathBuf};

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::types::{ChipId, RiscType, TensixSoftResetOptions, XyPair};

pub use eth_link::EthConnection;
pub use host::SimulationHost;
pub use process_manager::ProcessManager;
pub use ttsim_chip::TtSimChip;

use message::{MessageType, ReadMessageData, ResetMessageData, WriteMessageData};

/// A simulator chip hosted in a child process; every operation is one
/// message round trip.
pub struct ChildProcessChip {
    chip_id: ChipId,
    arch: Arch,
    simulator_directory: PathBuf,
    process: ProcessManager,
}

impl ChildProcessChip {
    pub fn new(simulator_directory: &Path, arch: Arch, chip_id: ChipId) -> Self {
        Self {
            chip_id,
            arch,
            simulator_directory: simulator_directory.to_path_buf(),
            process: ProcessManager::new(chip_id),
        }
    }

    pub fn start_device(&mut self) -> Result<()> {
        self.process.start_child_process(&self.simulator_directory)?;
        self.process
            .send_message_with_response(MessageType::StartDevice, &[], None)?;
        Ok(())
    }

    pub fn close_device(&mut self) -> Result<()> {
        if self.process.is_running() {
            self.process
                .send_message_with_response(MessageType::CloseDevice, &[], None)?;
            self.process.stop_child_process();
        }
        Ok(())
    }

    pub fn write_to_device(&self, core: XyPair, src: &[u8], addr: u64) -> Result<()> {
        let head = WriteMessageData {
            core,
            l1_dest: addr,
            size: src.len() as u32,
        };
        self.process.send_message_with_response(
            MessageType::WriteToDevice,
            &head.to_bytes(),
            Some(src),
        )?;
        Ok(())
    }

    pub fn read_from_device(&self, core: XyPair, dest: &mut [u8], addr: u64) -> Result<()> {
        let head = ReadMessageData {
            core,
            l1_src: addr,
            size: dest.len() as u32,
        };
        let response = self.process.send_message_with_response(
            MessageType::ReadFromDevice,
            &head.to_bytes(),
            None,
        )?;
        if response.len() != dest.len() {
            return Err(Error::Simulator(format!(
                "read returned {} bytes, expected {}",
                response.len(),
                dest.len()
            )));
        }
        dest.copy_from_slice(&response);
        Ok(())
    }

    pub fn send_tensix_risc_reset(
        &self,
        core: XyPair,
        soft_resets: TensixSoftResetOptions,
    ) -> Result<()> {
        let head = ResetMessageData {
            core,
            value: soft_resets.bits() as u64,
            staggered_start: false,
        };
        self.process.send_message_with_response(
            MessageType::SendTensixRiscReset,
            &head.to_bytes(),
            None,
        )?;
        Ok(())
    }

    pub fn assert_risc_reset(&self, core: XyPair, selected: RiscType) -> Result<()> {
        let head = ResetMessageData {
            core,
            value: selected.bits(),
            staggered_start: false,
        };
        self.process.send_message_with_response(
            MessageType::AssertRiscReset,
            &head.to_bytes(),
            None,
        )?;
        Ok(())
    }

    pub fn deassert_risc_reset(
        &self,
        core: XyPair,
        selected: RiscType,
        staggered_start: bool,
    ) -> Result<()> {
        let head = ResetMessageData {
            core,
            value: selected.bits(),
            staggered_start,
        };
        self.process.send_message_with_response(
            MessageType::DeassertRiscReset,
            &head.to_bytes(),
            None,
        )?;
        Ok(())
    }

    /// Ask the child to bring up its emulated Ethernet links. Returns `true`
    /// once every link is connected.
    pub fn connect_eth_links(&self) -> Result<bool> {
        let response = self.process.send_message_with_response(
            MessageType::ConnectEthLinks,
            &[],
            None,
        )?;
        Ok(response.first().copied() == Some(1))
    }
}

impl std::fmt::Debug for ChildProcessChip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcessChip")
            .field("chip_id", &self.chip_id)
            .field("arch", &self.arch)
            .finish()
    }
}

/// The two simulator chip flavors behind one dispatch surface.
#[derive(Debug)]
pub enum SimulationChip {
    TtSim(TtSimChip),
    ChildProcess(ChildProcessChip),
}

impl SimulationChip {
    pub fn arch(&self) -> Arch {
        match self {
            SimulationChip::TtSim(chip) => chip.arch(),
            SimulationChip::ChildProcess(chip) => chip.arch,
        }
    }

    pub fn start_device(&mut self) -> Result<()> {
        match self {
            SimulationChip::TtSim(chip) => chip.start_device(),
            SimulationChip::ChildProcess(chip) => chip.start_device(),
        }
    }

    pub fn close_device(&mut self) -> Result<()> {
        match self {
            SimulationChip::TtSim(chip) => {
                chip.close_device();
                Ok(())
            }
            SimulationChip::ChildProcess(chip) => chip.close_device(),
        }
    }

    pub fn write_to_device(&self, core: XyPair, src: &[u8], addr: u64) -> Result<()> {
        match self {
            SimulationChip::TtSim(chip) => {
                chip.write_to_device(core, src, addr);
                Ok(())
            }
            SimulationChip::ChildProcess(chip) => chip.write_to_device(core, src, addr),
        }
    }

    pub fn read_from_device(&self, core: XyPair, dest: &mut [u8], addr: u64) -> Result<()> {
        match self {
            SimulationChip::TtSim(chip) => {
                chip.read_from_device(core, dest, addr);
                Ok(())
            }
            SimulationChip::ChildProcess(chip) => chip.read_from_device(core, dest, addr),
        }
    }

    pub fn send_tensix_risc_reset(
        &self,
        core: XyPair,
        soft_resets: TensixSoftResetOptions,
    ) -> Result<()> {
        match self {
            SimulationChip::TtSim(chip) => {
                chip.send_tensix_risc_reset(core, soft_resets);
                Ok(())
            }
            SimulationChip::ChildProcess(chip) => chip.send_tensix_risc_reset(core, soft_resets),
        }
    }

    pub fn assert_risc_reset(&self, core: XyPair, selected: RiscType) -> Result<()> {
        match self {
            SimulationChip::TtSim(chip) => chip.assert_risc_reset(core, selected),
            SimulationChip::ChildProcess(chip) => chip.assert_risc_reset(core, selected),
        }
    }

    pub fn deassert_risc_reset(
        &self,
        core: XyPair,
        selected: RiscType,
        staggered_start: bool,
    ) -> Result<()> {
        match self {
            SimulationChip::TtSim(chip) => chip.deassert_risc_reset(core, selected, staggered_start),
            SimulationChip::ChildProcess(chip) => {
                chip.deassert_risc_reset(core, selected, staggered_start)
            }
        }
    }

    pub fn connect_eth_links(&mut self) -> Result<bool> {
        match self {
            SimulationChip::TtSim(chip) => chip.connect_eth_links(),
            SimulationChip::ChildProcess(chip) => chip.connect_eth_links(),
        }
    }
}
