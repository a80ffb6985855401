//! Firmware messages to the on-die ARC management processor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{Error, Result};
use crate::protocol::pcie::{PcieProtocol, HANG_READ_VALUE};
use crate::sync::{LockManager, MutexKind, MutexType};

/// Default deadline for the firmware to pick up and answer a message.
pub const ARC_MSG_DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ArcMessenger {
    protocol: Arc<PcieProtocol>,
    lock_manager: LockManager,
}

impl ArcMessenger {
    pub fn new(protocol: Arc<PcieProtocol>) -> Result<Self> {
        let lock_manager = LockManager;
        lock_manager.initialize_mutex(
            MutexType::ArcMsg(protocol.pci_device().get_device_num()),
            MutexKind::SystemWide,
        )?;
        Ok(Self {
            protocol,
            lock_manager,
        })
    }

    /// Send `msg_code` with two 16-bit args and poll for completion.
    /// `return_values` receives up to two firmware result registers; the
    /// return value is the firmware's exit code (high half of the status).
    /// With `wait_for_done` unset, the message is triggered and the call
    /// returns immediately with exit code zero.
    pub fn send_message(
        &self,
        msg_code: u32,
        wait_for_done: bool,
        return_values: &mut [u32],
        arg0: u16,
        arg1: u16,
        timeout: Duration,
    ) -> Result<u32> {
        let device = self.protocol.pci_device();
        let arch = device.get_arch();

        if (msg_code & 0xFF00) != arch.arc_msg_common_prefix() {
            warn!(
                msg_code = format_args!("{msg_code:#x}"),
                "malformed message: msg_code should carry the 0xaa.. prefix"
            );
        }

        let _lock = self.lock_manager.acquire_mutex(
            MutexType::ArcMsg(device.get_device_num()),
            MutexKind::SystemWide,
        )?;

        let scratch = arch.arc_reset_scratch_offset() as u64;
        let res0 = scratch + 4 * arch.arc_scratch_res0_offset() as u64;
        let res1 = scratch + 4 * arch.arc_scratch_res1_offset() as u64;
        let status = scratch + 4 * arch.arc_scratch_status_offset() as u64;
        let misc_cntl = arch.arc_reset_arc_misc_cntl_offset() as u64;

        let fw_arg = arg0 as u32 | ((arg1 as u32) << 16);
        let bar0 = &device.bar0_uc;
        bar0.write32(res0, fw_arg)?;
        bar0.write32(status, msg_code)?;

        // Bit 16 raises the firmware interrupt; if it is still set the
        // previous trigger was never consumed.
        let misc = bar0.read32(misc_cntl)?;
        if misc & (1 << 16) != 0 {
            return Err(Error::Configuration(format!(
                "ARC firmware interrupt already pending on device {}",
                device.get_device_num()
            )));
        }
        bar0.write32(misc_cntl, misc | (1 << 16))?;

        if !wait_for_done {
            return Ok(0);
        }

        let start = Instant::now();
        let exit_code = loop {
            if start.elapsed() > timeout && !timeout.is_zero() {
                return Err(Error::Timeout {
                    what: format!("ARC to respond to message {msg_code:#x}"),
                    elapsed: start.elapsed(),
                });
            }

            let status_value = bar0.read32(status)?;
            if (status_value & 0xFFFF) == (msg_code & 0xFF) {
                if let Some(slot) = return_values.get_mut(0) {
                    *slot = bar0.read32(res0)?;
                }
                if let Some(slot) = return_values.get_mut(1) {
                    *slot = bar0.read32(res1)?;
                }
                break status_value >> 16;
            } else if status_value == HANG_READ_VALUE {
                warn!(
                    device = device.get_device_num(),
                    msg_code = format_args!("{msg_code:#x}"),
                    "message code not recognized by FW"
                );
                break HANG_READ_VALUE;
            }
        };

        self.protocol.detect_hang_read(HANG_READ_VALUE)?;
        Ok(exit_code)
    }
}

impl std::fmt::Debug for ArcMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArcMessenger").finish()
    }
}
