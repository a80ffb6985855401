//! Child-process hosting for simulator chips.
//!
//! The parent talks to the child over two anonymous pipes; the pipe fd
//! numbers travel as argv so the child needs no other handshake. The child
//! polls its read end instead of blocking so it can keep advancing the
//! simulator clock while idle.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::process::{Child, Command};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::types::ChipId;

use super::message::{
    safe_read, safe_write, MessageHeader, MessageType, MESSAGE_HEADER_SIZE,
};

/// Name of the child executable, expected next to the simulator binary.
pub const CHILD_PROCESS_EXECUTABLE: &str = "child_process_sim_chip";

/// Owns one simulator child process and its pipe pair.
pub struct ProcessManager {
    chip_id: ChipId,
    child: Option<Child>,
    /// Parent's write end (parent → child).
    write_fd: Option<OwnedFd>,
    /// Parent's read end (child → parent).
    read_fd: Option<OwnedFd>,
}

impl ProcessManager {
    pub fn new(chip_id: ChipId) -> Self {
        Self {
            chip_id,
            child: None,
            write_fd: None,
            read_fd: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Spawn the child for `simulator_directory`, wiring up both pipes.
    pub fn start_child_process(&mut self, simulator_directory: &Path) -> Result<()> {
        if self.child.is_some() {
            warn!(chip = self.chip_id, "child process already running");
            return Ok(());
        }

        let executable = simulator_directory
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(CHILD_PROCESS_EXECUTABLE);
        if !executable.exists() {
            return Err(Error::Simulator(format!(
                "child process executable not found at: {}",
                executable.display()
            )));
        }

        // parent → child and child → parent. pipe(2) descriptors are
        // inherited across exec, so the child-side numbers can travel in
        // argv.
        let (child_read, parent_write) =
            nix::unistd::pipe().map_err(|e| Error::Simulator(format!("pipe failed: {e}")))?;
        let (parent_read, child_write) =
            nix::unistd::pipe().map_err(|e| Error::Simulator(format!("pipe failed: {e}")))?;

        let child = Command::new(&executable)
            .arg(child_read.as_raw_fd().to_string())
            .arg(child_write.as_raw_fd().to_string())
            .arg(self.chip_id.to_string())
            .arg(simulator_directory.as_os_str())
            .spawn()
            .map_err(|e| Error::Simulator(format!("failed to spawn child process: {e}")))?;

        // Close the child-side ends in the parent; POLLHUP on the child's
        // read end then means the parent is gone.
        drop(child_read);
        drop(child_write);

        info!(
            chip = self.chip_id,
            pid = child.id(),
            "started simulator child process"
        );
        self.child = Some(child);
        self.write_fd = Some(parent_write);
        self.read_fd = Some(parent_read);
        Ok(())
    }

    /// Send one message and wait for its Response. `payload` carries the
    /// fixed head; `data` (for writes) is appended directly after it in the
    /// stream so large transfers are not staged in an intermediate frame.
    pub fn send_message_with_response(
        &self,
        msg_type: MessageType,
        payload: &[u8],
        data: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let write_fd = self
            .write_fd
            .as_ref()
            .ok_or_else(|| Error::Simulator("child process not running".into()))?
            .as_raw_fd();
        let read_fd = self
            .read_fd
            .as_ref()
            .ok_or_else(|| Error::Simulator("child process not running".into()))?
            .as_raw_fd();

        let total_size = payload.len() + data.map_or(0, <[u8]>::len);
        let header = MessageHeader {
            msg_type,
            payload_size: total_size as u32,
        };
        safe_write(write_fd, &header.to_bytes())?;
        if !payload.is_empty() {
            safe_write(write_fd, payload)?;
        }
        if let Some(data) = data {
            safe_write(write_fd, data)?;
        }

        let mut header_bytes = [0u8; MESSAGE_HEADER_SIZE];
        let n = safe_read(read_fd, &mut header_bytes)?;
        if n != MESSAGE_HEADER_SIZE {
            return Err(Error::Simulator(
                "child process closed the pipe mid-response".into(),
            ));
        }
        let response = MessageHeader::from_bytes(&header_bytes)?;
        if response.msg_type != MessageType::Response {
            return Err(Error::Simulator(format!(
                "expected Response, got {:?}",
                response.msg_type
            )));
        }

        let mut response_payload = vec![0u8; response.payload_size as usize];
        if !response_payload.is_empty() {
            let n = safe_read(read_fd, &mut response_payload)?;
            if n != response_payload.len() {
                return Err(Error::Simulator(
                    "child process closed the pipe mid-response".into(),
                ));
            }
        }
        Ok(response_payload)
    }

    /// Ask the child to exit, then reap it.
    pub fn stop_child_process(&mut self) {
        if self.child.is_none() {
            return;
        }
        if let Err(e) = self.send_message_with_response(MessageType::Exit, &[], None) {
            warn!(chip = self.chip_id, "exit handshake failed: {e}");
        }
        self.write_fd = None;
        self.read_fd = None;
        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) => info!(chip = self.chip_id, %status, "child process exited"),
                Err(e) => warn!(chip = self.chip_id, "failed to reap child process: {e}"),
            }
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.stop_child_process();
    }
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("chip_id", &self.chip_id)
            .field("running", &self.is_running())
            .finish()
    }
}
