//! Frame format for simulator IPC.
//!
//! Every message is `{type: u32, payload_size: u32, payload}`; each
//! non-Response message is matched 1:1 by a Response. The layout must be
//! identical on both sides of the pipe.

use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::types::XyPair;

pub const MESSAGE_HEADER_SIZE: usize = 8;

/// Message types for inter-process communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    StartDevice = 1,
    CloseDevice = 2,
    WriteToDevice = 3,
    ReadFromDevice = 4,
    SendTensixRiscReset = 5,
    AssertRiscReset = 6,
    DeassertRiscReset = 7,
    ConnectEthLinks = 8,
    Exit = 9,
    Response = 10,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => MessageType::StartDevice,
            2 => MessageType::CloseDevice,
            3 => MessageType::WriteToDevice,
            4 => MessageType::ReadFromDevice,
            5 => MessageType::SendTensixRiscReset,
            6 => MessageType::AssertRiscReset,
            7 => MessageType::DeassertRiscReset,
            8 => MessageType::ConnectEthLinks,
            9 => MessageType::Exit,
            10 => MessageType::Response,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub payload_size: u32,
}

impl MessageHeader {
    pub fn to_bytes(self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut bytes = [0u8; MESSAGE_HEADER_SIZE];
        bytes[..4].copy_from_slice(&(self.msg_type as u32).to_le_bytes());
        bytes[4..].copy_from_slice(&self.payload_size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; MESSAGE_HEADER_SIZE]) -> Result<Self> {
        let raw_type = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        let msg_type = MessageType::from_u32(raw_type)
            .ok_or_else(|| Error::Simulator(format!("unknown message type {raw_type}")))?;
        Ok(Self {
            msg_type,
            payload_size: u32::from_le_bytes(bytes[4..].try_into().unwrap()),
        })
    }
}

/// Fixed-size head of a write message; the raw data bytes follow it directly
/// in the stream, so large transfers incur no framing copy.
#[derive(Debug, Clone, Copy)]
pub struct WriteMessageData {
    pub core: XyPair,
    pub l1_dest: u64,
    pub size: u32,
}

pub const WRITE_MESSAGE_DATA_SIZE: usize = 20;

impl WriteMessageData {
    pub fn to_bytes(self) -> [u8; WRITE_MESSAGE_DATA_SIZE] {
        let mut bytes = [0u8; WRITE_MESSAGE_DATA_SIZE];
        bytes[..4].copy_from_slice(&self.core.x.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.core.y.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.l1_dest.to_le_bytes());
        bytes[16..].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < WRITE_MESSAGE_DATA_SIZE {
            return Err(Error::Simulator("short write message".into()));
        }
        Ok(Self {
            core: XyPair::new(
                u32::from_le_bytes(bytes[..4].try_into().unwrap()),
                u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            ),
            l1_dest: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            size: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        })
    }
}

/// Payload of a read request.
#[derive(Debug, Clone, Copy)]
pub struct ReadMessageData {
    pub core: XyPair,
    pub l1_src: u64,
    pub size: u32,
}

pub const READ_MESSAGE_DATA_SIZE: usize = 20;

impl ReadMessageData {
    pub fn to_bytes(self) -> [u8; READ_MESSAGE_DATA_SIZE] {
        let mut bytes = [0u8; READ_MESSAGE_DATA_SIZE];
        bytes[..4].copy_from_slice(&self.core.x.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.core.y.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.l1_src.to_le_bytes());
        bytes[16..].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < READ_MESSAGE_DATA_SIZE {
            return Err(Error::Simulator("short read message".into()));
        }
        Ok(Self {
            core: XyPair::new(
                u32::from_le_bytes(bytes[..4].try_into().unwrap()),
                u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            ),
            l1_src: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            size: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        })
    }
}

/// Payload of the reset messages: a core plus the selector/register word and
/// the staggered-start flag where applicable.
#[derive(Debug, Clone, Copy)]
pub struct ResetMessageData {
    pub core: XyPair,
    pub value: u64,
    pub staggered_start: bool,
}

pub const RESET_MESSAGE_DATA_SIZE: usize = 20;

impl ResetMessageData {
    pub fn to_bytes(self) -> [u8; RESET_MESSAGE_DATA_SIZE] {
        let mut bytes = [0u8; RESET_MESSAGE_DATA_SIZE];
        bytes[..4].copy_from_slice(&self.core.x.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.core.y.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.value.to_le_bytes());
        bytes[16..20].copy_from_slice(&(self.staggered_start as u32).to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RESET_MESSAGE_DATA_SIZE {
            return Err(Error::Simulator("short reset message".into()));
        }
        Ok(Self {
            core: XyPair::new(
                u32::from_le_bytes(bytes[..4].try_into().unwrap()),
                u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            ),
            value: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            staggered_start: u32::from_le_bytes(bytes[16..20].try_into().unwrap()) != 0,
        })
    }
}

/// Read exactly `buf.len()` bytes, riding out partial reads. Returns the
/// byte count actually read; short only when the peer closed the stream.
pub fn safe_read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let mut total_read = 0;
    while total_read < buf.len() {
        match nix::unistd::read(fd, &mut buf[total_read..]) {
            Ok(0) => return Ok(total_read),
            Ok(n) => total_read += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(Error::Simulator(format!("read failed: {e}"))),
        }
    }
    Ok(total_read)
}

/// Write all of `buf`, riding out partial writes.
pub fn safe_write(fd: RawFd, buf: &[u8]) -> Result<()> {
    let mut total_written = 0;
    while total_written < buf.len() {
        match nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, &buf[total_written..]) {
            Ok(n) => total_written += n,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(Error::Simulator(format!("write failed: {e}"))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = MessageHeader {
            msg_type: MessageType::WriteToDevice,
            payload_size: 1234,
        };
        let decoded = MessageHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::WriteToDevice);
        assert_eq!(decoded.payload_size, 1234);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = [0u8; MESSAGE_HEADER_SIZE];
        bytes[..4].copy_from_slice(&11u32.to_le_bytes());
        assert!(MessageHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn write_payload_round_trips() {
        let data = WriteMessageData {
            core: XyPair::new(3, 7),
            l1_dest: 0x1_0000,
            size: 4096,
        };
        let decoded = WriteMessageData::from_bytes(&data.to_bytes()).unwrap();
        assert_eq!(decoded.core, data.core);
        assert_eq!(decoded.l1_dest, data.l1_dest);
        assert_eq!(decoded.size, data.size);
    }

    #[test]
    fn safe_read_and_write_handle_partial_transfers() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        use std::os::fd::AsRawFd;
        let payload: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        let writer_payload = payload.clone();
        let write_fd = write_end.as_raw_fd();
        let writer = std::thread::spawn(move || {
            safe_write(write_fd, &writer_payload).unwrap();
            drop(write_end);
        });
        let mut received = vec![0u8; payload.len()];
        let n = safe_read(read_end.as_raw_fd(), &mut received).unwrap();
        writer.join().unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(received, payload);
    }
}
