//! Unix-socket emulation of a chip-to-chip Ethernet link.
//!
//! Each link is one socket pair. Both endpoints derive the same abstract
//! socket name from the link tuple, and the ordering of the tuple decides
//! which side binds as the server, so no out-of-band coordination is needed.

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    accept, bind, connect, getsockopt, listen, setsockopt, socket, sockopt, AddressFamily,
    Backlog, SockFlag, SockType, UnixAddr,
};

use crate::error::{Error, Result};

/// Socket buffer size on both ends of a link.
const LINK_BUFFER_SIZE: usize = 5 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Derive the deterministic link name and the server role for one endpoint.
/// The endpoint with the smaller `(chip, channel)` tuple serves.
pub fn link_address(
    unique_chip_id: u64,
    channel: u32,
    remote_chip_id: u64,
    remote_channel: u32,
) -> (String, bool) {
    let is_server = (unique_chip_id, channel) < (remote_chip_id, remote_channel);
    if is_server {
        (
            format!("{unique_chip_id}_{channel}_{remote_chip_id}_{remote_channel}"),
            true,
        )
    } else {
        (
            format!("{remote_chip_id}_{remote_channel}_{unique_chip_id}_{channel}"),
            false,
        )
    }
}

/// One endpoint of an emulated Ethernet link.
#[derive(Debug)]
pub struct EthConnection {
    client_fd: Option<OwnedFd>,
    server_fd: Option<OwnedFd>,
    state: ConnectionState,
    is_server: bool,
    addr: Option<UnixAddr>,
}

impl Default for EthConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl EthConnection {
    pub fn new() -> Self {
        Self {
            client_fd: None,
            server_fd: None,
            state: ConnectionState::Disconnected,
            is_server: false,
            addr: None,
        }
    }

    /// Create the endpoint's socket. Abstract names keep the filesystem
    /// clean; the server side binds and listens, the client side only
    /// prepares its socket.
    pub fn create_socket(&mut self, address: &str, is_server: bool) -> Result<()> {
        if self.state != ConnectionState::Disconnected || self.addr.is_some() {
            return Err(Error::Simulator("eth connection already configured".into()));
        }
        if address.is_empty() {
            return Err(Error::Simulator("eth link address is empty".into()));
        }

        let addr = UnixAddr::new_abstract(address.as_bytes())
            .map_err(|e| Error::Simulator(format!("bad eth link address {address:?}: {e}")))?;

        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|e| Error::Simulator(format!("socket failed to create: {e}")))?;

        self.is_server = is_server;
        self.addr = Some(addr);

        if !is_server {
            setsockopt(&fd, sockopt::SndBuf, &LINK_BUFFER_SIZE)
                .map_err(|e| Error::Simulator(format!("failed to set send buffer size: {e}")))?;
            setsockopt(&fd, sockopt::RcvBuf, &LINK_BUFFER_SIZE)
                .map_err(|e| Error::Simulator(format!("failed to set receive buffer size: {e}")))?;
            self.client_fd = Some(fd);
            return Ok(());
        }

        bind(fd.as_raw_fd(), &addr)
            .map_err(|e| Error::Simulator(format!("server socket failed to bind: {e}")))?;
        // Backlog of 1: each link carries exactly one connection.
        listen(&fd, Backlog::new(1).unwrap())
            .map_err(|e| Error::Simulator(format!("server socket failed to listen: {e}")))?;
        self.server_fd = Some(fd);
        Ok(())
    }

    /// Drive the non-blocking connection forward. Returns `true` once the
    /// link is up; call again later while it returns `false`.
    pub fn connect(&mut self) -> Result<bool> {
        if self.state == ConnectionState::Connected {
            return Ok(true);
        }

        if self.is_server {
            let Some(server_fd) = self.server_fd.as_ref() else {
                return Err(Error::Simulator("server socket not created".into()));
            };
            match accept(server_fd.as_raw_fd()) {
                Ok(client) => {
                    // SAFETY: accept returned a fresh descriptor we own.
                    let client = unsafe { OwnedFd::from_raw_fd(client) };
                    setsockopt(&client, sockopt::SndBuf, &LINK_BUFFER_SIZE).map_err(|e| {
                        Error::Simulator(format!("failed to set send buffer size: {e}"))
                    })?;
                    setsockopt(&client, sockopt::RcvBuf, &LINK_BUFFER_SIZE).map_err(|e| {
                        Error::Simulator(format!("failed to set receive buffer size: {e}"))
                    })?;
                    self.client_fd = Some(client);
                    self.state = ConnectionState::Connected;
                    Ok(true)
                }
                Err(nix::errno::Errno::EAGAIN) => Ok(false),
                Err(e) => Err(Error::Simulator(format!(
                    "server socket failed to accept: {e}"
                ))),
            }
        } else {
            let Some(client_fd) = self.client_fd.as_ref() else {
                return Ok(false);
            };
            if self.state == ConnectionState::Connecting {
                // Wait for the in-flight connect to resolve.
                let mut fds = [PollFd::new(client_fd.as_fd(), PollFlags::POLLOUT)];
                let ready = poll(&mut fds, PollTimeout::ZERO)
                    .map_err(|e| Error::Simulator(format!("client socket poll failed: {e}")))?;
                if ready == 0 {
                    return Ok(false);
                }
                let err = getsockopt(client_fd, sockopt::SocketError)
                    .map_err(|e| Error::Simulator(format!("failed to get socket error: {e}")))?;
                if err != 0 {
                    return Err(Error::Simulator(format!(
                        "client socket connection failed: {}",
                        std::io::Error::from_raw_os_error(err)
                    )));
                }
                self.state = ConnectionState::Connected;
                return Ok(true);
            }

            match connect(client_fd.as_raw_fd(), self.addr.as_ref().unwrap()) {
                Ok(()) => {
                    self.state = ConnectionState::Connected;
                    Ok(true)
                }
                Err(nix::errno::Errno::EINPROGRESS) => {
                    self.state = ConnectionState::Connecting;
                    Ok(false)
                }
                // The server side has not bound yet; retry later.
                Err(nix::errno::Errno::ECONNREFUSED) => Ok(false),
                Err(e) => Err(Error::Simulator(format!(
                    "client socket failed to initiate connection: {e}"
                ))),
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.client_fd = None;
        self.server_fd = None;
        self.state = ConnectionState::Disconnected;
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// The `(write_fd, read_fd)` pair handed to the simulator library.
    pub fn fds(&self) -> Option<(RawFd, RawFd)> {
        self.client_fd
            .as_ref()
            .map(|fd| (fd.as_raw_fd(), fd.as_raw_fd()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_name_is_symmetric() {
        let (name_a, server_a) = link_address(1, 0, 2, 3);
        let (name_b, server_b) = link_address(2, 3, 1, 0);
        assert_eq!(name_a, name_b);
        assert!(server_a);
        assert!(!server_b);
        assert_eq!(name_a, "1_0_2_3");
    }

    #[test]
    fn channel_breaks_chip_id_ties() {
        let (_, server_low) = link_address(5, 1, 5, 2);
        let (_, server_high) = link_address(5, 2, 5, 1);
        assert!(server_low);
        assert!(!server_high);
    }

    #[test]
    fn endpoints_connect_through_abstract_socket() {
        let name = format!("umd_eth_test_{}", std::process::id());
        let mut server = EthConnection::new();
        server.create_socket(&name, true).unwrap();
        let mut client = EthConnection::new();
        client.create_socket(&name, false).unwrap();

        // Drive both state machines until they meet.
        let mut connected = (false, false);
        for _ in 0..1000 {
            if !connected.1 {
                connected.1 = client.connect().unwrap();
            }
            if !connected.0 {
                connected.0 = server.connect().unwrap();
            }
            if connected == (true, true) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(server.is_connected());
        assert!(client.is_connected());
        assert!(server.fds().is_some());
    }
}
