//! Socket host for the RTL simulator.
//!
//! The RTL simulator runs as its own process and dials in over TCP. The
//! address is negotiated through the environment: the host honors
//! `NNG_SOCKET_LOCAL_PORT` if set, otherwise picks a free port at random,
//! and exports the resulting address as `NNG_SOCKET_ADDR` for the simulator
//! to read. `TT_SIMULATOR_LOCALHOST` forces the hostname to `localhost`.
//! Messages use the same `{type, size, payload}` frames as the pipe
//! transport.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::message::{MessageHeader, MessageType, MESSAGE_HEADER_SIZE};

fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

fn pick_hostname() -> String {
    if std::env::var_os("TT_SIMULATOR_LOCALHOST").is_some() {
        return "localhost".to_string();
    }
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Listens for the simulator process and exchanges framed messages with it.
pub struct SimulationHost {
    listener: TcpListener,
    stream: Option<TcpStream>,
    address: String,
}

impl SimulationHost {
    /// Bind the listening socket and publish its address.
    pub fn init() -> Result<Self> {
        let hostname = pick_hostname();

        let port = match std::env::var("NNG_SOCKET_LOCAL_PORT") {
            Ok(port_str) => {
                let port: u16 = port_str.parse().map_err(|_| {
                    Error::Configuration(format!(
                        "NNG_SOCKET_LOCAL_PORT is not a port number: {port_str:?}"
                    ))
                })?;
                info!(port, "using specified NNG_SOCKET_LOCAL_PORT");
                port
            }
            Err(_) => {
                let mut rng = rand::thread_rng();
                let port = loop {
                    let candidate = rng.gen_range(50000..60000);
                    if is_port_free(candidate) {
                        break candidate;
                    }
                };
                info!(port, "using generated port");
                port
            }
        };

        let address = format!("tcp://{hostname}:{port}");
        if std::env::var_os("NNG_SOCKET_ADDR").is_none() {
            std::env::set_var("NNG_SOCKET_ADDR", &address);
            info!(%address, "generated NNG_SOCKET_ADDR");
        }

        info!(%address, "listening for simulator");
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| Error::Simulator(format!("failed to create listener on {address}: {e}")))?;

        Ok(Self {
            listener,
            stream: None,
            address,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Block until the simulator process connects.
    pub fn start_host(&mut self) -> Result<()> {
        info!("server started, waiting for simulator to connect...");
        let (stream, peer) = self
            .listener
            .accept()
            .map_err(|e| Error::Simulator(format!("failed to accept simulator connection: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::Simulator(format!("failed to configure socket: {e}")))?;
        info!(%peer, "simulator connected");
        self.stream = Some(stream);
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Simulator("simulator not connected".into()))
    }

    /// Send one framed message.
    pub fn send(&mut self, msg_type: MessageType, payload: &[u8]) -> Result<()> {
        debug!(?msg_type, len = payload.len(), "sending message to simulator");
        let header = MessageHeader {
            msg_type,
            payload_size: payload.len() as u32,
        };
        let stream = self.stream()?;
        stream
            .write_all(&header.to_bytes())
            .and_then(|_| stream.write_all(payload))
            .map_err(|e| Error::Simulator(format!("failed to send message to simulator: {e}")))
    }

    /// Receive one framed message, blocking.
    pub fn recv(&mut self) -> Result<(MessageType, Vec<u8>)> {
        let stream = self.stream()?;
        let mut header_bytes = [0u8; MESSAGE_HEADER_SIZE];
        stream
            .read_exact(&mut header_bytes)
            .map_err(|e| Error::Simulator(format!("failed to receive message header: {e}")))?;
        let header = MessageHeader::from_bytes(&header_bytes)?;
        let mut payload = vec![0u8; header.payload_size as usize];
        stream
            .read_exact(&mut payload)
            .map_err(|e| Error::Simulator(format!("failed to receive message payload: {e}")))?;
        Ok((header.msg_type, payload))
    }

    /// Receive with a deadline; `Ok(None)` when nothing arrived in time.
    pub fn try_recv_with_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<(MessageType, Vec<u8>)>> {
        let stream = self.stream()?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| Error::Simulator(format!("failed to set receive timeout: {e}")))?;

        let mut header_bytes = [0u8; MESSAGE_HEADER_SIZE];
        let header = match stream.read_exact(&mut header_bytes) {
            Ok(()) => MessageHeader::from_bytes(&header_bytes)?,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                let _ = stream.set_read_timeout(None);
                return Ok(None);
            }
            Err(e) => {
                let _ = stream.set_read_timeout(None);
                return Err(Error::Simulator(format!(
                    "failed to receive message header: {e}"
                )));
            }
        };

        // Once the header landed, the payload follows; block for it.
        let _ = stream.set_read_timeout(None);
        let mut payload = vec![0u8; header.payload_size as usize];
        stream
            .read_exact(&mut payload)
            .map_err(|e| Error::Simulator(format!("failed to receive message payload: {e}")))?;
        Ok(Some((header.msg_type, payload)))
    }

    /// Send one message and wait for its matching Response payload.
    pub fn exchange(&mut self, msg_type: MessageType, payload: &[u8]) -> Result<Vec<u8>> {
        self.send(msg_type, payload)?;
        let (response_type, response) = self.recv()?;
        if response_type != MessageType::Response {
            return Err(Error::Simulator(format!(
                "expected Response, got {response_type:?}"
            )));
        }
        Ok(response)
    }
}

impl std::fmt::Debug for SimulationHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationHost")
            .field("address", &self.address)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdTcpStream;

    #[test]
    fn frames_cross_a_socket_pair() {
        std::env::remove_var("NNG_SOCKET_LOCAL_PORT");
        let mut host = SimulationHost::init().unwrap();
        let port: u16 = host
            .address()
            .rsplit(':')
            .next()
            .unwrap()
            .parse()
            .unwrap();

        let client = std::thread::spawn(move || {
            let mut stream = StdTcpStream::connect(("127.0.0.1", port)).unwrap();
            // Echo one frame back as a Response.
            let mut header_bytes = [0u8; MESSAGE_HEADER_SIZE];
            stream.read_exact(&mut header_bytes).unwrap();
            let header = MessageHeader::from_bytes(&header_bytes).unwrap();
            let mut payload = vec![0u8; header.payload_size as usize];
            stream.read_exact(&mut payload).unwrap();

            let response = MessageHeader {
                msg_type: MessageType::Response,
                payload_size: payload.len() as u32,
            };
            stream.write_all(&response.to_bytes()).unwrap();
            stream.write_all(&payload).unwrap();
            payload
        });

        host.start_host().unwrap();
        let response = host
            .exchange(MessageType::WriteToDevice, &[1, 2, 3, 4])
            .unwrap();
        let sent = client.join().unwrap();
        assert_eq!(response, sent);
        assert_eq!(response, vec![1, 2, 3, 4]);
    }
}
