//! Driver error taxonomy
//!
//! Errors are grouped by kind rather than by origin: a caller that sees
//! [`Error::HardwareHang`] needs a board reset no matter which transport
//! produced it, while [`Error::Configuration`] is always fatal at open time.

use std::time::Duration;

/// Errors surfaced by the driver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing device node, unsupported kernel driver version, malformed
    /// environment configuration. Fatal; raised at open.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An ioctl or other kernel transaction failed. Carries the errno text.
    #[error("{op} failed: {source}")]
    Kmd {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// TLB windows, DMA buffers or hugepages could not be allocated even at
    /// the smallest legal size.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A read returned the all-ones canary and the confirmatory ARC scratch
    /// probe also read all-ones. The board needs a reset.
    #[error("read 0xffffffff from PCIe: you should reset the board")]
    HardwareHang,

    /// A bounded wait elapsed without the hardware responding.
    #[error("timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// Caller-supplied argument violated an interface precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure talking to a simulator process or library.
    #[error("simulator error: {0}")]
    Simulator(String),

    /// Failure on the JTAG transport.
    #[error("jtag error: {0}")]
    Jtag(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap the current errno under the name of the kernel operation that
    /// produced it.
    pub(crate) fn last_kmd_error(op: &'static str) -> Self {
        Error::Kmd {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
