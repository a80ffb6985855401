//! User-mode driver for Tenstorrent AI accelerator fabrics.
//!
//! Host processes link against this crate to open accelerator chips over
//! PCIe (primary), JTAG (diagnostic) or an in-process/child-process
//! simulator, and to run the low-level operations compute stacks are built
//! on: mapping device memory, bulk transfers to tiles and DRAM, interconnect
//! routing for multi-chip clusters, core resets, and cross-process
//! serialization of the shared hardware.
//!
//! The [`chip::Chip`] façade is the stable entry point; everything below it
//! (TLB windows, sysmem channels, transport protocols, the remote Ethernet
//! tunnel, simulator hosts) is public for tools that need the lower layers.

pub mod arch;
pub mod chip;
pub mod chip_helpers;
pub mod error;
pub mod jtag;
pub mod kmd;
pub mod mmio;
pub mod pcie;
pub mod protocol;
pub mod remote;
pub mod simulation;
pub mod sync;
pub mod types;
pub mod utils;

use std::sync::atomic::{AtomicBool, Ordering};

pub use arch::Arch;
pub use chip::{Chip, LocalChip, RemoteChip, SimChip};
pub use error::{Error, Result};
pub use types::{ChipId, CoordSystem, CoreCoord, CoreType, EthCoord, RiscType, XyPair};

/// Process-wide NOC selection. All window routing and JTAG traffic follows
/// it; flip it before opening any chip.
static USE_NOC1: AtomicBool = AtomicBool::new(false);

/// Route all traffic over NOC1 instead of NOC0.
pub fn set_use_noc1(enable: bool) {
    USE_NOC1.store(enable, Ordering::Relaxed);
}

pub(crate) fn use_noc1() -> bool {
    USE_NOC1.load(Ordering::Relaxed)
}
