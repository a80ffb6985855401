//! In-process TTSim chip: the simulator is a shared library.
//!
//! Multiple simulated chips in one process must not alias the library's
//! static state, so each chip dlopens a private, sealed in-memory copy of
//! the library instead of the file on disk.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use nix::fcntl::{fcntl, FcntlArg, SealFlag};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use tracing::{debug, info};

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::types::{ChipId, RiscType, TensixSoftResetOptions, XyPair};

use super::eth_link::{link_address, EthConnection};

/// PCI vendor id the simulator must report.
const SIM_VENDOR_ID: u32 = 0x1E52;

type InitFn = unsafe extern "C" fn();
type ExitFn = unsafe extern "C" fn();
type PciConfigRd32Fn = unsafe extern "C" fn(u32, u32) -> u32;
type PciMemRdFn = unsafe extern "C" fn(u64, *mut u8, u32);
type PciMemWrFn = unsafe extern "C" fn(u64, *const u8, u32);
type TileRdFn = unsafe extern "C" fn(u32, u32, u64, *mut u8, u32);
type TileWrFn = unsafe extern "C" fn(u32, u32, u64, *const u8, u32);
type ClockFn = unsafe extern "C" fn(u32);
type ConfigureEthLinkFn = unsafe extern "C" fn(u32, i32, i32);

struct TtSimLibrary {
    _lib: Library,
    init: InitFn,
    exit: ExitFn,
    pci_config_rd32: PciConfigRd32Fn,
    pci_mem_rd_bytes: PciMemRdFn,
    pci_mem_wr_bytes: PciMemWrFn,
    tile_rd_bytes: TileRdFn,
    tile_wr_bytes: TileWrFn,
    clock: ClockFn,
    configure_eth_link: ConfigureEthLinkFn,
}

macro_rules! resolve {
    ($lib:expr, $name:literal, $ty:ty) => {{
        let symbol: Symbol<$ty> = unsafe { $lib.get($name) }.map_err(|e| {
            Error::Simulator(format!("failed to find symbol {:?}: {e}", $name))
        })?;
        *symbol
    }};
}

impl TtSimLibrary {
    fn load(path: &Path) -> Result<Self> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| Error::Simulator(format!("failed to dlopen simulator library: {e}")))?;
        Ok(Self {
            init: resolve!(lib, b"libttsim_init", InitFn),
            exit: resolve!(lib, b"libttsim_exit", ExitFn),
            pci_config_rd32: resolve!(lib, b"libttsim_pci_config_rd32", PciConfigRd32Fn),
            pci_mem_rd_bytes: resolve!(lib, b"libttsim_pci_mem_rd_bytes", PciMemRdFn),
            pci_mem_wr_bytes: resolve!(lib, b"libttsim_pci_mem_wr_bytes", PciMemWrFn),
            tile_rd_bytes: resolve!(lib, b"libttsim_tile_rd_bytes", TileRdFn),
            tile_wr_bytes: resolve!(lib, b"libttsim_tile_wr_bytes", TileWrFn),
            clock: resolve!(lib, b"libttsim_clock", ClockFn),
            configure_eth_link: resolve!(lib, b"libttsim_configure_eth_link", ConfigureEthLinkFn),
            _lib: lib,
        })
    }
}

/// Seal a private copy of the library in an anonymous file and return the
/// fd. dlopening through `/proc/self/fd` then binds this chip to its own
/// copy of the library's statics.
fn duplicate_simulator_binary(simulator_path: &Path, chip_id: ChipId) -> Result<OwnedFd> {
    let stem = simulator_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("libttsim");
    let extension = simulator_path
        .extension()
        .and_then(|s| s.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let memfd_name = format!("{stem}_chip{chip_id}{extension}");

    let memfd = memfd_create(
        &std::ffi::CString::new(memfd_name).unwrap(),
        MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
    )
    .map_err(|e| Error::Simulator(format!("failed to create memfd: {e}")))?;

    let mut src = File::open(simulator_path).map_err(|e| {
        Error::Simulator(format!(
            "failed to open simulator file for reading: {} - {e}",
            simulator_path.display()
        ))
    })?;
    let mut dst = File::from(memfd);
    std::io::copy(&mut src, &mut dst)
        .map_err(|e| Error::Simulator(format!("failed to copy simulator library: {e}")))?;
    let memfd = OwnedFd::from(dst);

    fcntl(
        memfd.as_raw_fd(),
        FcntlArg::F_ADD_SEALS(
            SealFlag::F_SEAL_SHRINK
                | SealFlag::F_SEAL_GROW
                | SealFlag::F_SEAL_WRITE
                | SealFlag::F_SEAL_SEAL,
        ),
    )
    .map_err(|e| Error::Simulator(format!("failed to seal memfd: {e}")))?;

    Ok(memfd)
}

/// One simulated chip hosted in this process.
pub struct TtSimChip {
    chip_id: ChipId,
    arch: Arch,
    lib: TtSimLibrary,
    // Keeps the sealed library copy alive for the lifetime of the dlopen.
    _memfd: Option<OwnedFd>,
    pci_device_id: u32,
    eth_connections: HashMap<u32, EthConnection>,
}

impl TtSimChip {
    /// Load the simulator library at `simulator_path` for `chip_id`. With
    /// `duplicate` set, the chip gets a private sealed copy; pass `false`
    /// only when the process hosts a single chip.
    pub fn new(
        simulator_path: &Path,
        arch: Arch,
        chip_id: ChipId,
        duplicate: bool,
    ) -> Result<Self> {
        if !simulator_path.exists() {
            return Err(Error::Simulator(format!(
                "simulator binary not found at: {}",
                simulator_path.display()
            )));
        }
        let (memfd, load_path) = if duplicate {
            let memfd = duplicate_simulator_binary(simulator_path, chip_id)?;
            let path = PathBuf::from(format!("/proc/self/fd/{}", memfd.as_raw_fd()));
            (Some(memfd), path)
        } else {
            (None, simulator_path.to_path_buf())
        };
        let lib = TtSimLibrary::load(&load_path)?;
        Ok(Self {
            chip_id,
            arch,
            lib,
            _memfd: memfd,
            pci_device_id: 0,
            eth_connections: HashMap::new(),
        })
    }

    pub fn chip_id(&self) -> ChipId {
        self.chip_id
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn start_device(&mut self) -> Result<()> {
        unsafe { (self.lib.init)() };

        // First 32 bits of PCI config space: device id | vendor id.
        let pci_id = unsafe { (self.lib.pci_config_rd32)(0, 0) };
        let vendor_id = pci_id & 0xFFFF;
        self.pci_device_id = pci_id >> 16;
        info!(
            vendor_id = format_args!("{vendor_id:#x}"),
            device_id = format_args!("{:#x}", self.pci_device_id),
            "simulator reported PCI identity"
        );
        if vendor_id != SIM_VENDOR_ID {
            return Err(Error::Simulator(format!(
                "unexpected PCI vendor ID {vendor_id:#x}"
            )));
        }
        Ok(())
    }

    pub fn close_device(&mut self) {
        debug!(chip = self.chip_id, "sending exit signal to simulator");
        unsafe { (self.lib.exit)() };
    }

    pub fn write_to_device(&self, translated_core: XyPair, src: &[u8], l1_dest: u64) {
        debug!(
            chip = self.chip_id,
            core = %translated_core,
            addr = format_args!("{l1_dest:#x}"),
            len = src.len(),
            "simulator write"
        );
        unsafe {
            (self.lib.tile_wr_bytes)(
                translated_core.x,
                translated_core.y,
                l1_dest,
                src.as_ptr(),
                src.len() as u32,
            )
        };
    }

    pub fn read_from_device(&self, translated_core: XyPair, dest: &mut [u8], l1_src: u64) {
        unsafe {
            (self.lib.tile_rd_bytes)(
                translated_core.x,
                translated_core.y,
                l1_src,
                dest.as_mut_ptr(),
                dest.len() as u32,
            )
        };
    }

    pub fn pci_mem_write(&self, paddr: u64, data: &[u8]) {
        unsafe { (self.lib.pci_mem_wr_bytes)(paddr, data.as_ptr(), data.len() as u32) };
    }

    pub fn pci_mem_read(&self, paddr: u64, data: &mut [u8]) {
        unsafe { (self.lib.pci_mem_rd_bytes)(paddr, data.as_mut_ptr(), data.len() as u32) };
    }

    /// Advance the simulator clock.
    pub fn clock(&self, cycles: u32) {
        unsafe { (self.lib.clock)(cycles) };
    }

    pub fn send_tensix_risc_reset(
        &self,
        translated_core: XyPair,
        soft_resets: TensixSoftResetOptions,
    ) {
        let soft_reset_addr = self.arch.tensix_soft_reset_addr();
        let value = soft_resets.bits();
        self.write_to_device(translated_core, &value.to_le_bytes(), soft_reset_addr);
    }

    pub fn assert_risc_reset(&self, translated_core: XyPair, selected: RiscType) -> Result<()> {
        let soft_reset_addr = self.arch.tensix_soft_reset_addr();
        let update = self.arch.get_soft_reset_reg_value(selected)?;
        let mut value = [0u8; 4];
        self.read_from_device(translated_core, &mut value, soft_reset_addr);
        let value = u32::from_le_bytes(value) | update;
        self.write_to_device(translated_core, &value.to_le_bytes(), soft_reset_addr);
        Ok(())
    }

    pub fn deassert_risc_reset(
        &self,
        translated_core: XyPair,
        selected: RiscType,
        _staggered_start: bool,
    ) -> Result<()> {
        let soft_reset_addr = self.arch.tensix_soft_reset_addr();
        let update = self.arch.get_soft_reset_reg_value(selected)?;
        let mut value = [0u8; 4];
        self.read_from_device(translated_core, &mut value, soft_reset_addr);
        let value = u32::from_le_bytes(value) & !update;
        self.write_to_device(translated_core, &value.to_le_bytes(), soft_reset_addr);
        Ok(())
    }

    /// Register a link to a peer chip on `channel`. Call once per link,
    /// then drive [`connect_eth_links`](Self::connect_eth_links).
    pub fn add_eth_connection(
        &mut self,
        channel: u32,
        unique_chip_id: u64,
        remote_chip_id: u64,
        remote_channel: u32,
    ) -> Result<()> {
        let (address, is_server) =
            link_address(unique_chip_id, channel, remote_chip_id, remote_channel);
        let mut connection = EthConnection::new();
        connection.create_socket(&address, is_server)?;
        self.eth_connections.insert(channel, connection);
        Ok(())
    }

    /// Try to bring up every registered link. Returns `true` once all are
    /// connected and handed to the simulator.
    pub fn connect_eth_links(&mut self) -> Result<bool> {
        let mut all_connected = true;
        for (&channel, connection) in &mut self.eth_connections {
            if connection.is_connected() {
                continue;
            }
            if connection.connect()? {
                let (write_fd, read_fd) = connection.fds().unwrap();
                unsafe { (self.lib.configure_eth_link)(channel, write_fd, read_fd) };
            } else {
                all_connected = false;
            }
        }
        Ok(all_connected)
    }
}

impl Drop for TtSimChip {
    fn drop(&mut self) {
        self.eth_connections.clear();
    }
}

impl std::fmt::Debug for TtSimChip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtSimChip")
            .field("chip_id", &self.chip_id)
            .field("arch", &self.arch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sealed_copy_matches_source_and_refuses_resizing() {
        let mut src = tempfile::NamedTempFile::new().unwrap();
        src.write_all(b"not really a shared library").unwrap();
        src.flush().unwrap();

        let memfd = duplicate_simulator_binary(src.path(), 3).unwrap();

        let copied = std::fs::read(format!("/proc/self/fd/{}", memfd.as_raw_fd())).unwrap();
        assert_eq!(copied, b"not really a shared library");

        // The seals must reject any attempt to grow or shrink the copy.
        assert!(nix::unistd::ftruncate(&memfd, 0).is_err());
        assert!(nix::unistd::ftruncate(&memfd, 4096).is_err());
    }

    #[test]
    fn missing_simulator_library_is_reported() {
        let err = TtSimChip::new(Path::new("/nonexistent/libttsim.so"), Arch::Wormhole, 0, true)
            .unwrap_err();
        assert!(err.to_string().contains("simulator binary not found"));
    }
}
