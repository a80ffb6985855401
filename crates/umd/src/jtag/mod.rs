//! JTAG access through a J-Link shared library.
//!
//! The diagnostic transport: orders of magnitude slower than PCIe, but
//! reaches a chip whose PCIe link is down. All traffic funnels through a
//! vendor library loaded at runtime.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use libloading::{Library, Symbol};
use tracing::warn;

use crate::arch::Arch;
use crate::error::{Error, Result};

const WORMHOLE_ID: u32 = 0x138A5;
const WORMHOLE_ARC_EFUSE_BOX1: u32 = 0x8004_2000;
const WORMHOLE_ARC_EFUSE_HARVESTING: u32 = WORMHOLE_ARC_EFUSE_BOX1 + 0x25C;
const WORMHOLE_ARC_SCRATCH6: u32 = 0x1FF3_0078;

/// Default location of the J-Link wrapper library, next to the executable.
pub fn default_library_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lib_tt_jtag.so")
}

type EnumerateFn = unsafe extern "C" fn(*mut u32, u32) -> u32;
type OpenBySerialFn = unsafe extern "C" fn(u32) -> i32;
type CloseFn = unsafe extern "C" fn() -> i32;
type ReadIdFn = unsafe extern "C" fn() -> u32;
type ReadAxiFn = unsafe extern "C" fn(u32) -> u32;
type WriteAxiFn = unsafe extern "C" fn(u32, u32);
type Read32Fn = unsafe extern "C" fn(u8, u8, u64, u8) -> u32;
type Write32Fn = unsafe extern "C" fn(u8, u8, u64, u32, u8);

struct JtagLibrary {
    // Keeps the symbols below alive; never referenced after loading.
    _lib: Library,
    enumerate_jlink: EnumerateFn,
    open_jlink_by_serial: OpenBySerialFn,
    close_jlink: CloseFn,
    read_id: ReadIdFn,
    read_axi: ReadAxiFn,
    write_axi: WriteAxiFn,
    read32: Read32Fn,
    write32: Write32Fn,
}

macro_rules! resolve {
    ($lib:expr, $name:literal, $ty:ty) => {{
        let symbol: Symbol<$ty> = unsafe { $lib.get($name) }
            .map_err(|e| Error::Jtag(format!("failed to find symbol {:?}: {e}", $name)))?;
        *symbol
    }};
}

impl JtagLibrary {
    fn load(path: &Path) -> Result<Self> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| Error::Jtag(format!("failed to load {}: {e}", path.display())))?;
        Ok(Self {
            enumerate_jlink: resolve!(lib, b"tt_enumerate_jlink", EnumerateFn),
            open_jlink_by_serial: resolve!(lib, b"tt_open_jlink_by_serial_wrapper", OpenBySerialFn),
            close_jlink: resolve!(lib, b"tt_close_jlink", CloseFn),
            read_id: resolve!(lib, b"tt_read_id", ReadIdFn),
            read_axi: resolve!(lib, b"tt_read_axi", ReadAxiFn),
            write_axi: resolve!(lib, b"tt_write_axi", WriteAxiFn),
            read32: resolve!(lib, b"tt_read32", Read32Fn),
            write32: resolve!(lib, b"tt_write32", Write32Fn),
            _lib: lib,
        })
    }
}

/// All J-Link probes with a supported chip behind them. The vendor library
/// can only talk to one probe at a time, so every operation selects its
/// device first; the inner mutex makes select-then-operate atomic.
pub struct JtagDevice {
    inner: Mutex<JtagDeviceInner>,
}

struct JtagDeviceInner {
    lib: JtagLibrary,
    jlink_devices: Vec<u32>,
    efuse_harvesting: Vec<u32>,
    current_device: Option<usize>,
}

impl JtagDevice {
    /// Probe every J-Link, keep those fronting a supported chip, and read
    /// each chip's efuse harvesting mask.
    pub fn create(library_path: &Path) -> Result<Self> {
        let lib = JtagLibrary::load(library_path)?;

        unsafe { (lib.close_jlink)() };

        let mut serials = vec![0u32; 64];
        let count = unsafe { (lib.enumerate_jlink)(serials.as_mut_ptr(), serials.len() as u32) };
        serials.truncate(count as usize);
        if serials.is_empty() {
            return Err(Error::Jtag("there are no devices".into()));
        }

        let mut jlink_devices = Vec::new();
        let mut efuse_harvesting = Vec::new();
        for serial in serials {
            let status = unsafe { (lib.open_jlink_by_serial)(serial) };
            if status != 0 {
                continue;
            }
            let id = unsafe { (lib.read_id)() };
            if id != WORMHOLE_ID {
                warn!(id = format_args!("{id:#x}"), "only supporting Wormhole over JTAG for now");
                unsafe { (lib.close_jlink)() };
                continue;
            }

            jlink_devices.push(serial);

            let efuse = unsafe { (lib.read_axi)(WORMHOLE_ARC_EFUSE_HARVESTING) };
            let bad_mem_bits = efuse & 0x3FF;
            let bad_logic_bits = (efuse >> 10) & 0x3FF;
            // Each set bit indicates a bad row.
            efuse_harvesting.push(bad_mem_bits | bad_logic_bits);

            unsafe { (lib.close_jlink)() };
        }

        if jlink_devices.is_empty() {
            return Err(Error::Jtag("there are no supported devices".into()));
        }

        Ok(Self {
            inner: Mutex::new(JtagDeviceInner {
                lib,
                jlink_devices,
                efuse_harvesting,
                current_device: None,
            }),
        })
    }

    pub fn get_device_cnt(&self) -> usize {
        self.lock().jlink_devices.len()
    }

    pub fn get_jtag_arch(&self, _chip_id: u8) -> Arch {
        // Only Wormhole probes survive enumeration.
        Arch::Wormhole
    }

    pub fn get_efuse_harvesting(&self, chip_id: u8) -> Result<u32> {
        self.lock()
            .efuse_harvesting
            .get(chip_id as usize)
            .copied()
            .ok_or_else(|| Error::Jtag(format!("no JTAG device with chip id {chip_id}")))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JtagDeviceInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn close_jlink(&self, chip_id: u8) -> Option<i32> {
        let mut inner = self.lock();
        if inner.current_device == Some(chip_id as usize) {
            inner.current_device = None;
            return Some(unsafe { (inner.lib.close_jlink)() });
        }
        None
    }

    pub fn read32_axi(&self, chip_id: u8, address: u32) -> Result<u32> {
        let inner = self.select(chip_id)?;
        Ok(unsafe { (inner.lib.read_axi)(address) })
    }

    pub fn write32_axi(&self, chip_id: u8, address: u32, data: u32) -> Result<()> {
        let inner = self.select(chip_id)?;
        unsafe { (inner.lib.write_axi)(address, data) };
        Ok(())
    }

    pub fn read32(&self, chip_id: u8, noc_x: u8, noc_y: u8, address: u64, noc_id: u8) -> Result<u32> {
        let inner = self.select(chip_id)?;
        Ok(unsafe { (inner.lib.read32)(noc_x, noc_y, address, noc_id) })
    }

    pub fn write32(
        &self,
        chip_id: u8,
        noc_x: u8,
        noc_y: u8,
        address: u64,
        data: u32,
        noc_id: u8,
    ) -> Result<()> {
        let inner = self.select(chip_id)?;
        unsafe { (inner.lib.write32)(noc_x, noc_y, address, data, noc_id) };
        Ok(())
    }

    /// Write `mem` to `(noc_x, noc_y, addr)` in word-sized transactions.
    /// Partial words at the head and tail are read-modify-written.
    pub fn write(
        &self,
        chip_id: u8,
        mem: &[u8],
        noc_x: u8,
        noc_y: u8,
        addr: u64,
        noc_id: u8,
    ) -> Result<()> {
        let inner = self.select(chip_id)?;
        let mut addr = addr;
        let mut remaining = mem;

        let head = (addr % 4) as usize;
        if head != 0 {
            let aligned = addr - head as u64;
            let mut word = unsafe { (inner.lib.read32)(noc_x, noc_y, aligned, noc_id) }.to_le_bytes();
            let take = (4 - head).min(remaining.len());
            word[head..head + take].copy_from_slice(&remaining[..take]);
            unsafe {
                (inner.lib.write32)(noc_x, noc_y, aligned, u32::from_le_bytes(word), noc_id)
            };
            remaining = &remaining[take..];
            addr = aligned + 4;
        }

        while remaining.len() >= 4 {
            let word = u32::from_le_bytes(remaining[..4].try_into().unwrap());
            unsafe { (inner.lib.write32)(noc_x, noc_y, addr, word, noc_id) };
            remaining = &remaining[4..];
            addr += 4;
        }

        if !remaining.is_empty() {
            let mut word = unsafe { (inner.lib.read32)(noc_x, noc_y, addr, noc_id) }.to_le_bytes();
            word[..remaining.len()].copy_from_slice(remaining);
            unsafe { (inner.lib.write32)(noc_x, noc_y, addr, u32::from_le_bytes(word), noc_id) };
        }
        Ok(())
    }

    /// Read into `mem` from `(noc_x, noc_y, addr)` in word-sized
    /// transactions, mirroring [`write`](Self::write).
    pub fn read(
        &self,
        chip_id: u8,
        mem: &mut [u8],
        noc_x: u8,
        noc_y: u8,
        addr: u64,
        noc_id: u8,
    ) -> Result<()> {
        let inner = self.select(chip_id)?;
        let mut addr = addr;
        let mut offset = 0usize;

        let head = (addr % 4) as usize;
        if head != 0 {
            let aligned = addr - head as u64;
            let word = unsafe { (inner.lib.read32)(noc_x, noc_y, aligned, noc_id) }.to_le_bytes();
            let take = (4 - head).min(mem.len());
            mem[..take].copy_from_slice(&word[head..head + take]);
            offset += take;
            addr = aligned + 4;
        }

        while mem.len() - offset >= 4 {
            let word = unsafe { (inner.lib.read32)(noc_x, noc_y, addr, noc_id) };
            mem[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
            offset += 4;
            addr += 4;
        }

        if offset < mem.len() {
            let word = unsafe { (inner.lib.read32)(noc_x, noc_y, addr, noc_id) }.to_le_bytes();
            let tail = mem.len() - offset;
            mem[offset..].copy_from_slice(&word[..tail]);
        }
        Ok(())
    }

    pub fn is_hardware_hung(&self, chip_id: u8) -> Result<bool> {
        let scratch = self.read32_axi(chip_id, WORMHOLE_ARC_SCRATCH6)?;
        Ok(scratch == u32::MAX)
    }

    /// Switch the probe to `chip_id` if it is not already selected.
    fn select(&self, chip_id: u8) -> Result<std::sync::MutexGuard<'_, JtagDeviceInner>> {
        let mut inner = self.lock();
        let index = chip_id as usize;
        if index >= inner.jlink_devices.len() {
            return Err(Error::Jtag(format!("no JTAG device with chip id {chip_id}")));
        }
        if inner.current_device != Some(index) {
            if inner.current_device.is_some() {
                unsafe { (inner.lib.close_jlink)() };
            }
            let serial = inner.jlink_devices[index];
            let status = unsafe { (inner.lib.open_jlink_by_serial)(serial) };
            if status != 0 {
                inner.current_device = None;
                return Err(Error::Jtag(format!(
                    "failed to open J-Link with serial {serial}: status {status}"
                )));
            }
            inner.current_device = Some(index);
        }
        Ok(inner)
    }
}

impl std::fmt::Debug for JtagDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JtagDevice")
            .field("device_cnt", &self.get_device_cnt())
            .finish()
    }
}
