//! Typed wrappers over the kernel driver's ioctl interface.

pub mod ioctl;

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

use ioctl::*;

/// Directory the kernel driver populates with one node per device.
pub const DEVICE_DIRECTORY: &str = "/dev/tenstorrent";

/// Module version file in sysfs, ASCII semver.
pub const KMD_VERSION_PATH: &str = "/sys/module/tenstorrent/version";

/// One opened device node. Owns the file descriptor; every ioctl the driver
/// issues for this device goes through here.
#[derive(Debug)]
pub struct Kmd {
    file: File,
    path: PathBuf,
}

fn run_ioctl<T>(fd: RawFd, nr: u8, op: &'static str, arg: &mut T) -> Result<()> {
    let rc = unsafe { libc::ioctl(fd, request_code(nr), arg as *mut T) };
    if rc < 0 {
        return Err(Error::last_kmd_error(op));
    }
    Ok(())
}

impl Kmd {
    /// Open the device node for an enumerated device index.
    pub fn open(device_number: usize) -> Result<Self> {
        let path = PathBuf::from(format!("{DEVICE_DIRECTORY}/{device_number}"));
        Self::open_path(&path)
    }

    pub fn open_path(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                Error::Configuration(format!("could not open device node {}: {e}", path.display()))
            })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn get_device_info(&self) -> Result<GetDeviceInfoOut> {
        let mut arg = GetDeviceInfo {
            input: GetDeviceInfoIn {
                output_size_bytes: std::mem::size_of::<GetDeviceInfoOut>() as u32,
            },
            ..Default::default()
        };
        run_ioctl(self.fd(), IOCTL_GET_DEVICE_INFO, "GET_DEVICE_INFO", &mut arg)?;
        Ok(arg.output)
    }

    pub fn get_driver_info(&self) -> Result<GetDriverInfoOut> {
        let mut arg = GetDriverInfo {
            input: GetDriverInfoIn {
                output_size_bytes: std::mem::size_of::<GetDriverInfoOut>() as u32,
            },
            ..Default::default()
        };
        run_ioctl(self.fd(), IOCTL_GET_DRIVER_INFO, "GET_DRIVER_INFO", &mut arg)?;
        Ok(arg.output)
    }

    /// Query the BAR resource mappings this device exposes. Entries whose id
    /// is `MAPPING_UNUSED` are filtered out.
    pub fn query_mappings(&self) -> Result<Vec<Mapping>> {
        let mut arg = QueryMappings {
            input: QueryMappingsIn {
                output_mapping_count: MAX_QUERY_MAPPINGS as u32,
                reserved: 0,
            },
            ..Default::default()
        };
        run_ioctl(self.fd(), IOCTL_QUERY_MAPPINGS, "QUERY_MAPPINGS", &mut arg)?;
        Ok(arg
            .mappings
            .iter()
            .filter(|m| m.mapping_id != MAPPING_UNUSED)
            .copied()
            .collect())
    }

    /// Pin user pages for device access. Returns the physical address (or
    /// IOVA when an IOMMU translates for the device).
    pub fn pin_pages(&self, virtual_address: u64, size: u64, flags: u32) -> Result<u64> {
        let mut arg = PinPages {
            input: PinPagesIn {
                output_size_bytes: std::mem::size_of::<PinPagesOut>() as u32,
                flags,
                virtual_address,
                size,
            },
            ..Default::default()
        };
        run_ioctl(self.fd(), IOCTL_PIN_PAGES, "PIN_PAGES", &mut arg)?;
        debug!(
            virtual_address = format_args!("{virtual_address:#x}"),
            size = format_args!("{size:#x}"),
            physical_address = format_args!("{:#x}", arg.output.physical_address),
            "pinned pages"
        );
        Ok(arg.output.physical_address)
    }

    /// Pin user pages and map them into the NOC address space. Returns
    /// `(noc_address, physical_address)`.
    pub fn pin_pages_to_noc(
        &self,
        virtual_address: u64,
        size: u64,
        flags: u32,
    ) -> Result<(u64, u64)> {
        let mut arg = PinPagesExtended {
            input: PinPagesIn {
                output_size_bytes: std::mem::size_of::<PinPagesOutExtended>() as u32,
                flags: flags | PIN_PAGES_NOC_DMA,
                virtual_address,
                size,
            },
            ..Default::default()
        };
        run_ioctl(self.fd(), IOCTL_PIN_PAGES, "PIN_PAGES", &mut arg)?;
        debug!(
            virtual_address = format_args!("{virtual_address:#x}"),
            size = format_args!("{size:#x}"),
            physical_address = format_args!("{:#x}", arg.output.physical_address),
            noc_address = format_args!("{:#x}", arg.output.noc_address),
            "pinned pages with NOC mapping"
        );
        Ok((arg.output.noc_address, arg.output.physical_address))
    }

    pub fn unpin_pages(&self, virtual_address: u64, size: u64) -> Result<()> {
        let mut arg = UnpinPages {
            input: UnpinPagesIn {
                virtual_address,
                size,
            },
        };
        run_ioctl(self.fd(), IOCTL_UNPIN_PAGES, "UNPIN_PAGES", &mut arg)
    }

    /// Ask the kernel for a contiguous DMA buffer. Returns the physical
    /// address and the mmap offset through which the buffer is mapped.
    pub fn allocate_dma_buf(&self, requested_size: u64, buf_index: u8) -> Result<AllocateDmaBufOut> {
        let mut arg = AllocateDmaBuf {
            input: AllocateDmaBufIn {
                requested_size,
                buf_index,
                reserved: [0; 7],
            },
            ..Default::default()
        };
        run_ioctl(self.fd(), IOCTL_ALLOCATE_DMA_BUF, "ALLOCATE_DMA_BUF", &mut arg)?;
        Ok(arg.output)
    }

    /// Reserve a TLB window of `size` bytes. The reply carries the opaque id
    /// and the mmap offsets of the window's UC and WC mappings.
    pub fn allocate_tlb(&self, size: u64) -> Result<AllocateTlbOut> {
        let mut arg = AllocateTlb {
            input: AllocateTlbIn { size, reserved: 0 },
            ..Default::default()
        };
        run_ioctl(self.fd(), IOCTL_ALLOCATE_TLB, "ALLOCATE_TLB", &mut arg)?;
        Ok(arg.output)
    }

    pub fn free_tlb(&self, id: u32) -> Result<()> {
        let mut arg = FreeTlb {
            input: FreeTlbIn { id },
        };
        run_ioctl(self.fd(), IOCTL_FREE_TLB, "FREE_TLB", &mut arg)
    }

    pub fn reset_device(&self, flags: u32) -> Result<u32> {
        let mut arg = ResetDevice {
            input: ResetDeviceIn {
                output_size_bytes: std::mem::size_of::<ResetDeviceOut>() as u32,
                flags,
            },
            ..Default::default()
        };
        run_ioctl(self.fd(), IOCTL_RESET_DEVICE, "RESET_DEVICE", &mut arg)?;
        Ok(arg.output.result)
    }
}

/// Enumerate device nodes under [`DEVICE_DIRECTORY`], sorted ascending.
/// Ignores `TT_VISIBLE_DEVICES`.
pub fn all_device_ids() -> Vec<usize> {
    let mut ids = Vec::new();
    let Ok(entries) = std::fs::read_dir(DEVICE_DIRECTORY) else {
        return ids;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(|s| s.parse::<usize>().ok()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    ids
}
