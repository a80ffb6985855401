//! Host memory channels visible to the device.
//!
//! Without an IOMMU each channel is one pinned huge page with a contiguous
//! physical address. With an IOMMU the channel is assembled from ordinary
//! pages and the recorded address is an IOVA; callers cannot tell the
//! difference.

use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::pcie::pci_device::{PciDevice, HUGEPAGE_REGION_SIZE};

/// Upper bound on host memory channels per chip.
pub const MAX_HOST_MEM_CHANNELS: u32 = 4;

/// log2 of the huge page size requested from the kernel (1 GiB).
const HUGEPAGE_SHIFT: u8 = 30;

/// One pinned host memory channel.
pub struct HugepageMapping {
    mapping: MmapRaw,
    /// Physical address, or IOVA under an IOMMU.
    pub physical_address: u64,
    /// Address the device uses to reach this channel over the NOC.
    pub noc_address: u64,
    pub size: u64,
    pub channel: u16,
}

impl HugepageMapping {
    pub fn virtual_address(&self) -> *mut u8 {
        self.mapping.as_mut_ptr()
    }
}

impl std::fmt::Debug for HugepageMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HugepageMapping")
            .field("channel", &self.channel)
            .field("size", &self.size)
            .field("physical_address", &format_args!("{:#x}", self.physical_address))
            .field("noc_address", &format_args!("{:#x}", self.noc_address))
            .finish()
    }
}

/// Per-chip inventory of host memory channels.
pub struct SysmemManager {
    device: Arc<PciDevice>,
    channels: Vec<HugepageMapping>,
}

impl SysmemManager {
    pub fn new(device: Arc<PciDevice>) -> Self {
        Self {
            device,
            channels: Vec::new(),
        }
    }

    /// Allocate and pin up to `num_channels` channels. Allocation failures
    /// reduce the channel count rather than failing the chip open; callers
    /// check [`get_num_host_mem_channels`](Self::get_num_host_mem_channels).
    pub fn init_hugepages(&mut self, num_channels: u32) -> Result<bool> {
        if num_channels > MAX_HOST_MEM_CHANNELS {
            return Err(Error::InvalidArgument(format!(
                "requested {num_channels} host memory channels; at most {MAX_HOST_MEM_CHANNELS} \
                 are supported"
            )));
        }

        for channel in 0..num_channels as u16 {
            match self.init_channel(channel) {
                Ok(mapping) => {
                    info!(
                        chip = self.device.get_device_num(),
                        channel,
                        size = mapping.size,
                        "host memory channel ready"
                    );
                    self.channels.push(mapping);
                }
                Err(e) => {
                    warn!(
                        chip = self.device.get_device_num(),
                        channel,
                        "host memory channel unavailable, continuing with {} channels: {e}",
                        self.channels.len()
                    );
                    break;
                }
            }
        }
        Ok(self.channels.len() == num_channels as usize)
    }

    fn init_channel(&self, channel: u16) -> Result<HugepageMapping> {
        let size = HUGEPAGE_REGION_SIZE;
        if self.device.is_iommu_enabled() {
            // Ordinary pages; the IOMMU provides the contiguous device view.
            let mapping: MmapRaw = MmapOptions::new()
                .len(size as usize)
                .populate()
                .map_anon()
                .map_err(|e| {
                    Error::ResourceExhausted(format!("sysmem allocation failed: {e}"))
                })?
                .into();
            let (noc_address, physical_address) =
                self.device.map_buffer_to_noc(mapping.as_mut_ptr(), size)?;
            Ok(HugepageMapping {
                mapping,
                physical_address,
                noc_address,
                size,
                channel,
            })
        } else {
            let mapping: MmapRaw = MmapOptions::new()
                .len(size as usize)
                .huge(Some(HUGEPAGE_SHIFT))
                .populate()
                .map_anon()
                .map_err(|e| {
                    Error::ResourceExhausted(format!(
                        "hugepage allocation failed (are 1 GiB hugepages reserved?): {e}"
                    ))
                })?
                .into();
            let (noc_address, physical_address) =
                self.device.map_hugepage_to_noc(mapping.as_mut_ptr(), size)?;
            Ok(HugepageMapping {
                mapping,
                physical_address,
                noc_address,
                size,
                channel,
            })
        }
    }

    fn channel(&self, channel: u16) -> Result<&HugepageMapping> {
        self.channels.get(channel as usize).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "host memory channel {channel} not initialized ({} available)",
                self.channels.len()
            ))
        })
    }

    pub fn write_to_sysmem(&self, channel: u16, src: &[u8], dest_offset: u64) -> Result<()> {
        let mapping = self.channel(channel)?;
        if dest_offset + src.len() as u64 > mapping.size {
            return Err(Error::InvalidArgument(format!(
                "sysmem write at {dest_offset:#x}+{:#x} exceeds channel of {:#x} bytes",
                src.len(),
                mapping.size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                mapping.virtual_address().add(dest_offset as usize),
                src.len(),
            );
        }
        Ok(())
    }

    pub fn read_from_sysmem(&self, channel: u16, dest: &mut [u8], src_offset: u64) -> Result<()> {
        let mapping = self.channel(channel)?;
        if src_offset + dest.len() as u64 > mapping.size {
            return Err(Error::InvalidArgument(format!(
                "sysmem read at {src_offset:#x}+{:#x} exceeds channel of {:#x} bytes",
                dest.len(),
                mapping.size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapping.virtual_address().add(src_offset as usize) as *const u8,
                dest.as_mut_ptr(),
                dest.len(),
            );
        }
        Ok(())
    }

    pub fn get_num_host_mem_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn get_hugepage_mapping(&self, channel: u16) -> Result<&HugepageMapping> {
        self.channel(channel)
    }
}

impl std::fmt::Debug for SysmemManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysmemManager")
            .field("channels", &self.channels.len())
            .finish()
    }
}
