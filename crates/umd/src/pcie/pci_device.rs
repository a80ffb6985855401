//! PCIe device handle: BAR mappings, IOMMU discovery, DMA buffer, pinning.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::arch::Arch;
use crate::error::{Error, Result};
use crate::kmd::ioctl::{
    Mapping, PIN_PAGES_CONTIGUOUS, MAPPING_RESOURCE0_UC, MAPPING_RESOURCE0_WC,
    MAPPING_RESOURCE1_UC, MAPPING_RESOURCE2_WC,
};
use crate::kmd::{self, Kmd};
use crate::types::tlb::TlbMapping;
use crate::utils::{SemVer, KMD_ARCH_AGNOSTIC_RESET, KMD_IOMMU, KMD_MAP_TO_NOC, KMD_TLBS, KMD_TLB_DEBUGFS};

use super::tlb_handle::TlbHandle;

/// Size of the completion page appended to the DMA buffer. The device writes
/// a token there to signal transfer completion; the kernel driver exposes no
/// DMA-done interrupt on this path.
pub const DMA_COMPLETION_PAGE_SIZE: u64 = 0x1000;

/// One gibibyte; the hugepage granule used when the IOMMU is off.
pub const HUGEPAGE_REGION_SIZE: u64 = 1 << 30;

static BDF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-9a-fA-F]$").unwrap()
});

pub fn host_page_size() -> u64 {
    // SAFETY: sysconf(_SC_PAGESIZE) has no failure mode worth handling.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

/// Identity of one enumerated PCIe device.
#[derive(Debug, Clone)]
pub struct PciDeviceInfo {
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub pci_domain: u16,
    pub pci_bus: u16,
    pub pci_device: u16,
    pub pci_function: u16,
    pub pci_bdf: String,
    pub physical_slot: Option<i32>,
}

impl PciDeviceInfo {
    pub fn get_arch(&self) -> Option<Arch> {
        Arch::from_pcie_device_id(self.device_id)
    }
}

fn format_bdf(domain: u16, bus: u16, device: u16, function: u16) -> String {
    format!("{domain:04x}:{bus:02x}:{device:02x}.{function:x}")
}

fn read_device_info(kmd: &Kmd) -> Result<PciDeviceInfo> {
    let raw = kmd.get_device_info()?;
    let bus = raw.bus_dev_fn >> 8;
    let device = (raw.bus_dev_fn >> 3) & 0x1F;
    let function = raw.bus_dev_fn & 0x07;
    let pci_bdf = format_bdf(raw.pci_domain, bus, device, function);
    let physical_slot = physical_slot_for_bdf(&pci_bdf);
    Ok(PciDeviceInfo {
        vendor_id: raw.vendor_id,
        device_id: raw.device_id,
        subsystem_vendor_id: raw.subsystem_vendor_id,
        subsystem_id: raw.subsystem_id,
        pci_domain: raw.pci_domain,
        pci_bus: bus,
        pci_device: device,
        pci_function: function,
        pci_bdf,
        physical_slot,
    })
}

fn sysfs_attribute_path(info: &PciDeviceInfo, attribute: &str) -> String {
    format!("/sys/bus/pci/devices/{}/{}", info.pci_bdf, attribute)
}

fn try_read_sysfs_string(info: &PciDeviceInfo, attribute: &str) -> Option<String> {
    let text = std::fs::read_to_string(sysfs_attribute_path(info, attribute)).ok()?;
    Some(text.lines().next().unwrap_or("").trim().to_string())
}

/// Reads an integer sysfs attribute; values may carry a `0x` prefix.
fn try_read_sysfs_int(info: &PciDeviceInfo, attribute: &str) -> Option<i64> {
    let value = try_read_sysfs_string(info, attribute)?;
    if let Some(hex) = value.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

fn read_sysfs_int(info: &PciDeviceInfo, attribute: &str) -> Result<i64> {
    try_read_sysfs_int(info, attribute).ok_or_else(|| {
        Error::Configuration(format!(
            "failed reading or parsing sysfs attribute: {}",
            sysfs_attribute_path(info, attribute)
        ))
    })
}

/// IOMMU is active when the group type starts with `DMA` (DMA or DMA-FQ).
fn detect_iommu(info: &PciDeviceInfo) -> bool {
    try_read_sysfs_string(info, "iommu_group/type")
        .map(|t| t.starts_with("DMA"))
        .unwrap_or(false)
}

fn try_read_config_byte(info: &PciDeviceInfo, offset: u64) -> Option<u8> {
    let path = sysfs_attribute_path(info, "config");
    let mut file = File::open(path).ok()?;
    file.seek(SeekFrom::Start(offset)).ok()?;
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).ok()?;
    Some(byte[0])
}

fn physical_slot_for_bdf(target_bdf: &str) -> Option<i32> {
    let entries = std::fs::read_dir("/sys/bus/pci/slots").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(slot) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        let Ok(mut bdf) = std::fs::read_to_string(entry.path().join("address")) else {
            continue;
        };
        bdf.truncate(bdf.trim_end().len());
        // Slot addresses omit the function; our devices are single function.
        bdf.push_str(".0");
        if bdf == target_bdf {
            return Some(slot);
        }
    }
    None
}

fn bdf_to_device_id_map() -> BTreeMap<String, usize> {
    let mut map = BTreeMap::new();
    for id in kmd::all_device_ids() {
        let Ok(device) = Kmd::open(id) else { continue };
        if let Ok(info) = read_device_info(&device) {
            map.insert(info.pci_bdf, id);
        }
    }
    map
}

/// Enumerate device ids, honoring `TT_VISIBLE_DEVICES` (comma-separated
/// numeric ids or BDF strings). Absence of the variable means all devices.
pub fn enumerate_devices() -> Result<Vec<usize>> {
    if !Path::new(kmd::DEVICE_DIRECTORY).exists() {
        return Ok(Vec::new());
    }

    let Ok(visible) = std::env::var("TT_VISIBLE_DEVICES") else {
        return Ok(kmd::all_device_ids());
    };
    if visible.is_empty() {
        return Ok(Vec::new());
    }

    let all_ids = kmd::all_device_ids();
    let bdf_map = bdf_to_device_id_map();
    let mut filtered = std::collections::BTreeSet::new();

    for token in visible.split(',').map(str::trim) {
        if BDF_RE.is_match(token) {
            let bdf = token.to_lowercase();
            match bdf_map.get(&bdf) {
                Some(id) => {
                    debug!(device = id, bdf = %token, "device selected by TT_VISIBLE_DEVICES");
                    filtered.insert(*id);
                }
                None => {
                    return Err(Error::Configuration(format!(
                        "invalid BDF identifier in TT_VISIBLE_DEVICES: {token}; valid device \
                         identifiers are either integers or BDF strings"
                    )))
                }
            }
        } else if token.chars().all(|c| c.is_ascii_digit()) && !token.is_empty() {
            let id: usize = token.parse().unwrap();
            if all_ids.contains(&id) {
                debug!(device = id, "device selected by TT_VISIBLE_DEVICES");
                filtered.insert(id);
            } else {
                return Err(Error::Configuration(format!(
                    "invalid device ID in TT_VISIBLE_DEVICES: {token}; valid device identifiers \
                     are either integers or BDF strings"
                )));
            }
        } else {
            return Err(Error::Configuration(format!(
                "invalid device identifier in TT_VISIBLE_DEVICES: {token}; valid device \
                 identifiers are either integers or BDF strings"
            )));
        }
    }

    Ok(filtered.into_iter().collect())
}

/// Enumerate devices with their identity, skipping nodes that cannot be
/// opened (held by another process, or mid-reset).
pub fn enumerate_devices_info() -> Result<BTreeMap<usize, PciDeviceInfo>> {
    let mut infos = BTreeMap::new();
    for id in enumerate_devices()? {
        let Ok(device) = Kmd::open(id) else { continue };
        if let Ok(info) = read_device_info(&device) {
            infos.insert(id, info);
        }
    }
    Ok(infos)
}

/// Kernel driver version from sysfs. Missing module reads as 0.0.0.
pub fn read_kmd_version() -> SemVer {
    let Ok(text) = std::fs::read_to_string(kmd::KMD_VERSION_PATH) else {
        warn!("failed to open file: {}", kmd::KMD_VERSION_PATH);
        return SemVer::new(0, 0, 0);
    };
    text.trim().parse().unwrap_or_else(|_| {
        warn!(version = %text.trim(), "unparseable kernel driver version");
        SemVer::new(0, 0, 0)
    })
}

/// Whether the running kernel driver can map pinned buffers into the NOC.
pub fn is_mapping_buffer_to_noc_supported() -> bool {
    read_kmd_version() >= KMD_MAP_TO_NOC
}

/// Whether the running kernel driver has the architecture-agnostic reset.
pub fn is_arch_agnostic_reset_supported() -> bool {
    read_kmd_version() >= KMD_ARCH_AGNOSTIC_RESET
}

/// A mapped BAR region. Non-copyable; accessors bounds-check every access so
/// a bad offset cannot silently walk off the mapping.
#[derive(Debug)]
pub struct BarMapping {
    raw: MmapRaw,
    kind: TlbMapping,
}

impl BarMapping {
    fn map(file: &File, base: u64, size: u64, kind: TlbMapping) -> Result<Self> {
        let raw = MmapOptions::new()
            .offset(base)
            .len(size as usize)
            .map_raw(file)
            .map_err(|e| Error::Configuration(format!("BAR mapping failed: {e}")))?;
        Ok(Self { raw, kind })
    }

    pub fn len(&self) -> u64 {
        self.raw.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.raw.len() == 0
    }

    pub fn kind(&self) -> TlbMapping {
        self.kind
    }

    /// Pointer to `offset`, valid for `len` bytes.
    pub fn ptr_at(&self, offset: u64, len: u64) -> Result<*mut u8> {
        if offset + len > self.len() {
            return Err(Error::InvalidArgument(format!(
                "BAR access at {offset:#x}+{len:#x} exceeds mapping of {:#x} bytes",
                self.len()
            )));
        }
        Ok(unsafe { self.raw.as_mut_ptr().add(offset as usize) })
    }

    pub fn read32(&self, offset: u64) -> Result<u32> {
        let ptr = self.ptr_at(offset, 4)? as *const u32;
        Ok(unsafe { ptr.read_volatile() })
    }

    pub fn write32(&self, offset: u64, value: u32) -> Result<()> {
        let ptr = self.ptr_at(offset, 4)? as *mut u32;
        unsafe { ptr.write_volatile(value) };
        Ok(())
    }
}

/// Staging buffer for the large-block DMA paths, with its completion page.
/// Backed either by anonymous pages pinned through the IOMMU or by a
/// kernel-allocated contiguous buffer mapped through the device node.
pub struct DmaBuffer {
    mapping: MmapRaw,
    pub buffer_pa: u64,
    pub completion_pa: u64,
    /// Usable size in bytes; the completion page is not included.
    pub size: u64,
}

impl DmaBuffer {
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mapping.as_mut_ptr()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mapping.as_mut_ptr() as *const u8
    }

    /// The 4 KiB completion page at the end of the allocation.
    pub fn completion_ptr(&self) -> *const u32 {
        unsafe { self.as_ptr().add(self.size as usize) as *const u32 }
    }
}

impl std::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("buffer_pa", &self.buffer_pa)
            .field("size", &self.size)
            .finish()
    }
}

/// One opened accelerator on PCIe.
pub struct PciDevice {
    kmd: Arc<Kmd>,
    device_num: usize,
    info: PciDeviceInfo,
    arch: Arch,
    numa_node: i64,
    revision: i64,
    kmd_version: SemVer,
    iommu_enabled: bool,

    pub bar0_uc: BarMapping,
    pub bar0_wc: Option<BarMapping>,
    pub bar2_uc: Option<BarMapping>,
    pub bar4_wc: Option<BarMapping>,

    dma_buffer: Option<DmaBuffer>,
}

impl std::fmt::Debug for PciDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PciDevice")
            .field("device_num", &self.device_num)
            .field("bdf", &self.info.pci_bdf)
            .field("arch", &self.arch)
            .finish()
    }
}

impl PciDevice {
    /// Open one device by enumerated index, map its BARs, discover IOMMU
    /// state and allocate the DMA staging buffer.
    pub fn open(device_num: usize) -> Result<Self> {
        let kmd = Arc::new(Kmd::open(device_num)?);
        let info = read_device_info(&kmd)?;
        let arch = info.get_arch().ok_or_else(|| {
            Error::Configuration(format!(
                "device {device_num} has unknown PCIe device id {:#06x}",
                info.device_id
            ))
        })?;
        let numa_node = try_read_sysfs_int(&info, "numa_node").unwrap_or(-1);
        let revision = read_sysfs_int(&info, "revision")?;
        let kmd_version = read_kmd_version();
        let iommu_enabled = detect_iommu(&info);

        if iommu_enabled && kmd_version < KMD_IOMMU {
            return Err(Error::Configuration(format!(
                "running with IOMMU support requires KMD version {KMD_IOMMU} or newer"
            )));
        }
        if kmd_version < KMD_TLBS {
            return Err(Error::Configuration(format!(
                "running this driver requires KMD version {KMD_TLBS} or newer"
            )));
        }
        if iommu_enabled && kmd_version < KMD_MAP_TO_NOC {
            warn!(
                "running with IOMMU support prior to KMD version {} is of limited support",
                KMD_MAP_TO_NOC
            );
        }

        let driver_info = kmd.get_driver_info()?;
        info!(
            device = device_num,
            kmd_version = %kmd_version,
            api = driver_info.driver_version,
            iommu = iommu_enabled,
            "opened PCI device"
        );

        if arch == Arch::Wormhole && revision != 0x01 {
            return Err(Error::Configuration(
                "Wormhole B0 must have revision 0x01".into(),
            ));
        }

        let mappings = kmd.query_mappings()?;
        let find = |id: u32| -> Option<&Mapping> {
            mappings.iter().find(|m| m.mapping_id == id)
        };
        for m in &mappings {
            debug!(
                mapping_id = m.mapping_id,
                base = format_args!("{:#x}", m.mapping_base),
                size = format_args!("{:#x}", m.mapping_size),
                "BAR mapping"
            );
        }

        // Resource 0 is BAR0, resource 1 is BAR2, resource 2 is BAR4.
        let bar0_uc_mapping = find(MAPPING_RESOURCE0_UC).ok_or_else(|| {
            Error::Configuration(format!("device {device_num} has no BAR0 UC mapping"))
        })?;
        let bar0_uc = BarMapping::map(
            kmd.file(),
            bar0_uc_mapping.mapping_base,
            bar0_uc_mapping.mapping_size,
            TlbMapping::Uc,
        )?;

        let bar0_wc = match find(MAPPING_RESOURCE0_WC) {
            Some(m) => Some(BarMapping::map(
                kmd.file(),
                m.mapping_base,
                m.mapping_size,
                TlbMapping::Wc,
            )?),
            None => None,
        };

        let bar2_uc = match find(MAPPING_RESOURCE1_UC) {
            Some(m) => Some(BarMapping::map(
                kmd.file(),
                m.mapping_base,
                m.mapping_size,
                TlbMapping::Uc,
            )?),
            None => None,
        };

        // Blackhole routes DRAM traffic through BAR4 write-combined.
        let bar4_wc = match (arch, find(MAPPING_RESOURCE2_WC)) {
            (Arch::Blackhole, Some(m)) => Some(BarMapping::map(
                kmd.file(),
                m.mapping_base,
                m.mapping_size,
                TlbMapping::Wc,
            )?),
            (Arch::Blackhole, None) => {
                return Err(Error::Configuration(format!(
                    "device {device_num} has no BAR4 WC mapping"
                )))
            }
            _ => None,
        };

        let mut device = Self {
            kmd,
            device_num,
            info,
            arch,
            numa_node,
            revision,
            kmd_version,
            iommu_enabled,
            bar0_uc,
            bar0_wc,
            bar2_uc,
            bar4_wc,
            dma_buffer: None,
        };
        device.allocate_pcie_dma_buffer();
        Ok(device)
    }

    pub fn kmd(&self) -> &Arc<Kmd> {
        &self.kmd
    }

    pub fn get_device_num(&self) -> usize {
        self.device_num
    }

    pub fn get_info(&self) -> &PciDeviceInfo {
        &self.info
    }

    pub fn get_arch(&self) -> Arch {
        self.arch
    }

    pub fn get_numa_node(&self) -> i64 {
        self.numa_node
    }

    pub fn get_revision(&self) -> i64 {
        self.revision
    }

    pub fn get_kmd_version(&self) -> SemVer {
        self.kmd_version
    }

    pub fn is_iommu_enabled(&self) -> bool {
        self.iommu_enabled
    }

    pub fn dma_buffer(&self) -> Option<&DmaBuffer> {
        self.dma_buffer.as_ref()
    }

    pub fn dma_buffer_mut(&mut self) -> Option<&mut DmaBuffer> {
        self.dma_buffer.as_mut()
    }

    /// Command byte from PCI config space (offset 4).
    pub fn read_command_byte(&self) -> Result<u8> {
        try_read_config_byte(&self.info, 4).ok_or_else(|| {
            Error::Configuration(format!(
                "failed reading config space for device {}",
                self.info.pci_bdf
            ))
        })
    }

    /// Allocate a TLB window. A `size` of zero probes the architecture's
    /// legal sizes from largest to smallest.
    pub fn allocate_tlb(&self, size: u64, mapping: TlbMapping) -> Result<TlbHandle> {
        if size != 0 {
            return self.allocate_tlb_exact(size, mapping);
        }
        for &probe in self.arch.tlb_sizes() {
            match self.allocate_tlb_exact(probe, mapping) {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    debug!(size = probe, "TLB allocation attempt failed: {e}");
                }
            }
        }
        Err(Error::ResourceExhausted(
            "failed to allocate a TLB window at any legal size".into(),
        ))
    }

    fn allocate_tlb_exact(&self, size: u64, mapping: TlbMapping) -> Result<TlbHandle> {
        TlbHandle::allocate(Arc::clone(&self.kmd), size, mapping).map_err(|e| {
            if self.kmd_version < KMD_TLB_DEBUGFS {
                Error::ResourceExhausted(format!(
                    "failed to allocate TLB window; the resource might be exhausted by some \
                     other hung process: {e}"
                ))
            } else {
                Error::ResourceExhausted(format!(
                    "failed to allocate TLB window; look at \
                     /sys/kernel/debug/tenstorrent/{0}/mappings and \
                     /proc/driver/tenstorrent/{0}/pids for more information: {e}",
                    self.device_num
                ))
            }
        })
    }

    /// Pin a page-aligned buffer for device DMA. Returns the physical
    /// address, or the IOVA when the IOMMU translates for this device.
    pub fn map_for_dma(&self, buffer: *mut u8, size: u64) -> Result<u64> {
        let page_size = host_page_size();
        let vaddr = buffer as u64;
        if vaddr % page_size != 0 || size % page_size != 0 {
            return Err(Error::InvalidArgument(
                "buffer must be page-aligned with a size that is a multiple of the page size"
                    .into(),
            ));
        }
        let flags = if self.iommu_enabled {
            0
        } else {
            PIN_PAGES_CONTIGUOUS
        };
        self.kmd.pin_pages(vaddr, size, flags)
    }

    pub fn unmap_for_dma(&self, buffer: *mut u8, size: u64) -> Result<()> {
        let page_size = host_page_size();
        let vaddr = buffer as u64;
        if vaddr % page_size != 0 || size % page_size != 0 {
            return Err(Error::InvalidArgument(
                "buffer must be page-aligned with a size that is a multiple of the page size"
                    .into(),
            ));
        }
        self.kmd.unpin_pages(vaddr, size)
    }

    /// Pin an ordinary buffer and map it into the NOC address space.
    /// Returns `(noc_address, physical_address)`.
    pub fn map_buffer_to_noc(&self, buffer: *mut u8, size: u64) -> Result<(u64, u64)> {
        if self.kmd_version < KMD_MAP_TO_NOC {
            return Err(Error::Configuration(format!(
                "KMD version must be at least {KMD_MAP_TO_NOC} to map buffers to the NOC"
            )));
        }
        let page_size = host_page_size();
        let vaddr = buffer as u64;
        if vaddr % page_size != 0 || size % page_size != 0 {
            return Err(Error::InvalidArgument(
                "buffer must be page-aligned with a size that is a multiple of the page size"
                    .into(),
            ));
        }
        if size > page_size && !self.iommu_enabled {
            return Err(Error::InvalidArgument(format!(
                "cannot map buffer of size {size:#x} to NOC with IOMMU disabled"
            )));
        }
        self.kmd.pin_pages_to_noc(vaddr, size, 0)
    }

    /// Pin one huge page (contiguous) and map it into the NOC address space.
    /// Returns `(noc_address, physical_address)`.
    pub fn map_hugepage_to_noc(&self, hugepage: *mut u8, size: u64) -> Result<(u64, u64)> {
        if self.kmd_version < KMD_MAP_TO_NOC {
            return Err(Error::Configuration(format!(
                "KMD version must be at least {KMD_MAP_TO_NOC} to map hugepages to the NOC"
            )));
        }
        if size > HUGEPAGE_REGION_SIZE {
            return Err(Error::InvalidArgument(format!(
                "{size:#x} bytes is not a hugepage"
            )));
        }
        let page_size = host_page_size();
        let vaddr = hugepage as u64;
        if vaddr % page_size != 0 || size % page_size != 0 {
            return Err(Error::InvalidArgument(
                "buffer must be page-aligned with a size that is a multiple of the page size"
                    .into(),
            ));
        }
        if self.iommu_enabled {
            warn!("mapping a hugepage with IOMMU enabled");
        }
        self.kmd
            .pin_pages_to_noc(vaddr, size, PIN_PAGES_CONTIGUOUS)
    }

    fn try_allocate_pcie_dma_buffer_iommu(&mut self, dma_buf_size: u64) -> bool {
        let alloc_size = dma_buf_size + DMA_COMPLETION_PAGE_SIZE;
        let mapping: MmapRaw = match MmapOptions::new()
            .len(alloc_size as usize)
            .populate()
            .map_anon()
        {
            Ok(m) => m.into(),
            Err(_) => return false,
        };

        match self.map_for_dma(mapping.as_mut_ptr(), alloc_size) {
            Ok(iova) => {
                self.dma_buffer = Some(DmaBuffer {
                    mapping,
                    buffer_pa: iova,
                    completion_pa: iova + dma_buf_size,
                    size: dma_buf_size,
                });
                true
            }
            Err(e) => {
                debug!(
                    size = dma_buf_size,
                    "failed to allocate PCIe DMA buffer with IOMMU enabled: {e}"
                );
                false
            }
        }
    }

    fn try_allocate_pcie_dma_buffer_no_iommu(&mut self, dma_buf_size: u64) -> bool {
        let alloc_size = dma_buf_size + DMA_COMPLETION_PAGE_SIZE;
        let out = match self.kmd.allocate_dma_buf(alloc_size, 0) {
            Ok(out) => out,
            Err(e) => {
                debug!("failed to allocate DMA buffer: {e}");
                return false;
            }
        };

        match MmapOptions::new()
            .offset(out.mapping_offset)
            .len(alloc_size as usize)
            .map_raw(self.kmd.file())
        {
            Ok(raw) => {
                debug!(
                    size = alloc_size,
                    device = self.device_num,
                    "allocated PCIe DMA buffer"
                );
                self.dma_buffer = Some(DmaBuffer {
                    mapping: raw,
                    buffer_pa: out.physical_address,
                    completion_pa: out.physical_address + dma_buf_size,
                    size: dma_buf_size,
                });
                true
            }
            Err(e) => {
                // The buffer itself is unrecoverable until the fd closes.
                warn!("failed to map DMA buffer: {e}");
                false
            }
        }
    }

    /// Try descending buffer sizes, starting at 16 MiB with an IOMMU or
    /// 2 MiB without, down to a single page; the first success wins.
    fn allocate_pcie_dma_buffer(&mut self) {
        if !self.arch.supports_dma_buffer() {
            return;
        }
        let page_size = host_page_size();
        let one_mb: u64 = 1 << 20;
        let mut dma_buf_size = if self.iommu_enabled {
            16 * one_mb
        } else {
            2 * one_mb
        };

        while dma_buf_size >= page_size {
            let ok = if self.iommu_enabled {
                self.try_allocate_pcie_dma_buffer_iommu(dma_buf_size)
            } else {
                self.try_allocate_pcie_dma_buffer_no_iommu(dma_buf_size)
            };
            if ok {
                break;
            }
            dma_buf_size >>= 1;
        }
        if self.dma_buffer.is_none() {
            warn!(
                device = self.device_num,
                "could not allocate a DMA staging buffer; DMA paths disabled"
            );
        }
    }
}

/// Issue the reset ioctl on each targeted device.
pub fn reset_devices(device_ids: &[usize], flags: u32) -> Result<()> {
    for &id in device_ids {
        debug!(device = id, flags, "issuing reset ioctl");
        let device = Kmd::open(id)?;
        device.reset_device(flags)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdf_regex_accepts_canonical_tokens() {
        assert!(BDF_RE.is_match("0000:03:00.0"));
        assert!(BDF_RE.is_match("0001:a3:1f.7"));
        assert!(!BDF_RE.is_match("3:0:0.0"));
        assert!(!BDF_RE.is_match("0000:03:00"));
        assert!(!BDF_RE.is_match("7"));
    }

    #[test]
    fn bdf_formatting_is_lowercase_and_padded() {
        assert_eq!(format_bdf(0, 3, 0, 0), "0000:03:00.0");
        assert_eq!(format_bdf(1, 0xA3, 0x1F, 7), "0001:a3:1f.7");
    }

    #[test]
    fn visible_devices_rejects_garbage_tokens() {
        // Run against an empty device directory: any non-numeric,
        // non-BDF token is a configuration error.
        std::env::set_var("TT_VISIBLE_DEVICES", "zeroth");
        let result = enumerate_devices();
        std::env::remove_var("TT_VISIBLE_DEVICES");
        if Path::new(kmd::DEVICE_DIRECTORY).exists() {
            assert!(result.is_err());
        }
    }
}
