//! Wire-level ioctl structures for the kernel driver.
//!
//! Layouts are bit-exact contracts with the kernel module; every struct is
//! `#[repr(C)]` and matches the driver's uapi header field for field.

#![allow(non_camel_case_types)]

pub const TENSTORRENT_IOCTL_MAGIC: u8 = 0xFA;

pub const IOCTL_GET_DEVICE_INFO: u8 = 0;
pub const IOCTL_QUERY_MAPPINGS: u8 = 2;
pub const IOCTL_ALLOCATE_DMA_BUF: u8 = 3;
pub const IOCTL_FREE_DMA_BUF: u8 = 4;
pub const IOCTL_GET_DRIVER_INFO: u8 = 5;
pub const IOCTL_RESET_DEVICE: u8 = 6;
pub const IOCTL_PIN_PAGES: u8 = 7;
pub const IOCTL_UNPIN_PAGES: u8 = 10;
pub const IOCTL_ALLOCATE_TLB: u8 = 11;
pub const IOCTL_FREE_TLB: u8 = 12;

/// `_IO(magic, nr)` request code.
pub fn request_code(nr: u8) -> libc::c_ulong {
    nix::request_code_none!(TENSTORRENT_IOCTL_MAGIC, nr) as libc::c_ulong
}

// Mapping ids returned by QUERY_MAPPINGS. Resource 0 is BAR0, resource 1 is
// BAR2, resource 2 is BAR4.
pub const MAPPING_UNUSED: u32 = 0;
pub const MAPPING_RESOURCE0_UC: u32 = 1;
pub const MAPPING_RESOURCE0_WC: u32 = 2;
pub const MAPPING_RESOURCE1_UC: u32 = 3;
pub const MAPPING_RESOURCE1_WC: u32 = 4;
pub const MAPPING_RESOURCE2_UC: u32 = 5;
pub const MAPPING_RESOURCE2_WC: u32 = 6;

// PIN_PAGES flags.
pub const PIN_PAGES_CONTIGUOUS: u32 = 1;
pub const PIN_PAGES_NOC_DMA: u32 = 2;

// RESET_DEVICE flags.
pub const RESET_DEVICE_RESTORE_STATE: u32 = 0;
pub const RESET_DEVICE_RESET_PCIE_LINK: u32 = 1;
pub const RESET_DEVICE_CONFIG_WRITE: u32 = 2;

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct GetDeviceInfoIn {
    pub output_size_bytes: u32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct GetDeviceInfoOut {
    pub output_size_bytes: u32,
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub bus_dev_fn: u16,
    pub max_dma_buf_size_log2: u16,
    pub pci_domain: u16,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct GetDeviceInfo {
    pub input: GetDeviceInfoIn,
    pub output: GetDeviceInfoOut,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct Mapping {
    pub mapping_id: u32,
    pub reserved: u32,
    pub mapping_base: u64,
    pub mapping_size: u64,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct QueryMappingsIn {
    pub output_mapping_count: u32,
    pub reserved: u32,
}

pub const MAX_QUERY_MAPPINGS: usize = 8;

/// QUERY_MAPPINGS request with the reply array allocated inline, the way the
/// kernel expects to find it.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct QueryMappings {
    pub input: QueryMappingsIn,
    pub mappings: [Mapping; MAX_QUERY_MAPPINGS],
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct GetDriverInfoIn {
    pub output_size_bytes: u32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct GetDriverInfoOut {
    pub output_size_bytes: u32,
    pub driver_version: u32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct GetDriverInfo {
    pub input: GetDriverInfoIn,
    pub output: GetDriverInfoOut,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct PinPagesIn {
    pub output_size_bytes: u32,
    pub flags: u32,
    pub virtual_address: u64,
    pub size: u64,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct PinPagesOut {
    pub physical_address: u64,
}

/// Extended reply used when `PIN_PAGES_NOC_DMA` is requested.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct PinPagesOutExtended {
    pub physical_address: u64,
    pub noc_address: u64,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct PinPages {
    pub input: PinPagesIn,
    pub output: PinPagesOut,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct PinPagesExtended {
    pub input: PinPagesIn,
    pub output: PinPagesOutExtended,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct UnpinPagesIn {
    pub virtual_address: u64,
    pub size: u64,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct UnpinPages {
    pub input: UnpinPagesIn,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct AllocateDmaBufIn {
    pub requested_size: u64,
    pub buf_index: u8,
    pub reserved: [u8; 7],
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct AllocateDmaBufOut {
    pub physical_address: u64,
    pub mapping_offset: u64,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct AllocateDmaBuf {
    pub input: AllocateDmaBufIn,
    pub output: AllocateDmaBufOut,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ResetDeviceIn {
    pub output_size_bytes: u32,
    pub flags: u32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ResetDeviceOut {
    pub output_size_bytes: u32,
    pub result: u32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct ResetDevice {
    pub input: ResetDeviceIn,
    pub output: ResetDeviceOut,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct AllocateTlbIn {
    pub size: u64,
    pub reserved: u64,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct AllocateTlbOut {
    pub id: u32,
    pub reserved: u32,
    pub mmap_offset_uc: u64,
    pub mmap_offset_wc: u64,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct AllocateTlb {
    pub input: AllocateTlbIn,
    pub output: AllocateTlbOut,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct FreeTlbIn {
    pub id: u32,
}

#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct FreeTlb {
    pub input: FreeTlbIn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_layouts_match_the_kernel_contract() {
        assert_eq!(std::mem::size_of::<Mapping>(), 24);
        assert_eq!(std::mem::size_of::<GetDeviceInfoOut>(), 4 + 7 * 2 + 2);
        assert_eq!(std::mem::size_of::<PinPagesIn>(), 24);
        assert_eq!(std::mem::size_of::<PinPagesOutExtended>(), 16);
        assert_eq!(std::mem::size_of::<UnpinPagesIn>(), 16);
        assert_eq!(std::mem::size_of::<AllocateDmaBufIn>(), 16);
        assert_eq!(std::mem::size_of::<ResetDeviceIn>(), 8);
        assert_eq!(std::mem::size_of::<AllocateTlbOut>(), 24);
    }

    #[test]
    fn request_codes_are_distinct() {
        let codes = [
            request_code(IOCTL_GET_DEVICE_INFO),
            request_code(IOCTL_QUERY_MAPPINGS),
            request_code(IOCTL_ALLOCATE_DMA_BUF),
            request_code(IOCTL_GET_DRIVER_INFO),
            request_code(IOCTL_RESET_DEVICE),
            request_code(IOCTL_PIN_PAGES),
            request_code(IOCTL_UNPIN_PAGES),
            request_code(IOCTL_ALLOCATE_TLB),
            request_code(IOCTL_FREE_TLB),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in codes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
