//! Wormhole address map and TLB layout.

use crate::types::tlb::TlbOffsets;
use crate::types::{RiscType, XyPair};
use crate::error::{Error, Result};

use super::TlbConfiguration;

pub const TLB_COUNT_1M: u32 = 156;
pub const TLB_COUNT_2M: u32 = 10;
pub const TLB_COUNT_16M: u32 = 20;

pub const TLB_BASE_INDEX_1M: u32 = 0;
pub const TLB_BASE_INDEX_2M: u32 = TLB_COUNT_1M;
pub const TLB_BASE_INDEX_16M: u32 = TLB_COUNT_1M + TLB_COUNT_2M;

pub const DYNAMIC_TLB_1M_SIZE: u64 = 1 << 20;
pub const DYNAMIC_TLB_2M_SIZE: u64 = 1 << 21;
pub const DYNAMIC_TLB_16M_SIZE: u64 = 1 << 24;

pub const DYNAMIC_TLB_1M_BASE: u64 = 0;
pub const DYNAMIC_TLB_2M_BASE: u64 = TLB_COUNT_1M as u64 * DYNAMIC_TLB_1M_SIZE;
pub const DYNAMIC_TLB_16M_BASE: u64 = DYNAMIC_TLB_2M_BASE + TLB_COUNT_2M as u64 * DYNAMIC_TLB_2M_SIZE;

pub const TLB_CFG_REG_ADDR_BASE: u32 = 0x1FC0_0000;
pub const TLB_CFG_REG_SIZE_BYTES: u32 = 8;

pub const DYNAMIC_TLB_1M_CFG_ADDR: u32 = TLB_CFG_REG_ADDR_BASE + TLB_BASE_INDEX_1M * TLB_CFG_REG_SIZE_BYTES;
pub const DYNAMIC_TLB_2M_CFG_ADDR: u32 = TLB_CFG_REG_ADDR_BASE + TLB_BASE_INDEX_2M * TLB_CFG_REG_SIZE_BYTES;
pub const DYNAMIC_TLB_16M_CFG_ADDR: u32 = TLB_CFG_REG_ADDR_BASE + TLB_BASE_INDEX_16M * TLB_CFG_REG_SIZE_BYTES;

/// 16 MiB windows reserved for the large-block read/write paths and the
/// register access path.
pub const MEM_LARGE_READ_TLB: u32 = TLB_BASE_INDEX_16M + 16;
pub const MEM_LARGE_WRITE_TLB: u32 = TLB_BASE_INDEX_16M + 17;
pub const REG_TLB: u32 = TLB_BASE_INDEX_16M + 18;

pub const STATIC_VC: u64 = 2;

// NOC addressing: 36 local address bits, 6 node-id bits per axis.
pub const NOC_ADDR_LOCAL_BITS: u32 = 36;
pub const NOC_ADDR_NODE_ID_BITS: u32 = 6;

// Field layouts of the TLB configuration register. The local-offset field is
// (36 - log2(window size)) bits wide, so every other field slides down as the
// window grows.
pub const TLB_1M_OFFSET: TlbOffsets = TlbOffsets {
    local_offset: 0,
    x_end: 16,
    y_end: 22,
    x_start: 28,
    y_start: 34,
    noc_sel: 40,
    mcast: 41,
    ordering: 42,
    linked: 44,
    static_vc: 45,
    static_vc_num: 46,
};

pub const TLB_2M_OFFSET: TlbOffsets = TlbOffsets {
    local_offset: 0,
    x_end: 15,
    y_end: 21,
    x_start: 27,
    y_start: 33,
    noc_sel: 39,
    mcast: 40,
    ordering: 41,
    linked: 43,
    static_vc: 44,
    static_vc_num: 45,
};

pub const TLB_16M_OFFSET: TlbOffsets = TlbOffsets {
    local_offset: 0,
    x_end: 12,
    y_end: 18,
    x_start: 24,
    y_start: 30,
    noc_sel: 36,
    mcast: 37,
    ordering: 38,
    linked: 40,
    static_vc: 41,
    static_vc_num: 42,
};

// ARC addresses, BAR0-relative.
pub const ARC_AXI_APB_PERIPHERAL_OFFSET: u32 = 0x1FF0_0000;
pub const ARC_RESET_SCRATCH_OFFSET: u32 = 0x1FF3_0060;
pub const ARC_RESET_ARC_MISC_CNTL_OFFSET: u32 = 0x1FF3_0100;
pub const ARC_SCRATCH_RES0_OFFSET: u32 = 3;
pub const ARC_SCRATCH_RES1_OFFSET: u32 = 4;
pub const ARC_SCRATCH_STATUS_OFFSET: u32 = 5;
pub const ARC_MSG_COMMON_PREFIX: u32 = 0xAA00;

/// Scratch register 6, probed to distinguish a hung chip from a read that
/// legitimately returned all-ones.
pub const READ_CHECKING_OFFSET: u32 = ARC_RESET_SCRATCH_OFFSET + 6 * 4;

// ARC-driven PCIe DMA engine. The request block lives in ARC CSM; the
// host-physical high word sits in its own register because the request only
// carries the low 32 bits.
pub const ARC_CSM_DMA_REQUEST_OFFSET: u32 = 0x1FEF_84C8;
pub const ARC_CSM_DMA_HOST_PHYS_ADDR_HIGH_OFFSET: u32 = 0x1FEF_84F8;

// Tensix tile addresses.
pub const TENSIX_SOFT_RESET_ADDR: u64 = 0xFFB1_21B0;
pub const L1_BARRIER_BASE: u64 = 0x16_DFC0;
pub const ERISC_BARRIER_BASE: u64 = 0x3_F0F8;
pub const DRAM_BARRIER_BASE: u64 = 0x0;

// Soft reset register bits.
pub const SOFT_RESET_BRISC: u32 = 1 << 11;
pub const SOFT_RESET_TRISC0: u32 = 1 << 12;
pub const SOFT_RESET_TRISC1: u32 = 1 << 13;
pub const SOFT_RESET_TRISC2: u32 = 1 << 14;
pub const SOFT_RESET_NCRISC: u32 = 1 << 18;

/// Ethernet worker cores reserved for the host-to-remote transport, in the
/// round-robin order the routing firmware expects (NOC0 coordinates).
pub const REMOTE_TRANSFER_ETH_CORES: [XyPair; 16] = [
    XyPair::new(9, 0),
    XyPair::new(1, 0),
    XyPair::new(8, 0),
    XyPair::new(2, 0),
    XyPair::new(7, 0),
    XyPair::new(3, 0),
    XyPair::new(6, 0),
    XyPair::new(4, 0),
    XyPair::new(9, 6),
    XyPair::new(1, 6),
    XyPair::new(8, 6),
    XyPair::new(2, 6),
    XyPair::new(7, 6),
    XyPair::new(3, 6),
    XyPair::new(6, 6),
    XyPair::new(4, 6),
];

pub fn get_tlb_configuration(tlb_index: u32) -> TlbConfiguration {
    if tlb_index >= TLB_BASE_INDEX_16M {
        TlbConfiguration {
            size: DYNAMIC_TLB_16M_SIZE,
            base: DYNAMIC_TLB_16M_BASE,
            cfg_addr: DYNAMIC_TLB_16M_CFG_ADDR,
            index_offset: tlb_index - TLB_BASE_INDEX_16M,
            offsets: &TLB_16M_OFFSET,
        }
    } else if tlb_index >= TLB_BASE_INDEX_2M {
        TlbConfiguration {
            size: DYNAMIC_TLB_2M_SIZE,
            base: DYNAMIC_TLB_2M_BASE,
            cfg_addr: DYNAMIC_TLB_2M_CFG_ADDR,
            index_offset: tlb_index - TLB_BASE_INDEX_2M,
            offsets: &TLB_2M_OFFSET,
        }
    } else {
        TlbConfiguration {
            size: DYNAMIC_TLB_1M_SIZE,
            base: DYNAMIC_TLB_1M_BASE,
            cfg_addr: DYNAMIC_TLB_1M_CFG_ADDR,
            index_offset: tlb_index - TLB_BASE_INDEX_1M,
            offsets: &TLB_1M_OFFSET,
        }
    }
}

/// When multicasting there is a rare case where including the multicasting
/// node in the box can result in a backup and the multicasted data not
/// reaching all endpoints. Excluding the PCIe column costs nothing: column 0
/// has no tensix.
pub fn multicast_workaround(mut start: XyPair, end: XyPair) -> (XyPair, XyPair) {
    if start.x == 0 {
        start.x = 1;
    }
    (start, end)
}

pub fn get_soft_reset_reg_value(mut risc_type: RiscType) -> Result<u32> {
    if risc_type.intersects(RiscType::ALL_NEO) {
        return Err(Error::InvalidArgument(
            "NEO risc cores are not present on the Wormhole architecture".into(),
        ));
    }

    // Expand architecture-agnostic selectors into Tensix bits.
    if risc_type.intersects(RiscType::ALL) {
        risc_type |= RiscType::ALL_TENSIX;
    }
    if risc_type.intersects(RiscType::ALL_TRISCS) {
        risc_type |= RiscType::ALL_TENSIX_TRISCS;
    }
    if risc_type.intersects(RiscType::ALL_DATA_MOVEMENT) {
        risc_type |= RiscType::ALL_TENSIX_DMS;
    }

    let mut value = 0;
    if risc_type.intersects(RiscType::BRISC) {
        value |= SOFT_RESET_BRISC;
    }
    if risc_type.intersects(RiscType::TRISC0) {
        value |= SOFT_RESET_TRISC0;
    }
    if risc_type.intersects(RiscType::TRISC1) {
        value |= SOFT_RESET_TRISC1;
    }
    if risc_type.intersects(RiscType::TRISC2) {
        value |= SOFT_RESET_TRISC2;
    }
    if risc_type.intersects(RiscType::NCRISC) {
        value |= SOFT_RESET_NCRISC;
    }
    Ok(value)
}

pub fn get_soft_reset_risc_type(value: u32) -> RiscType {
    let mut risc_type = RiscType::NONE;
    if value & SOFT_RESET_BRISC != 0 {
        risc_type |= RiscType::BRISC;
    }
    if value & SOFT_RESET_TRISC0 != 0 {
        risc_type |= RiscType::TRISC0;
    }
    if value & SOFT_RESET_TRISC1 != 0 {
        risc_type |= RiscType::TRISC1;
    }
    if value & SOFT_RESET_TRISC2 != 0 {
        risc_type |= RiscType::TRISC2;
    }
    if value & SOFT_RESET_NCRISC != 0 {
        risc_type |= RiscType::NCRISC;
    }

    // Derive the agnostic selectors back from the Tensix bits.
    if risc_type.contains(RiscType::ALL_TENSIX) {
        risc_type |= RiscType::ALL;
    }
    if risc_type.contains(RiscType::ALL_TENSIX_TRISCS) {
        risc_type |= RiscType::ALL_TRISCS;
    }
    if risc_type.contains(RiscType::ALL_TENSIX_DMS) {
        risc_type |= RiscType::ALL_DATA_MOVEMENT;
    }
    risc_type
}
