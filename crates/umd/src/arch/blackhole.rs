//! Blackhole address map and TLB layout.

use crate::types::tlb::TlbOffsets;
use crate::types::{RiscType, XyPair};
use crate::error::{Error, Result};

use super::TlbConfiguration;

pub const TLB_COUNT_2M: u32 = 202;
pub const TLB_COUNT_4G: u32 = 8;

pub const TLB_BASE_INDEX_2M: u32 = 0;
pub const TLB_BASE_INDEX_4G: u32 = TLB_COUNT_2M;

pub const DYNAMIC_TLB_2M_SIZE: u64 = 1 << 21;
pub const DYNAMIC_TLB_4G_SIZE: u64 = 1 << 32;

pub const DYNAMIC_TLB_2M_BASE: u64 = 0;
// 4 GiB windows live in BAR4; their window offsets restart at zero there.
pub const DYNAMIC_TLB_4G_BASE: u64 = 0;

pub const TLB_CFG_REG_ADDR_BASE: u32 = 0x1FC0_0000;
pub const TLB_CFG_REG_SIZE_BYTES: u32 = 12;

pub const DYNAMIC_TLB_2M_CFG_ADDR: u32 = TLB_CFG_REG_ADDR_BASE + TLB_BASE_INDEX_2M * TLB_CFG_REG_SIZE_BYTES;
pub const DYNAMIC_TLB_4G_CFG_ADDR: u32 = TLB_CFG_REG_ADDR_BASE + TLB_BASE_INDEX_4G * TLB_CFG_REG_SIZE_BYTES;

pub const REG_TLB: u32 = TLB_COUNT_2M - 1;

/// Byte addresses at or above this pivot select BAR4 rather than BAR0.
pub const BAR0_SIZE: u64 = 512 * 1024 * 1024;

pub const NOC_ADDR_LOCAL_BITS: u32 = 36;
pub const NOC_ADDR_NODE_ID_BITS: u32 = 6;

// Blackhole TLB configuration registers are 12 bytes; the local-offset field
// is 64-bit aligned at 43 bits for 2 MiB windows and 32 bits for 4 GiB ones.
pub const TLB_2M_OFFSET: TlbOffsets = TlbOffsets {
    local_offset: 0,
    x_end: 43,
    y_end: 49,
    x_start: 55,
    y_start: 61,
    noc_sel: 67,
    mcast: 68,
    ordering: 69,
    linked: 71,
    static_vc: 72,
    static_vc_num: 73,
};

pub const TLB_4G_OFFSET: TlbOffsets = TlbOffsets {
    local_offset: 0,
    x_end: 32,
    y_end: 38,
    x_start: 44,
    y_start: 50,
    noc_sel: 56,
    mcast: 57,
    ordering: 58,
    linked: 60,
    static_vc: 61,
    static_vc_num: 62,
};

// ARC addresses, BAR0-relative.
pub const ARC_AXI_APB_PERIPHERAL_OFFSET: u32 = 0x1FF0_0000;
pub const ARC_RESET_SCRATCH_OFFSET: u32 = 0x1FF3_0060;
pub const ARC_RESET_ARC_MISC_CNTL_OFFSET: u32 = 0x1FF3_0100;
pub const ARC_SCRATCH_RES0_OFFSET: u32 = 3;
pub const ARC_SCRATCH_RES1_OFFSET: u32 = 4;
pub const ARC_SCRATCH_STATUS_OFFSET: u32 = 5;
pub const ARC_MSG_COMMON_PREFIX: u32 = 0xAA00;

pub const READ_CHECKING_OFFSET: u32 = ARC_RESET_SCRATCH_OFFSET + 6 * 4;

pub const TENSIX_SOFT_RESET_ADDR: u64 = 0xFFB1_21B0;
pub const L1_BARRIER_BASE: u64 = 0x16_DFC0;
pub const ERISC_BARRIER_BASE: u64 = 0x3_F0F8;
pub const DRAM_BARRIER_BASE: u64 = 0x0;

pub const SOFT_RESET_BRISC: u32 = 1 << 11;
pub const SOFT_RESET_TRISC0: u32 = 1 << 12;
pub const SOFT_RESET_TRISC1: u32 = 1 << 13;
pub const SOFT_RESET_TRISC2: u32 = 1 << 14;
pub const SOFT_RESET_NCRISC: u32 = 1 << 18;

/// DRAM columns. The multicast emulation on simulators must skip these when
/// they intersect the requested rectangle.
pub const DRAM_COLUMNS: [u32; 2] = [8, 9];

pub fn get_tlb_configuration(tlb_index: u32) -> TlbConfiguration {
    if tlb_index >= TLB_BASE_INDEX_4G && tlb_index < TLB_BASE_INDEX_4G + TLB_COUNT_4G {
        TlbConfiguration {
            size: DYNAMIC_TLB_4G_SIZE,
            base: DYNAMIC_TLB_4G_BASE,
            cfg_addr: DYNAMIC_TLB_4G_CFG_ADDR,
            index_offset: tlb_index - TLB_BASE_INDEX_4G,
            offsets: &TLB_4G_OFFSET,
        }
    } else {
        TlbConfiguration {
            size: DYNAMIC_TLB_2M_SIZE,
            base: DYNAMIC_TLB_2M_BASE,
            cfg_addr: DYNAMIC_TLB_2M_CFG_ADDR,
            index_offset: tlb_index - TLB_BASE_INDEX_2M,
            offsets: &TLB_2M_OFFSET,
        }
    }
}

pub fn multicast_workaround(mut start: XyPair, end: XyPair) -> (XyPair, XyPair) {
    // Same exclusion as Wormhole: keep the PCIe column out of the rectangle.
    if start.x == 0 {
        start.x = 1;
    }
    (start, end)
}

pub fn get_soft_reset_reg_value(mut risc_type: RiscType) -> Result<u32> {
    if risc_type.intersects(RiscType::ALL_NEO) {
        return Err(Error::InvalidArgument(
            "NEO risc cores are not present on the Blackhole architecture".into(),
        ));
    }

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
