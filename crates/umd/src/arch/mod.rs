//! Per-architecture address maps and register layouts.
//!
//! Everything that differs between Wormhole and Blackhole is dispatched
//! through [`Arch`]; the rest of the driver never matches on the
//! architecture directly except where a documented erratum forces it.

pub mod blackhole;
pub mod wormhole;

use crate::error::{Error, Result};
use crate::types::tlb::TlbOffsets;
use crate::types::{RiscType, XyPair};

const ONE_MB: u64 = 1 << 20;
const ONE_GB: u64 = 1 << 30;

/// PCIe device id of a Wormhole chip.
pub const WH_PCIE_DEVICE_ID: u16 = 0x401E;
/// PCIe device id of a Blackhole chip.
pub const BH_PCIE_DEVICE_ID: u16 = 0xB140;

/// Location and register layout of one TLB window, resolved by index.
#[derive(Debug, Clone, Copy)]
pub struct TlbConfiguration {
    /// Window size in bytes.
    pub size: u64,
    /// Base of this window group within the BAR.
    pub base: u64,
    /// Address of the first configuration register of this window group.
    pub cfg_addr: u32,
    /// Index of the window within its group.
    pub index_offset: u32,
    /// Field bit layout of the configuration register.
    pub offsets: &'static TlbOffsets,
}

impl TlbConfiguration {
    /// BAR-relative base of this specific window.
    pub fn window_base(&self) -> u64 {
        self.base + self.size * self.index_offset as u64
    }

    /// Address of this specific window's configuration register.
    pub fn cfg_reg_addr(&self, reg_size_bytes: u32) -> u32 {
        self.cfg_addr + reg_size_bytes * self.index_offset
    }
}

/// Queue and flag constants for the on-die Ethernet routing firmware.
#[derive(Debug, Clone, Copy)]
pub struct EthInterfaceParams {
    pub eth_rack_coord_width: u32,
    pub cmd_buf_size: u32,
    pub cmd_buf_size_mask: u32,
    pub cmd_buf_ptr_mask: u32,
    pub max_block_size: u32,
    pub request_cmd_queue_base: u64,
    pub response_cmd_queue_base: u64,
    pub cmd_counters_size_bytes: u32,
    pub remote_update_ptr_size_bytes: u32,
    pub eth_routing_data_buffer_addr: u64,
    pub cmd_wr_req: u32,
    pub cmd_wr_ack: u32,
    pub cmd_rd_req: u32,
    pub cmd_rd_data: u32,
    pub cmd_data_block: u32,
    pub cmd_data_block_dram: u32,
    pub cmd_ordered: u32,
    pub cmd_broadcast: u32,
}

/// Routing queue geometry shared by both supported architectures.
pub const ETH_INTERFACE_PARAMS: EthInterfaceParams = EthInterfaceParams {
    eth_rack_coord_width: 6,
    cmd_buf_size: 4,
    cmd_buf_size_mask: 0x3,
    cmd_buf_ptr_mask: 0x7,
    max_block_size: 1024,
    request_cmd_queue_base: 0x1_9A00,
    response_cmd_queue_base: 0x1_9B00,
    cmd_counters_size_bytes: 0x20,
    remote_update_ptr_size_bytes: 16,
    eth_routing_data_buffer_addr: 0x1_A000,
    cmd_wr_req: 0x1,
    cmd_wr_ack: 0x2,
    cmd_rd_req: 0x4,
    cmd_rd_data: 0x8,
    cmd_data_block: 0x40,
    cmd_data_block_dram: 0x1000,
    cmd_ordered: 0x2000,
    cmd_broadcast: 0x4000,
};

/// Supported silicon architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Wormhole,
    Blackhole,
}

impl Arch {
    pub fn from_pcie_device_id(device_id: u16) -> Option<Arch> {
        match device_id {
            WH_PCIE_DEVICE_ID => Some(Arch::Wormhole),
            BH_PCIE_DEVICE_ID => Some(Arch::Blackhole),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Arch::Wormhole => "wormhole_b0",
            Arch::Blackhole => "blackhole",
        }
    }

    /// Legal TLB window sizes, largest first. Allocation probes walk this
    /// list until the kernel grants one.
    pub fn tlb_sizes(&self) -> &'static [u64] {
        match self {
            Arch::Wormhole => &[16 * ONE_MB, 2 * ONE_MB, ONE_MB],
            Arch::Blackhole => &[4 * ONE_GB, 2 * ONE_MB],
        }
    }

    pub fn tlb_cfg_reg_size_bytes(&self) -> u32 {
        match self {
            Arch::Wormhole => wormhole::TLB_CFG_REG_SIZE_BYTES,
            Arch::Blackhole => blackhole::TLB_CFG_REG_SIZE_BYTES,
        }
    }

    pub fn get_tlb_configuration(&self, tlb_index: u32) -> TlbConfiguration {
        match self {
            Arch::Wormhole => wormhole::get_tlb_configuration(tlb_index),
            Arch::Blackhole => blackhole::get_tlb_configuration(tlb_index),
        }
    }

    /// Dynamic TLB reserved for the block transfer loop.
    pub fn reg_tlb(&self) -> u32 {
        match self {
            Arch::Wormhole => wormhole::REG_TLB,
            Arch::Blackhole => blackhole::REG_TLB,
        }
    }

    /// Static virtual channel for host-programmed windows. Blackhole A0 can
    /// deadlock when reads and writes share a static VC, so it runs with
    /// dynamic VC selection instead.
    pub fn use_static_vc(&self) -> bool {
        match self {
            Arch::Wormhole => true,
            Arch::Blackhole => false,
        }
    }

    pub fn static_vc(&self) -> u64 {
        match self {
            Arch::Wormhole => wormhole::STATIC_VC,
            Arch::Blackhole => 0,
        }
    }

    pub fn multicast_workaround(&self, start: XyPair, end: XyPair) -> (XyPair, XyPair) {
        match self {
            Arch::Wormhole => wormhole::multicast_workaround(start, end),
            Arch::Blackhole => blackhole::multicast_workaround(start, end),
        }
    }

    pub fn get_soft_reset_reg_value(&self, risc_type: RiscType) -> Result<u32> {
        match self {
            Arch::Wormhole => wormhole::get_soft_reset_reg_value(risc_type),
            Arch::Blackhole => blackhole::get_soft_reset_reg_value(risc_type),
        }
    }

    pub fn get_soft_reset_risc_type(&self, value: u32) -> RiscType {
        match self {
            Arch::Wormhole => wormhole::get_soft_reset_risc_type(value),
            Arch::Blackhole => blackhole::get_soft_reset_risc_type(value),
        }
    }

    pub fn tensix_soft_reset_addr(&self) -> u64 {
        match self {
            Arch::Wormhole => wormhole::TENSIX_SOFT_RESET_ADDR,
            Arch::Blackhole => blackhole::TENSIX_SOFT_RESET_ADDR,
        }
    }

    pub fn l1_barrier_base(&self) -> u64 {
        match self {
            Arch::Wormhole => wormhole::L1_BARRIER_BASE,
            Arch::Blackhole => blackhole::L1_BARRIER_BASE,
        }
    }

    pub fn erisc_barrier_base(&self) -> u64 {
        match self {
            Arch::Wormhole => wormhole::ERISC_BARRIER_BASE,
            Arch::Blackhole => blackhole::ERISC_BARRIER_BASE,
        }
    }

    pub fn dram_barrier_base(&self) -> u64 {
        match self {
            Arch::Wormhole => wormhole::DRAM_BARRIER_BASE,
            Arch::Blackhole => blackhole::DRAM_BARRIER_BASE,
        }
    }

    pub fn arc_reset_scratch_offset(&self) -> u32 {
        match self {
            Arch::Wormhole => wormhole::ARC_RESET_SCRATCH_OFFSET,
            Arch::Blackhole => blackhole::ARC_RESET_SCRATCH_OFFSET,
        }
    }

    pub fn arc_reset_arc_misc_cntl_offset(&self) -> u32 {
        match self {
            Arch::Wormhole => wormhole::ARC_RESET_ARC_MISC_CNTL_OFFSET,
            Arch::Blackhole => blackhole::ARC_RESET_ARC_MISC_CNTL_OFFSET,
        }
    }

    /// Index of the scratch register carrying the first firmware result.
    pub fn arc_scratch_res0_offset(&self) -> u32 {
        match self {
            Arch::Wormhole => wormhole::ARC_SCRATCH_RES0_OFFSET,
            Arch::Blackhole => blackhole::ARC_SCRATCH_RES0_OFFSET,
        }
    }

    pub fn arc_scratch_res1_offset(&self) -> u32 {
        match self {
            Arch::Wormhole => wormhole::ARC_SCRATCH_RES1_OFFSET,
            Arch::Blackhole => blackhole::ARC_SCRATCH_RES1_OFFSET,
        }
    }

    /// Index of the scratch register the message code and status live in.
    pub fn arc_scratch_status_offset(&self) -> u32 {
        match self {
            Arch::Wormhole => wormhole::ARC_SCRATCH_STATUS_OFFSET,
            Arch::Blackhole => blackhole::ARC_SCRATCH_STATUS_OFFSET,
        }
    }

    pub fn arc_msg_common_prefix(&self) -> u32 {
        match self {
            Arch::Wormhole => wormhole::ARC_MSG_COMMON_PREFIX,
            Arch::Blackhole => blackhole::ARC_MSG_COMMON_PREFIX,
        }
    }

    pub fn read_checking_offset(&self) -> u32 {
        match self {
            Arch::Wormhole => wormhole::READ_CHECKING_OFFSET,
            Arch::Blackhole => blackhole::READ_CHECKING_OFFSET,
        }
    }

    /// BAR0/BAR4 pivot. `None` means everything routes through BAR0.
    pub fn bar0_wc_pivot(&self) -> Option<u64> {
        match self {
            Arch::Wormhole => None,
            Arch::Blackhole => Some(blackhole::BAR0_SIZE),
        }
    }

    /// Whether block transfers must go through the word-sized device memcpy.
    /// A Wormhole GDDR controller erratum forbids byte writes temporally
    /// adjacent to 2-byte writes.
    pub fn needs_custom_memcpy(&self) -> bool {
        matches!(self, Arch::Wormhole)
    }

    /// Whether the staged PCIe DMA engine path is available.
    pub fn supports_dma_buffer(&self) -> bool {
        matches!(self, Arch::Wormhole)
    }

    pub fn eth_interface_params(&self) -> &'static EthInterfaceParams {
        &ETH_INTERFACE_PARAMS
    }

    pub fn remote_transfer_eth_cores(&self) -> Result<&'static [XyPair]> {
        match self {
            Arch::Wormhole => Ok(&wormhole::REMOTE_TRANSFER_ETH_CORES),
            Arch::Blackhole => Err(Error::Configuration(
                "remote ethernet tunneling is only supported on Wormhole".into(),
            )),
        }
    }

    /// Simulator columns that never host tensix and must be skipped when a
    /// multicast is decomposed into unicasts.
    pub fn multicast_excluded_columns(&self) -> &'static [u32] {
        match self {
            Arch::Wormhole => &[],
            Arch::Blackhole => &blackhole::DRAM_COLUMNS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tlb_sizes_are_descending() {
        for arch in [Arch::Wormhole, Arch::Blackhole] {
            let sizes = arch.tlb_sizes();
            assert!(sizes.windows(2).all(|w| w[0] > w[1]), "{arch:?}");
        }
    }

    #[test]
    fn wormhole_tlb_groups_resolve_by_index() {
        let cfg = Arch::Wormhole.get_tlb_configuration(0);
        assert_eq!(cfg.size, 1 << 20);
        assert_eq!(cfg.window_base(), 0);

        let cfg = Arch::Wormhole.get_tlb_configuration(wormhole::TLB_BASE_INDEX_2M + 1);
        assert_eq!(cfg.size, 1 << 21);
        assert_eq!(cfg.window_base(), wormhole::DYNAMIC_TLB_2M_BASE + (1 << 21));

        let cfg = Arch::Wormhole.get_tlb_configuration(wormhole::REG_TLB);
        assert_eq!(cfg.size, 1 << 24);
        assert_eq!(
            cfg.cfg_reg_addr(8),
            wormhole::DYNAMIC_TLB_16M_CFG_ADDR + 8 * 18
        );
    }

    #[test]
    fn multicast_workaround_excludes_pcie_column() {
        let (start, end) =
            Arch::Wormhole.multicast_workaround(XyPair::new(0, 0), XyPair::new(9, 11));
        assert_eq!(start, XyPair::new(1, 0));
        assert_eq!(end, XyPair::new(9, 11));

        let (start, _) =
            Arch::Wormhole.multicast_workaround(XyPair::new(2, 3), XyPair::new(5, 5));
        assert_eq!(start, XyPair::new(2, 3));
    }

    #[test]
    fn neo_selectors_are_rejected() {
        assert!(Arch::Wormhole
            .get_soft_reset_reg_value(RiscType::NEO0_TRISC0)
            .is_err());
        assert!(Arch::Blackhole
            .get_soft_reset_reg_value(RiscType::DM3)
            .is_err());
    }

    proptest! {
        // Any subset of the five Tensix RISC bits round-trips through the
        // register encoding on both architectures.
        #[test]
        fn soft_reset_round_trips(bits in 0u8..32) {
            let singles = [
                RiscType::BRISC,
                RiscType::TRISC0,
                RiscType::TRISC1,
                RiscType::TRISC2,
                RiscType::NCRISC,
            ];
            let mut selected = RiscType::NONE;
            for (i, s) in singles.iter().enumerate() {
                if bits & (1 << i) != 0 {
                    selected |= *s;
                }
            }
            for arch in [Arch::Wormhole, Arch::Blackhole] {
                let reg = arch.get_soft_reset_reg_value(selected).unwrap();
                let mut expected = selected;
                if expected.contains(RiscType::ALL_TENSIX_TRISCS) {
                    expected |= RiscType::ALL_TRISCS;
                }
                if expected.contains(RiscType::ALL_TENSIX_DMS) {
                    expected |= RiscType::ALL_DATA_MOVEMENT;
                }
                if expected.contains(RiscType::ALL_TENSIX) {
                    expected |= RiscType::ALL;
                }
                prop_assert_eq!(arch.get_soft_reset_risc_type(reg), expected);
            }
        }
    }
}
