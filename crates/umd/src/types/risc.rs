//! RISC core selectors for soft-reset control.

use bitflags::bitflags;

bitflags! {
    /// Selects RISC cores inside a tile for reset operations.
    ///
    /// Carries both architecture-agnostic selectors (`ALL`, `ALL_TRISCS`,
    /// `ALL_DATA_MOVEMENT`) and per-architecture ones. Some bits alias:
    /// `ERISC0`/`ERISC1` share the `BRISC`/`TRISC0` fields because an
    /// Ethernet tile never has both. The bits here say nothing about the
    /// layout of any soft-reset register; each architecture table maps
    /// selections to register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RiscType: u64 {
        const ALL = 1 << 0;
        const ALL_TRISCS = 1 << 1;
        const ALL_DATA_MOVEMENT = 1 << 2;

        // Tensix: one TRISC triplet plus BRISC and NCRISC data movement.
        const BRISC = 1 << 3;
        const TRISC0 = 1 << 4;
        const TRISC1 = 1 << 5;
        const TRISC2 = 1 << 6;
        const NCRISC = 1 << 7;

        // Ethernet tiles occupy the same fields.
        const ERISC0 = 1 << 3;
        const ERISC1 = 1 << 4;

        // NEO Tensix: four TRISC quadruplets and eight data movement cores.
        const NEO0_TRISC0 = 1 << 8;
        const NEO0_TRISC1 = 1 << 9;
        const NEO0_TRISC2 = 1 << 10;
        const NEO0_TRISC3 = 1 << 11;
        const NEO1_TRISC0 = 1 << 12;
        const NEO1_TRISC1 = 1 << 13;
        const NEO1_TRISC2 = 1 << 14;
        const NEO1_TRISC3 = 1 << 15;
        const NEO2_TRISC0 = 1 << 16;
        const NEO2_TRISC1 = 1 << 17;
        const NEO2_TRISC2 = 1 << 18;
        const NEO2_TRISC3 = 1 << 19;
        const NEO3_TRISC0 = 1 << 20;
        const NEO3_TRISC1 = 1 << 21;
        const NEO3_TRISC2 = 1 << 22;
        const NEO3_TRISC3 = 1 << 23;

        const DM0 = 1 << 24;
        const DM1 = 1 << 25;
        const DM2 = 1 << 26;
        const DM3 = 1 << 27;
        const DM4 = 1 << 28;
        const DM5 = 1 << 29;
        const DM6 = 1 << 30;
        const DM7 = 1 << 31;

        const ALL_TENSIX_TRISCS = Self::TRISC0.bits() | Self::TRISC1.bits() | Self::TRISC2.bits();
        const ALL_TENSIX_DMS = Self::BRISC.bits() | Self::NCRISC.bits();
        const ALL_TENSIX = Self::ALL_TENSIX_TRISCS.bits() | Self::ALL_TENSIX_DMS.bits();

        const ALL_NEO_TRISCS = 0x00FF_FF00;
        const ALL_NEO_DMS = 0xFF00_0000;
        const ALL_NEO = Self::ALL_NEO_TRISCS.bits() | Self::ALL_NEO_DMS.bits();
    }
}

impl RiscType {
    pub const NONE: RiscType = RiscType::empty();

    /// Everything that was not selected, over the full selectable universe.
    pub fn invert_selected(self) -> RiscType {
        (RiscType::ALL | RiscType::ALL_TENSIX | RiscType::ALL_NEO) & !self
    }
}

bitflags! {
    /// Raw Tensix soft-reset register content plus the staggered-start
    /// request flag in bit 31 (the hardware register ignores it; the driver
    /// consumes it).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TensixSoftResetOptions: u32 {
        const BRISC = 1 << 11;
        const TRISC0 = 1 << 12;
        const TRISC1 = 1 << 13;
        const TRISC2 = 1 << 14;
        const NCRISC = 1 << 18;
        const STAGGERED_START = 1 << 31;
    }
}

/// Holds every RISC on the tile in reset.
pub const TENSIX_ASSERT_SOFT_RESET: TensixSoftResetOptions = TensixSoftResetOptions::BRISC
    .union(TensixSoftResetOptions::TRISC0)
    .union(TensixSoftResetOptions::TRISC1)
    .union(TensixSoftResetOptions::TRISC2)
    .union(TensixSoftResetOptions::NCRISC);

/// Releases BRISC; the TRISCs and NCRISC stay held and are released by the
/// firmware BRISC boots.
pub const TENSIX_DEASSERT_SOFT_RESET: TensixSoftResetOptions = TensixSoftResetOptions::TRISC0
    .union(TensixSoftResetOptions::TRISC1)
    .union(TensixSoftResetOptions::TRISC2)
    .union(TensixSoftResetOptions::NCRISC);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erisc_aliases_brisc() {
        assert_eq!(RiscType::ERISC0, RiscType::BRISC);
        assert_eq!(RiscType::ERISC1, RiscType::TRISC0);
    }

    #[test]
    fn invert_covers_the_universe() {
        let sel = RiscType::BRISC | RiscType::TRISC1;
        let inv = sel.invert_selected();
        assert!(!inv.intersects(sel));
        assert_eq!(
            sel | inv,
            RiscType::ALL | RiscType::ALL_TENSIX | RiscType::ALL_NEO
        );
    }

    #[test]
    fn assert_mask_holds_all_five_riscs() {
        assert_eq!(TENSIX_ASSERT_SOFT_RESET.bits(), 0x4_7800);
        assert!(TENSIX_ASSERT_SOFT_RESET.contains(TensixSoftResetOptions::NCRISC));
        assert!(!TENSIX_DEASSERT_SOFT_RESET.contains(TensixSoftResetOptions::BRISC));
    }
}
