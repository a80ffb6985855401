//! TLB window routing configuration and its register encoding.

/// Cache mode the kernel applies to a TLB's BAR mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbMapping {
    /// Uncached.
    Uc,
    /// Write-combined.
    Wc,
}

/// Memory-ordering class a TLB window requests from the NOC.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum TlbOrdering {
    #[default]
    Relaxed = 0,
    Strict = 1,
    Posted = 2,
}

impl TlbOrdering {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(TlbOrdering::Relaxed),
            1 => Some(TlbOrdering::Strict),
            2 => Some(TlbOrdering::Posted),
            _ => None,
        }
    }
}

/// One TLB window's routing configuration.
///
/// `local_offset` holds the window-granular address (byte address divided by
/// the window size); the remaining fields route to a core or multicast
/// rectangle on the selected NOC.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TlbData {
    pub local_offset: u64,
    pub x_end: u64,
    pub y_end: u64,
    pub x_start: u64,
    pub y_start: u64,
    pub noc_sel: u64,
    pub mcast: bool,
    pub ordering: TlbOrdering,
    pub linked: bool,
    pub static_vc: bool,
    pub static_vc_num: u64,
}

/// Bit positions of each `TlbData` field within a TLB configuration
/// register. The positions differ per window size because the local-offset
/// field narrows as the window grows; each architecture supplies one table
/// per window kind.
#[derive(Debug, Clone, Copy)]
pub struct TlbOffsets {
    pub local_offset: u32,
    pub x_end: u32,
    pub y_end: u32,
    pub x_start: u32,
    pub y_start: u32,
    pub noc_sel: u32,
    pub mcast: u32,
    pub ordering: u32,
    pub linked: u32,
    pub static_vc: u32,
    pub static_vc_num: u32,
}

impl TlbData {
    /// Pack the configuration into the (lower, upper) halves of the TLB
    /// configuration register using the given per-window-size bit layout.
    /// Registers are 8 or 12 bytes; fields that spill past bit 63 land in
    /// the upper word.
    pub fn apply_offset(&self, offsets: &TlbOffsets) -> (u64, u64) {
        let mut lower: u128 = 0;
        let mut put = |value: u64, shift: u32| {
            lower |= (value as u128) << shift;
        };
        put(self.local_offset, offsets.local_offset);
        put(self.x_end, offsets.x_end);
        put(self.y_end, offsets.y_end);
        put(self.x_start, offsets.x_start);
        put(self.y_start, offsets.y_start);
        put(self.noc_sel, offsets.noc_sel);
        put(self.mcast as u64, offsets.mcast);
        put(self.ordering as u64, offsets.ordering);
        put(self.linked as u64, offsets.linked);
        put(self.static_vc as u64, offsets.static_vc);
        put(self.static_vc_num, offsets.static_vc_num);

        ((lower & u64::MAX as u128) as u64, (lower >> 64) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Layout of the 1 MiB Wormhole window, duplicated here so the packing
    // test does not depend on the arch module.
    const OFFSETS: TlbOffsets = TlbOffsets {
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

    #[test]
    fn packs_unicast_fields() {
        let data = TlbData {
            local_offset: 0x3,
            x_end: 1,
            y_end: 1,
            ordering: TlbOrdering::Strict,
            static_vc: true,
            ..Default::default()
        };
        let (lower, upper) = data.apply_offset(&OFFSETS);
        assert_eq!(lower & 0xFFFF, 0x3);
        assert_eq!((lower >> 16) & 0x3F, 1);
        assert_eq!((lower >> 22) & 0x3F, 1);
        assert_eq!((lower >> 42) & 0x3, TlbOrdering::Strict as u64);
        assert_eq!((lower >> 45) & 0x1, 1);
        assert_eq!(upper, 0);
    }

    #[test]
    fn multicast_bit_is_independent_of_rect() {
        let data = TlbData {
            x_start: 1,
            y_start: 0,
            x_end: 9,
            y_end: 11,
            mcast: true,
            ..Default::default()
        };
        let (lower, _) = data.apply_offset(&OFFSETS);
        assert_eq!((lower >> 41) & 0x1, 1);
        assert_eq!((lower >> 28) & 0x3F, 1);
        assert_eq!((lower >> 16) & 0x3F, 9);
    }

    #[test]
    fn fields_past_bit_63_land_in_upper_word() {
        // Blackhole-style layout where the static-vc flag sits above bit 63.
        let wide = TlbOffsets {
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
        let data = TlbData {
            static_vc: true,
            ordering: TlbOrdering::Posted,
            ..Default::default()
        };
        let (_, upper) = data.apply_offset(&wide);
        assert_eq!((upper >> (69 - 64)) & 0x3, TlbOrdering::Posted as u64);
        assert_eq!((upper >> (72 - 64)) & 0x1, 1);
    }
}
