//! RAII ownership of one kernel-allocated TLB window.

use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use tracing::warn;

use crate::error::{Error, Result};
use crate::kmd::Kmd;
use crate::types::tlb::TlbMapping;

/// Owns one TLB id and the mapping of its window within the BAR. The id is
/// released back to the kernel exactly once, on drop.
pub struct TlbHandle {
    kmd: Arc<Kmd>,
    tlb_id: u32,
    size: u64,
    mapping: MmapRaw,
    tlb_mapping: TlbMapping,
}

impl TlbHandle {
    pub fn allocate(kmd: Arc<Kmd>, size: u64, tlb_mapping: TlbMapping) -> Result<Self> {
        let out = kmd.allocate_tlb(size)?;
        let offset = match tlb_mapping {
            TlbMapping::Uc => out.mmap_offset_uc,
            TlbMapping::Wc => out.mmap_offset_wc,
        };
        let mapping = MmapOptions::new()
            .offset(offset)
            .len(size as usize)
            .map_raw(kmd.file())
            .map_err(|e| {
                // Give the id back; the handle was never constructed.
                let _ = kmd.free_tlb(out.id);
                Error::Configuration(format!("mapping TLB window {} failed: {e}", out.id))
            })?;
        Ok(Self {
            kmd,
            tlb_id: out.id,
            size,
            mapping,
            tlb_mapping,
        })
    }

    pub fn tlb_id(&self) -> u32 {
        self.tlb_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn tlb_mapping(&self) -> TlbMapping {
        self.tlb_mapping
    }

    /// Base of the window in the process address space.
    pub fn base(&self) -> *mut u8 {
        self.mapping.as_mut_ptr()
    }
}

impl std::fmt::Debug for TlbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlbHandle")
            .field("tlb_id", &self.tlb_id)
            .field("size", &self.size)
            .field("tlb_mapping", &self.tlb_mapping)
            .finish()
    }
}

impl Drop for TlbHandle {
    fn drop(&mut self) {
        if let Err(e) = self.kmd.free_tlb(self.tlb_id) {
            warn!(tlb_id = self.tlb_id, "failed to free TLB: {e}");
        }
    }
}
