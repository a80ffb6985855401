//! Per-chip inventory of configured TLB windows.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::pcie::pci_device::PciDevice;
use crate::pcie::tlb_window::TlbWindow;
use crate::types::tlb::{TlbData, TlbMapping, TlbOrdering};
use crate::types::XyPair;

/// Write-through pointer for hot-path sequential writes to one static
/// window. Skips the window lookup on every store.
pub struct Writer {
    base: *mut u8,
    size: u64,
}

unsafe impl Send for Writer {}

impl Writer {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn write32(&self, offset: u64, value: u32) -> Result<()> {
        if offset + 4 > self.size {
            return Err(Error::InvalidArgument(format!(
                "write at {offset:#x} exceeds static TLB of {:#x} bytes",
                self.size
            )));
        }
        unsafe {
            (self.base.add(offset as usize) as *mut u32).write_volatile(value);
        }
        Ok(())
    }
}

/// Owns every statically-configured window on one chip. Invariant: a core is
/// mapped by at most one window at a time.
pub struct TlbManager {
    device: Arc<PciDevice>,
    map_core_to_tlb: HashMap<XyPair, u32>,
    tlb_windows: HashMap<u32, TlbWindow>,
    /// Window-aligned device address each window was configured to.
    tlb_config_map: HashMap<u32, u64>,
}

impl TlbManager {
    pub fn new(device: Arc<PciDevice>) -> Self {
        Self {
            device,
            map_core_to_tlb: HashMap::new(),
            tlb_windows: HashMap::new(),
            tlb_config_map: HashMap::new(),
        }
    }

    /// Configure a window routing `(core, address)`. A `tlb_size` of zero
    /// probes the architecture's legal sizes from largest to smallest.
    pub fn configure_tlb(
        &mut self,
        core: XyPair,
        tlb_size: u64,
        address: u64,
        ordering: TlbOrdering,
    ) -> Result<()> {
        if self.is_tlb_mapped(core) {
            return Err(Error::InvalidArgument(format!(
                "core {core} is already mapped by a TLB window"
            )));
        }

        debug!(
            chip = self.device.get_device_num(),
            core = %core,
            size = tlb_size,
            address = format_args!("{address:#x}"),
            ?ordering,
            "configuring TLB"
        );

        let arch = self.device.get_arch();
        let config = TlbData {
            local_offset: address,
            x_end: core.x as u64,
            y_end: core.y as u64,
            x_start: 0,
            y_start: 0,
            noc_sel: crate::use_noc1() as u64,
            mcast: false,
            ordering,
            linked: false,
            static_vc: arch.use_static_vc(),
            static_vc_num: arch.static_vc(),
        };

        let handle = self.device.allocate_tlb(tlb_size, TlbMapping::Wc)?;
        let tlb_id = handle.tlb_id();
        let window_size = handle.size();
        let window = TlbWindow::new(handle, Arc::clone(&self.device), config)?;

        self.tlb_config_map
            .insert(tlb_id, (address / window_size) * window_size);
        self.map_core_to_tlb.insert(core, tlb_id);
        self.tlb_windows.insert(tlb_id, window);
        Ok(())
    }

    pub fn get_tlb_window(&self, core: XyPair) -> Result<&TlbWindow> {
        let tlb_id = self.map_core_to_tlb.get(&core).ok_or_else(|| {
            Error::InvalidArgument(format!("TLB window for core {core} not found"))
        })?;
        Ok(&self.tlb_windows[tlb_id])
    }

    pub fn get_tlb_window_mut(&mut self, core: XyPair) -> Result<&mut TlbWindow> {
        let tlb_id = *self.map_core_to_tlb.get(&core).ok_or_else(|| {
            Error::InvalidArgument(format!("TLB window for core {core} not found"))
        })?;
        Ok(self.tlb_windows.get_mut(&tlb_id).unwrap())
    }

    pub fn is_tlb_mapped(&self, core: XyPair) -> bool {
        self.map_core_to_tlb.contains_key(&core)
    }

    /// Whether `core` is mapped and `[address, address + size)` lies fully
    /// within its window.
    pub fn is_tlb_mapped_range(&self, core: XyPair, address: u64, size: u64) -> bool {
        let Ok(window) = self.get_tlb_window(core) else {
            return false;
        };
        window.get_base_address() <= address
            && address + size <= window.get_base_address() + window.get_size()
    }

    /// Write-through pointer into `core`'s static window.
    pub fn get_static_tlb_writer(&self, core: XyPair) -> Result<Writer> {
        let window = self.get_tlb_window(core)?;
        Ok(Writer {
            base: window.handle().base(),
            size: window.get_size(),
        })
    }

    pub fn configured_base(&self, core: XyPair) -> Option<u64> {
        let tlb_id = self.map_core_to_tlb.get(&core)?;
        self.tlb_config_map.get(tlb_id).copied()
    }

    pub fn device(&self) -> &Arc<PciDevice> {
        &self.device
    }

    /// Every mapped core, for invariant checks and membar sweeps.
    pub fn mapped_cores(&self) -> impl Iterator<Item = &XyPair> {
        self.map_core_to_tlb.keys()
    }
}

impl std::fmt::Debug for TlbManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlbManager")
            .field("windows", &self.tlb_windows.len())
            .finish()
    }
}
