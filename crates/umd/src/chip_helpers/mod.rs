pub mod sysmem_manager;
pub mod tlb_manager;

pub use sysmem_manager::{HugepageMapping, SysmemManager};
pub use tlb_manager::{TlbManager, Writer};
