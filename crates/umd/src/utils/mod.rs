pub mod semver;

pub use semver::SemVer;

/// Minimum kernel driver version for running with an active IOMMU.
pub const KMD_IOMMU: SemVer = SemVer::new(1, 29, 0);

/// Minimum kernel driver version exposing the TLB allocation ioctl. The
/// driver refuses to run against anything older.
pub const KMD_TLBS: SemVer = SemVer::new(1, 34, 0);

/// Minimum kernel driver version that can map pinned buffers into the NOC
/// address space via ioctl. Older drivers poked iATU registers directly,
/// which is unsafe with multiple processes.
pub const KMD_MAP_TO_NOC: SemVer = SemVer::new(2, 0, 0);

/// Minimum kernel driver version with the architecture-agnostic reset ioctl.
pub const KMD_ARCH_AGNOSTIC_RESET: SemVer = SemVer::new(2, 4, 1);

/// Kernel driver versions from here on expose per-device debugfs listings of
/// TLB mappings and owning pids, referenced in allocation failure messages.
pub const KMD_TLB_DEBUGFS: SemVer = SemVer::new(2, 6, 0);
