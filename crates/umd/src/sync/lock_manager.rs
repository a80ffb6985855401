//! Inventory of the named mutexes that serialize shared hardware resources.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracing::warn;

use crate::error::Result;

use super::robust_mutex::{MutexKind, RobustMutex};

/// Hardware resources with cross-process shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutexType {
    /// Dynamic-TLB reprogramming and block transfers on one PCIe device.
    DeviceIo(usize),
    /// ARC firmware messages on one PCIe device.
    ArcMsg(usize),
    /// Simulator I/O; the simulator is single-threaded.
    Simulator,
}

impl MutexType {
    fn name(&self) -> String {
        match self {
            MutexType::DeviceIo(device) => format!("TT_DEVICE_IO.{device}"),
            MutexType::ArcMsg(device) => format!("ARC_MSG.{device}"),
            MutexType::Simulator => "TT_SIMULATOR".to_string(),
        }
    }
}

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<RobustMutex>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// RAII guard over an acquired named mutex.
pub struct MutexGuard {
    mutex: Arc<RobustMutex>,
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            // Unwinding path; report instead of propagating.
            warn!(mutex = %self.mutex.name(), "unlock failed: {e}");
        }
    }
}

/// Hands out the process's named mutexes, creating each on first use.
#[derive(Debug, Default)]
pub struct LockManager;

impl LockManager {
    /// Create (if needed) and initialize the mutex for `mutex_type` so later
    /// acquisitions cannot fail on initialization.
    pub fn initialize_mutex(&self, mutex_type: MutexType, kind: MutexKind) -> Result<()> {
        Self::get(mutex_type, kind).map(|_| ())
    }

    /// Acquire the named mutex; blocks until available.
    pub fn acquire_mutex(&self, mutex_type: MutexType, kind: MutexKind) -> Result<MutexGuard> {
        let mutex = Self::get(mutex_type, kind)?;
        mutex.lock()?;
        Ok(MutexGuard { mutex })
    }

    fn get(mutex_type: MutexType, kind: MutexKind) -> Result<Arc<RobustMutex>> {
        let name = mutex_type.name();
        let mut registry = REGISTRY
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(mutex) = registry.get(&name) {
            return Ok(Arc::clone(mutex));
        }
        let mutex = Arc::new(RobustMutex::create(&name, kind)?);
        registry.insert(name, Arc::clone(&mutex));
        Ok(mutex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_names_follow_the_contract() {
        assert_eq!(MutexType::DeviceIo(0).name(), "TT_DEVICE_IO.0");
        assert_eq!(MutexType::ArcMsg(3).name(), "ARC_MSG.3");
        assert_eq!(MutexType::Simulator.name(), "TT_SIMULATOR");
    }

    #[test]
    fn guard_releases_on_drop() {
        let manager = LockManager;
        {
            let _guard = manager
                .acquire_mutex(MutexType::DeviceIo(990), MutexKind::ProcessLocal)
                .unwrap();
        }
        // Re-acquisition succeeds because the guard unlocked on drop.
        let _guard = manager
            .acquire_mutex(MutexType::DeviceIo(990), MutexKind::ProcessLocal)
            .unwrap();
    }
}
