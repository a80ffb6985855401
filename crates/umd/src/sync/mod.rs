pub mod lock_manager;
pub mod robust_mutex;

pub use lock_manager::{LockManager, MutexGuard, MutexType};
pub use robust_mutex::{MutexKind, RobustMutex};
