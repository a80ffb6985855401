//! Named mutexes that serialize access to shared hardware resources.
//!
//! Two variants share one capability set: a system-wide mutex backed by a
//! robust pthread mutex in shared memory (survives owner crashes, visible to
//! every process on the host) and a process-local pthread mutex for callers
//! that never share the resource across processes.

use std::fs::File;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};
use std::sync::Mutex;

use memmap2::{MmapOptions, MmapRaw};
use nix::fcntl::OFlag;
use nix::sys::mman::shm_open;
use nix::sys::stat::Mode;
use tracing::warn;

use crate::error::{Error, Result};

/// Shared-memory file name prefix; the backing files land in `/dev/shm`.
const UMD_LOCK_PREFIX: &str = "TT_UMD_LOCK.";

/// "TTUMDMTX". Any value unlikely to be found at random in fresh shared
/// memory works; this one is recognizable in a hex dump.
const INITIALIZED_FLAG: u64 = 0x5454_554D_444D_5458;

const ALL_RW_PERMISSION: libc::mode_t = 0o666;

/// Selects the mutex implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    /// Shared memory, survives process crashes, inter-process.
    SystemWide,
    /// Plain pthread mutex, single process only, cheaper.
    ProcessLocal,
}

/// Layout of the shared-memory file. The sentinel tells later openers that
/// the pthread mutex inside was fully initialized; the owner fields are
/// diagnostics for the contention warning.
#[repr(C)]
struct MutexWrapper {
    mutex: libc::pthread_mutex_t,
    initialized: u64,
    owner_tid: u64,
    owner_pid: u64,
}

/// A named mutex. Create with [`RobustMutex::create`], then call
/// [`initialize`](RobustMutex::initialize) once before the first lock.
#[derive(Debug)]
pub enum RobustMutex {
    SystemWide(SystemWideMutex),
    ProcessLocal(ProcessLocalMutex),
}

impl RobustMutex {
    pub fn create(name: &str, kind: MutexKind) -> Result<Self> {
        let mut mutex = match kind {
            MutexKind::SystemWide => RobustMutex::SystemWide(SystemWideMutex::new(name)),
            MutexKind::ProcessLocal => RobustMutex::ProcessLocal(ProcessLocalMutex::new(name)),
        };
        mutex.initialize()?;
        Ok(mutex)
    }

    /// Idempotent; safe to call again after a failed first attempt.
    pub fn initialize(&mut self) -> Result<()> {
        match self {
            RobustMutex::SystemWide(m) => m.initialize(),
            RobustMutex::ProcessLocal(m) => m.initialize(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RobustMutex::SystemWide(m) => &m.name,
            RobustMutex::ProcessLocal(m) => &m.name,
        }
    }

    pub fn lock(&self) -> Result<()> {
        match self {
            RobustMutex::SystemWide(m) => m.lock(),
            RobustMutex::ProcessLocal(m) => m.lock(),
        }
    }

    pub fn unlock(&self) -> Result<()> {
        match self {
            RobustMutex::SystemWide(m) => m.unlock(),
            RobustMutex::ProcessLocal(m) => m.unlock(),
        }
    }
}

/// The shared-memory variant.
///
/// The backing `/dev/shm` file is never unlinked by the driver; persistence
/// across process lifetimes is what lets an unrelated process recover a lock
/// whose owner died.
#[derive(Debug)]
pub struct SystemWideMutex {
    name: String,
    mapping: Option<MmapRaw>,
}

// The pthread mutex in the mapping provides the cross-thread synchronization
// for everything reached through the raw pointer.
unsafe impl Send for SystemWideMutex {}
unsafe impl Sync for SystemWideMutex {}

/// Serializes initialization between threads of this process. The flock on
/// the shared-memory fd only excludes other processes; without this, two
/// threads could both hold the flock and race on the mutex contents.
static MULTITHREAD_MUTEX: Mutex<()> = Mutex::new(());

impl SystemWideMutex {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mapping: None,
        }
    }

    fn wrapper(&self) -> Result<*mut MutexWrapper> {
        let mapping = self.mapping.as_ref().ok_or_else(|| {
            Error::Configuration(format!("mutex {} used before initialize()", self.name))
        })?;
        Ok(mapping.as_mut_ptr() as *mut MutexWrapper)
    }

    fn initialize(&mut self) -> Result<()> {
        if self.mapping.is_some() {
            return Ok(());
        }

        let shm_file = self.open_shm_file()?;

        {
            // Critical section: intra-process mutex nested inside the
            // advisory file lock. Racing initializers would otherwise let one
            // process use the pthread mutex before another finished
            // initializing it.
            let _thread_guard = MULTITHREAD_MUTEX
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let _file_guard = FlockGuard::acquire(&shm_file, &self.name)?;

            let file_was_resized = self.resize_shm_file(&shm_file)?;

            let mapping = MmapOptions::new()
                .len(mem::size_of::<MutexWrapper>())
                .map_raw(&shm_file)
                .map_err(|e| {
                    Error::Configuration(format!("mmap failed for mutex {}: {e}", self.name))
                })?;
            let wrapper = mapping.as_mut_ptr() as *mut MutexWrapper;
            self.mapping = Some(mapping);

            let initialized = unsafe { (*wrapper).initialized };
            if initialized != INITIALIZED_FLAG && !file_was_resized {
                warn!(
                    mutex = %self.name,
                    "mutex file was already of correct size but the initialized flag is wrong; \
                     reinitializing (a previous run may have failed partway)"
                );
            }
            if initialized == INITIALIZED_FLAG && file_was_resized {
                warn!(
                    mutex = %self.name,
                    "mutex file was resized but the initialized flag is already set; \
                     the mutex might misbehave"
                );
            }

            if initialized != INITIALIZED_FLAG {
                self.initialize_pthread_mutex_first_use(wrapper)?;
            }
        }

        // The mapping stays valid after the fd closes; keeping fds open would
        // hit descriptor limits on many-chip systems. `shm_file` drops here.
        Ok(())
    }

    fn open_shm_file(&self) -> Result<File> {
        let shm_name = format!("{UMD_LOCK_PREFIX}{}", self.name);

        // Clear the umask so the backing file is created world-readable and
        // writable; cooperating processes may run as different users.
        let old_umask = unsafe { libc::umask(0) };

        // Exclusive create first so exactly one process wins creation; the
        // open-then-create order would let two processes race.
        let fd = match shm_open(
            shm_name.as_str(),
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::from_bits_truncate(ALL_RW_PERMISSION as u32),
        ) {
            Ok(fd) => Ok(fd),
            Err(nix::errno::Errno::EEXIST) => shm_open(
                shm_name.as_str(),
                OFlag::O_RDWR,
                Mode::from_bits_truncate(ALL_RW_PERMISSION as u32),
            ),
            Err(e) => Err(e),
        };

        unsafe { libc::umask(old_umask) };

        let fd = fd.map_err(|e| {
            Error::Configuration(format!("shm_open failed for mutex {}: {e}", self.name))
        })?;
        Ok(unsafe { File::from_raw_fd(fd.into_raw_fd()) })
    }

    fn resize_shm_file(&self, file: &File) -> Result<bool> {
        let target_size = mem::size_of::<MutexWrapper>() as u64;
        let file_size = file
            .metadata()
            .map_err(|e| Error::Configuration(format!("fstat failed for mutex {}: {e}", self.name)))?
            .len();

        if file_size != 0 && file_size != target_size {
            warn!(
                mutex = %self.name,
                file_size,
                target_size,
                "mutex file size is not as expected; possibly written by a \
                 different pthread implementation"
            );
        }

        if file_size == target_size {
            return Ok(false);
        }

        file.set_len(target_size).map_err(|e| {
            Error::Configuration(format!("ftruncate failed for mutex {}: {e}", self.name))
        })?;
        Ok(true)
    }

    fn initialize_pthread_mutex_first_use(&self, wrapper: *mut MutexWrapper) -> Result<()> {
        let check = |err: i32, what: &str| -> Result<()> {
            if err != 0 {
                return Err(Error::Configuration(format!(
                    "{what} failed for mutex {}: {}",
                    self.name,
                    std::io::Error::from_raw_os_error(err)
                )));
            }
            Ok(())
        };

        unsafe {
            let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut attr), "pthread_mutexattr_init")?;
            check(
                libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
                "pthread_mutexattr_setpshared",
            )?;
            // Robustness is the point: when an owner dies, the next locker
            // gets EOWNERDEAD instead of deadlocking and can recover.
            check(
                libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST),
                "pthread_mutexattr_setrobust",
            )?;
            check(
                libc::pthread_mutex_init(&mut (*wrapper).mutex, &attr),
                "pthread_mutex_init",
            )?;
            libc::pthread_mutexattr_destroy(&mut attr);

            // Future openers have no other way to tell whether the pthread
            // mutex in the file was ever initialized.
            (*wrapper).initialized = INITIALIZED_FLAG;
            (*wrapper).owner_tid = 0;
            (*wrapper).owner_pid = 0;
        }
        Ok(())
    }

    pub fn lock(&self) -> Result<()> {
        let wrapper = self.wrapper()?;

        // Timed first attempt so the user learns who is holding the lock if
        // it does not come quickly.
        let mut timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut timeout) };
        timeout.tv_sec += 1;

        let mut lock_res =
            unsafe { libc::pthread_mutex_timedlock(&mut (*wrapper).mutex, &timeout) };

        // The blocking call inside this loop means it runs at most twice, but
        // a loop reads better than duplicating the recovery arms.
        while lock_res != 0 {
            match lock_res {
                libc::EOWNERDEAD => {
                    // Owner crashed while holding the mutex. Mark it
                    // consistent; the shared hardware state it protected is
                    // indeterminate and the caller must reprogram any dynamic
                    // TLB before trusting it.
                    let err = unsafe { libc::pthread_mutex_consistent(&mut (*wrapper).mutex) };
                    if err != 0 {
                        return Err(Error::Configuration(format!(
                            "pthread_mutex_consistent failed for mutex {}: {}",
                            self.name,
                            std::io::Error::from_raw_os_error(err)
                        )));
                    }
                    lock_res = 0;
                }
                libc::ETIMEDOUT => {
                    let (tid, pid) = unsafe { ((*wrapper).owner_tid, (*wrapper).owner_pid) };
                    warn!(
                        mutex = %self.name,
                        owner_tid = tid,
                        owner_pid = pid,
                        "waiting for lock held by another owner"
                    );
                    lock_res = unsafe { libc::pthread_mutex_lock(&mut (*wrapper).mutex) };
                }
                err => {
                    return Err(Error::Configuration(format!(
                        "pthread_mutex_lock failed for mutex {}: {}",
                        self.name,
                        std::io::Error::from_raw_os_error(err)
                    )));
                }
            }
        }

        unsafe {
            (*wrapper).owner_tid = nix::unistd::gettid().as_raw() as u64;
            (*wrapper).owner_pid = std::process::id() as u64;
        }
        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        let wrapper = self.wrapper()?;
        unsafe {
            // Clear ownership before the unlock; after it another process may
            // immediately overwrite these fields.
            (*wrapper).owner_tid = 0;
            (*wrapper).owner_pid = 0;
            let err = libc::pthread_mutex_unlock(&mut (*wrapper).mutex);
            if err != 0 {
                return Err(Error::Configuration(format!(
                    "pthread_mutex_unlock failed for mutex {}: {}",
                    self.name,
                    std::io::Error::from_raw_os_error(err)
                )));
            }
        }
        Ok(())
    }
}

/// RAII advisory lock over the shared-memory file descriptor.
struct FlockGuard<'a> {
    file: &'a File,
    name: &'a str,
}

impl<'a> FlockGuard<'a> {
    fn acquire(file: &'a File, name: &'a str) -> Result<Self> {
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
            return Err(Error::Configuration(format!(
                "flock failed for mutex {name}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { file, name })
    }
}

impl Drop for FlockGuard<'_> {
    fn drop(&mut self) {
        if unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) } != 0 {
            warn!(
                mutex = %self.name,
                "flock release failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

/// The single-process variant: a plain pthread mutex on the heap.
pub struct ProcessLocalMutex {
    name: String,
    mutex: Option<Box<libc::pthread_mutex_t>>,
}

impl std::fmt::Debug for ProcessLocalMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLocalMutex")
            .field("name", &self.name)
            .field("initialized", &self.mutex.is_some())
            .finish()
    }
}

unsafe impl Send for ProcessLocalMutex {}
unsafe impl Sync for ProcessLocalMutex {}

impl ProcessLocalMutex {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mutex: None,
        }
    }

    fn initialize(&mut self) -> Result<()> {
        if self.mutex.is_some() {
            return Ok(());
        }
        let mut mutex: Box<libc::pthread_mutex_t> = Box::new(unsafe { mem::zeroed() });
        let err = unsafe { libc::pthread_mutex_init(mutex.as_mut(), std::ptr::null()) };
        if err != 0 {
            return Err(Error::Configuration(format!(
                "pthread_mutex_init failed for mutex {}: {}",
                self.name,
                std::io::Error::from_raw_os_error(err)
            )));
        }
        self.mutex = Some(mutex);
        Ok(())
    }

    fn raw(&self) -> Result<*mut libc::pthread_mutex_t> {
        self.mutex
            .as_ref()
            .map(|m| m.as_ref() as *const libc::pthread_mutex_t as *mut libc::pthread_mutex_t)
            .ok_or_else(|| {
                Error::Configuration(format!("mutex {} used before initialize()", self.name))
            })
    }

    pub fn lock(&self) -> Result<()> {
        let err = unsafe { libc::pthread_mutex_lock(self.raw()?) };
        if err != 0 {
            return Err(Error::Configuration(format!(
                "pthread_mutex_lock failed for mutex {}: {}",
                self.name,
                std::io::Error::from_raw_os_error(err)
            )));
        }
        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        let err = unsafe { libc::pthread_mutex_unlock(self.raw()?) };
        if err != 0 {
            return Err(Error::Configuration(format!(
                "pthread_mutex_unlock failed for mutex {}: {}",
                self.name,
                std::io::Error::from_raw_os_error(err)
            )));
        }
        Ok(())
    }
}

impl Drop for ProcessLocalMutex {
    fn drop(&mut self) {
        if let Some(mutex) = self.mutex.as_mut() {
            unsafe {
                libc::pthread_mutex_destroy(mutex.as_mut());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::waitpid;
    use nix::unistd::{fork, ForkResult};

    fn unique_name(tag: &str) -> String {
        format!("test_{}_{}", tag, std::process::id())
    }

    fn remove_backing_file(name: &str) {
        let _ = std::fs::remove_file(format!("/dev/shm/{UMD_LOCK_PREFIX}{name}"));
    }

    #[test]
    fn system_wide_lock_unlock() {
        let name = unique_name("basic");
        let mutex = RobustMutex::create(&name, MutexKind::SystemWide).unwrap();
        mutex.lock().unwrap();
        mutex.unlock().unwrap();
        mutex.lock().unwrap();
        mutex.unlock().unwrap();
        remove_backing_file(&name);
    }

    #[test]
    fn process_local_lock_unlock() {
        let mutex = RobustMutex::create("local", MutexKind::ProcessLocal).unwrap();
        mutex.lock().unwrap();
        mutex.unlock().unwrap();
    }

    #[test]
    fn initialize_is_idempotent() {
        let name = unique_name("idem");
        let mut mutex = RobustMutex::create(&name, MutexKind::SystemWide).unwrap();
        mutex.initialize().unwrap();
        mutex.initialize().unwrap();
        mutex.lock().unwrap();
        mutex.unlock().unwrap();
        remove_backing_file(&name);
    }

    #[test]
    fn reopening_existing_file_does_not_reinitialize() {
        let name = unique_name("reopen");
        let first = RobustMutex::create(&name, MutexKind::SystemWide).unwrap();
        first.lock().unwrap();
        // A second handle on the same name must see the sentinel and attach
        // to the same underlying mutex rather than reinitializing it.
        let second = RobustMutex::create(&name, MutexKind::SystemWide).unwrap();
        first.unlock().unwrap();
        second.lock().unwrap();
        second.unlock().unwrap();
        remove_backing_file(&name);
    }

    #[test]
    fn recovers_lock_from_dead_owner() {
        let name = unique_name("crash");
        remove_backing_file(&name);

        // Child acquires the mutex and exits without unlocking; the parent
        // must observe EOWNERDEAD, make the mutex consistent, and proceed.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let mutex = RobustMutex::create(&name, MutexKind::SystemWide).unwrap();
                mutex.lock().unwrap();
                // Exit abruptly while holding the lock.
                unsafe { libc::_exit(0) };
            }
            ForkResult::Parent { child } => {
                waitpid(child, None).unwrap();
                let mutex = RobustMutex::create(&name, MutexKind::SystemWide).unwrap();
                mutex.lock().unwrap();
                mutex.unlock().unwrap();
                // A third acquirer works normally after recovery.
                let other = RobustMutex::create(&name, MutexKind::SystemWide).unwrap();
                other.lock().unwrap();
                other.unlock().unwrap();
                remove_backing_file(&name);
            }
        }
    }
}
