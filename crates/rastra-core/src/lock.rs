//! Cooperative sister-file locking.
//!
//! Every structural read or write of a container happens inside an
//! exclusive lock keyed on the identity of the underlying file. The lock
//! has two layers:
//!
//! - an in-process registry of reference-counted lock cells, so that two
//!   sessions opened against the same file identity in the same process
//!   serialize through the same cell, and
//! - an on-disk sister file (`<container>.lck`) created at the outermost
//!   acquisition and removed at the matching release, so that cooperating
//!   processes sharing the container coordinate through the filesystem.
//!
//! Acquisition is a blocking mutex-style wait with no timeout. The lock is
//! reentrant within a thread: a session that already holds the cell may
//! acquire again without touching the sister file. Release happens through
//! a guard on every exit path. When the last [`LockHandle`] for a key is
//! dropped, the registry entry is forgotten entirely, so a transient
//! operation such as sniffing leaves no process-wide registration behind.

use crate::error::Result;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Interval between attempts to create the sister file while another
/// process holds it.
const SISTER_POLL: Duration = Duration::from_millis(10);

/// Canonical identity of a container file.
///
/// Two paths naming the same file resolve to the same key, so sessions
/// opened through different spellings of a path still share one lock.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct FileKey(PathBuf);

impl FileKey {
    /// Resolves the identity key for `path`.
    ///
    /// The file itself does not have to exist yet (create mode); in that
    /// case the parent directory is canonicalized instead.
    pub fn for_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let canonical = match path.canonicalize() {
            Ok(p) => p,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let file_name = path.file_name().map(PathBuf::from).unwrap_or_default();
                match path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    Some(parent) => parent.canonicalize()?.join(file_name),
                    None => path.to_path_buf(),
                }
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self(canonical))
    }

    /// Path of the on-disk sister file for this identity.
    fn sister_path(&self) -> PathBuf {
        let mut name = self.0.as_os_str().to_os_string();
        name.push(".lck");
        PathBuf::from(name)
    }
}

#[derive(Default, Debug)]
struct CellState {
    owner: Option<ThreadId>,
    depth: u32,
}

#[derive(Debug)]
struct LockCell {
    state: Mutex<CellState>,
    unlocked: Condvar,
    sister: PathBuf,
}

type Registry = Mutex<HashMap<FileKey, Weak<LockCell>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Handle on the lock for one file identity.
///
/// Handles are cheap to clone the usual way (create another for the same
/// key); all handles for a key share one cell. The cell, and with it the
/// registry entry, lives exactly as long as some handle does.
#[derive(Debug)]
pub struct LockHandle {
    key: FileKey,
    cell: Arc<LockCell>,
}

impl LockHandle {
    /// Obtains the shared lock cell for `key`, creating it if this is the
    /// first handle in the process.
    pub fn new(key: FileKey) -> Self {
        let mut map = registry().lock().expect("lock registry poisoned");
        map.retain(|_, weak| weak.strong_count() > 0);
        let cell = match map.get(&key).and_then(Weak::upgrade) {
            Some(cell) => cell,
            None => {
                let cell = Arc::new(LockCell {
                    state: Mutex::new(CellState::default()),
                    unlocked: Condvar::new(),
                    sister: key.sister_path(),
                });
                map.insert(key.clone(), Arc::downgrade(&cell));
                cell
            }
        };
        Self { key, cell }
    }

    /// The identity this handle locks on.
    pub fn key(&self) -> &FileKey {
        &self.key
    }

    /// Acquires the exclusive lock, blocking until it is available.
    ///
    /// Reentrant within a thread: nested acquisitions return immediately
    /// and only the outermost one touches the sister file. The returned
    /// guard is self-contained, so the handle stays free for further use
    /// while the lock is held.
    pub fn acquire(&self) -> Result<LockGuard> {
        let me = thread::current().id();
        let mut state = self.cell.state.lock().expect("lock cell poisoned");
        if state.owner == Some(me) {
            state.depth += 1;
            trace!(depth = state.depth, "reentrant lock acquisition");
            return Ok(LockGuard {
                cell: Arc::clone(&self.cell),
            });
        }
        while state.owner.is_some() {
            state = self
                .cell
                .unlocked
                .wait(state)
                .expect("lock cell poisoned");
        }
        state.owner = Some(me);
        state.depth = 1;
        drop(state);

        if let Err(e) = self.lock_sister() {
            // Roll the in-process claim back so waiters are not stranded.
            let mut state = self.cell.state.lock().expect("lock cell poisoned");
            state.owner = None;
            state.depth = 0;
            self.cell.unlocked.notify_one();
            return Err(e);
        }
        debug!(key = ?self.key.0, "container lock acquired");
        Ok(LockGuard {
            cell: Arc::clone(&self.cell),
        })
    }

    /// Creates the sister file, polling while another process holds it.
    fn lock_sister(&self) -> Result<()> {
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.cell.sister)
            {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    trace!(sister = ?self.cell.sister, "sister file held, waiting");
                    thread::sleep(SISTER_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let mut map = registry().lock().expect("lock registry poisoned");
        // Ours may be the last handle; forget the key once no other strong
        // reference remains. New handles upgrade under this same registry
        // lock, so the count cannot race upward here.
        if Arc::strong_count(&self.cell) == 1 {
            map.remove(&self.key);
        }
    }
}

/// Scope guard for a held container lock.
///
/// Dropping the guard releases the lock; at the outermost release the
/// sister file is removed and one waiter is woken.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    cell: Arc<LockCell>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut state = self.cell.state.lock().expect("lock cell poisoned");
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            if let Err(e) = std::fs::remove_file(&self.cell.sister) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(sister = ?self.cell.sister, error = %e, "failed to remove sister file");
                }
            }
            self.cell.unlocked.notify_one();
            trace!("container lock released");
        }
    }
}

#[cfg(test)]
pub(crate) fn registered_key_count() -> usize {
    let map = registry().lock().expect("lock registry poisoned");
    map.values().filter(|w| w.strong_count() > 0).count()
}
