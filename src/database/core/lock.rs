//! Single-writer/multi-reader lock shared by all handles on one database file
//!
//! The embedded engine is not trusted to arbitrate between connections on its
//! own. Every handle opened on the same physical file, through any manager,
//! shares one [`FileLock`] from a process-wide registry. Writers are
//! exclusive and readers are concurrent with each other. The underlying
//! `parking_lot` lock is task-fair, so a parked writer holds back new readers
//! and writers cannot starve.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use tracing::debug;

/// Locks of every database file opened in this process, keyed by canonical path
static FILE_LOCKS: Mutex<Option<HashMap<PathBuf, Weak<FileLock>>>> = Mutex::new(None);

/// Bounded retry policy for lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// How long a single attempt waits for the lock
    pub timeout: Duration,
    /// Extra attempts after the first one times out
    pub retries: u32,
    /// Base delay between attempts, doubled after each failure
    pub backoff: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            retries: 3,
            backoff: Duration::from_millis(25),
        }
    }
}

impl LockPolicy {
    /// Upper bound on the time one acquisition may take, backoff included
    pub fn total_wait(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut delay = self.backoff;
        for attempt in 0..=self.retries {
            total = total.saturating_add(self.timeout);
            if attempt < self.retries {
                total = total.saturating_add(delay);
                delay = delay.saturating_mul(2);
            }
        }
        total
    }
}

/// Kind of access a guard grants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// Reader/writer lock keyed by a database file
#[derive(Debug)]
pub struct FileLock {
    key: String,
    rw: Arc<RwLock<()>>,
    readers: AtomicUsize,
}

impl FileLock {
    /// A private lock not shared with any other handle
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            rw: Arc::new(RwLock::new(())),
            readers: AtomicUsize::new(0),
        })
    }

    /// The lock shared by every handle on the file at `path`
    ///
    /// The path does not need to exist yet. The lock lives as long as some
    /// handle holds it.
    pub fn for_path(path: &Path) -> Arc<Self> {
        let path = canonical_path(path);
        let mut registry = FILE_LOCKS.lock();
        let locks = registry.get_or_insert_with(HashMap::new);
        locks.retain(|_, weak| weak.strong_count() > 0);
        if let Some(lock) = locks.get(&path).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = FileLock::new(path.display().to_string());
        locks.insert(path, Arc::downgrade(&lock));
        lock
    }

    /// Key of the file this lock protects
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Acquire shared access, or `None` once the policy is exhausted
    pub fn read(self: &Arc<Self>, policy: &LockPolicy) -> Option<FileLockGuard> {
        self.acquire(LockKind::Read, policy)
    }

    /// Acquire exclusive access, or `None` once the policy is exhausted
    pub fn write(self: &Arc<Self>, policy: &LockPolicy) -> Option<FileLockGuard> {
        self.acquire(LockKind::Write, policy)
    }

    /// Number of readers currently holding the lock
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Whether a writer currently holds the lock
    pub fn is_write_locked(&self) -> bool {
        self.rw.is_locked_exclusive()
    }

    fn acquire(self: &Arc<Self>, kind: LockKind, policy: &LockPolicy) -> Option<FileLockGuard> {
        let mut delay = policy.backoff;
        for attempt in 0..=policy.retries {
            if let Some(held) = self.try_acquire_for(kind, policy.timeout) {
                return Some(FileLockGuard {
                    lock: Arc::clone(self),
                    held,
                });
            }
            if attempt < policy.retries {
                debug!(
                    "{:?} lock on {} contended (attempt {}), backing off {:?}",
                    kind,
                    self.key,
                    attempt + 1,
                    delay
                );
                thread::sleep(delay);
                delay = delay.saturating_mul(2);
            }
        }
        None
    }

    fn try_acquire_for(&self, kind: LockKind, timeout: Duration) -> Option<Held> {
        match kind {
            LockKind::Read => self.rw.try_read_arc_for(timeout).map(|guard| {
                self.readers.fetch_add(1, Ordering::AcqRel);
                Held::Read(guard)
            }),
            LockKind::Write => self.rw.try_write_arc_for(timeout).map(Held::Write),
        }
    }
}

/// Resolve a path to a stable key even if the file does not exist yet
fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            parent
                .canonicalize()
                .map(|p| p.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

#[derive(Debug)]
enum Held {
    Read(ArcRwLockReadGuard<RawRwLock, ()>),
    Write(ArcRwLockWriteGuard<RawRwLock, ()>),
}

/// RAII guard; releases its share of the lock on drop
///
/// Guards are `Send`, so a lazy result stream may carry one across threads.
#[derive(Debug)]
pub struct FileLockGuard {
    lock: Arc<FileLock>,
    held: Held,
}

impl FileLockGuard {
    pub fn kind(&self) -> LockKind {
        match self.held {
            Held::Read(_) => LockKind::Read,
            Held::Write(_) => LockKind::Write,
        }
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Held::Read(_) = self.held {
            self.lock.readers.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    fn quick_policy() -> LockPolicy {
        LockPolicy {
            timeout: Duration::from_millis(20),
            retries: 1,
            backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_readers_share() {
        let lock = FileLock::new("test.db");
        let a = lock.read(&quick_policy()).unwrap();
        let b = lock.read(&quick_policy()).unwrap();
        assert_eq!(lock.reader_count(), 2);
        assert!(lock.write(&quick_policy()).is_none());
        drop(a);
        drop(b);
        assert_eq!(lock.reader_count(), 0);
        assert!(lock.write(&quick_policy()).is_some());
    }

    #[test]
    fn test_writer_is_exclusive() {
        let lock = FileLock::new("test.db");
        let w = lock.write(&quick_policy()).unwrap();
        assert!(lock.is_write_locked());
        assert!(lock.read(&quick_policy()).is_none());
        assert!(lock.write(&quick_policy()).is_none());
        drop(w);
        assert!(!lock.is_write_locked());
        assert!(lock.read(&quick_policy()).is_some());
    }

    #[test]
    fn test_writer_waits_for_release() {
        let lock = FileLock::new("test.db");
        let reader = lock.read(&quick_policy()).unwrap();

        let (tx, rx) = channel();
        let contender = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            let policy = LockPolicy {
                timeout: Duration::from_secs(2),
                retries: 0,
                backoff: Duration::ZERO,
            };
            let guard = contender.write(&policy);
            tx.send(guard.is_some()).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        drop(reader);
        assert!(rx.recv().unwrap());
        handle.join().unwrap();
        assert!(!lock.is_write_locked());
    }

    #[test]
    fn test_registry_shares_lock_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let spelled_differently = dir.path().join(".").join("shared.db");

        let a = FileLock::for_path(&path);
        let b = FileLock::for_path(&spelled_differently);
        let other = FileLock::for_path(&dir.path().join("other.db"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));

        let guard = a.write(&quick_policy()).unwrap();
        assert!(b.is_write_locked());
        assert!(b.read(&quick_policy()).is_none());
        drop(guard);
        assert!(b.read(&quick_policy()).is_some());
    }

    #[test]
    fn test_guard_can_move_between_threads() {
        let lock = FileLock::new("test.db");
        let guard = lock.read(&quick_policy()).unwrap();
        assert_eq!(guard.kind(), LockKind::Read);
        thread::spawn(move || drop(guard)).join().unwrap();
        assert_eq!(lock.reader_count(), 0);
        assert!(lock.write(&quick_policy()).is_some());
    }

    #[test]
    fn test_total_wait_covers_retries_and_backoff() {
        let policy = LockPolicy {
            timeout: Duration::from_millis(10),
            retries: 2,
            backoff: Duration::from_millis(5),
        };
        assert_eq!(policy.total_wait(), Duration::from_millis(45));
    }
}
