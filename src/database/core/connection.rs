//! Database connection management
//!
//! A [`ConnectionHandle`] owns one embedded-database session. The session is
//! only reachable through scoped access ([`ConnectionHandle::with_session`]),
//! which enforces thread affinity for handles that are not internally
//! synchronized and invalidates all cached statements when the handle closes.

use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use rusqlite::{Connection, OpenFlags};
use tracing::{info, warn};

use crate::database::core::lock::{FileLock, LockPolicy};
use crate::database::executor::{TransactionOwner, TransactionState};
use crate::error::{DataAccessError, ExecutionFailure, Result};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Where a logical database lives
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DatabaseLocation {
    /// A database file on disk
    File(PathBuf),
    /// A private in-memory database; the name is only used as a pooling key
    Memory(String),
}

impl DatabaseLocation {
    pub fn file(path: impl AsRef<Path>) -> Self {
        DatabaseLocation::File(path.as_ref().to_path_buf())
    }

    pub fn memory(name: impl Into<String>) -> Self {
        DatabaseLocation::Memory(name.into())
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, DatabaseLocation::Memory(_))
    }
}

impl fmt::Display for DatabaseLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseLocation::File(p) => write!(f, "{}", p.display()),
            DatabaseLocation::Memory(name) => write!(f, ":memory:{}", name),
        }
    }
}

/// How the database file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    /// The file must already exist
    ReadWrite,
    /// Create the file (and its parent directories) if missing
    Create,
}

/// Which threads may use a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadMode {
    /// Only the thread that opened the handle may use it
    Affine,
    /// Any thread may use it; access is serialized internally
    Shared,
}

/// Settings applied when a connection is opened
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOptions {
    pub mode: OpenMode,
    pub thread_mode: ThreadMode,
    pub busy_timeout: Duration,
    pub statement_cache_capacity: usize,
    pub lock_policy: LockPolicy,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            mode: OpenMode::Create,
            thread_mode: ThreadMode::Affine,
            busy_timeout: Duration::from_millis(5000),
            statement_cache_capacity: 64,
            lock_policy: LockPolicy::default(),
        }
    }
}

impl OpenOptions {
    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn thread_mode(mut self, thread_mode: ThreadMode) -> Self {
        self.thread_mode = thread_mode;
        self
    }

    pub fn lock_policy(mut self, lock_policy: LockPolicy) -> Self {
        self.lock_policy = lock_policy;
        self
    }
}

/// One open embedded-database session
///
/// Owned by a [`ConnectionHandle`] and only ever lent out by reference.
/// Statement execution and transactions are implemented on this type in
/// the `executor` module.
pub struct Session {
    pub(crate) conn: Connection,
    pub(crate) location: DatabaseLocation,
    pub(crate) lock: Arc<FileLock>,
    pub(crate) lock_policy: LockPolicy,
    pub(crate) tx: RefCell<TransactionState>,
    pub(crate) tx_owner: Arc<TransactionOwner>,
    read_only: bool,
}

impl Session {
    fn open(location: &DatabaseLocation, options: &OpenOptions, lock: Arc<FileLock>) -> Result<Self> {
        let conn = match location {
            DatabaseLocation::File(path) => {
                if options.mode == OpenMode::Create {
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            DataAccessError::connection(location, format!("create dir: {}", e))
                        })?;
                    }
                }
                let mode_flags = match options.mode {
                    OpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
                    OpenMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE,
                    OpenMode::Create => {
                        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
                    }
                };
                Connection::open_with_flags(
                    path,
                    mode_flags | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
                )
                .map_err(|e| DataAccessError::connection(location, e))?
            }
            DatabaseLocation::Memory(_) => Connection::open_in_memory()
                .map_err(|e| DataAccessError::connection(location, e))?,
        };

        let read_only = options.mode == OpenMode::ReadOnly;
        // `conn` is dropped (and the file closed) if configuration fails
        configure(&conn, location, options, read_only)?;

        Ok(Session {
            conn,
            location: location.clone(),
            lock,
            lock_policy: options.lock_policy,
            tx: RefCell::new(TransactionState::default()),
            tx_owner: Arc::new(TransactionOwner::default()),
            read_only,
        })
    }

    pub fn location(&self) -> &DatabaseLocation {
        &self.location
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Check if a table exists in the database
    pub fn table_exists(&self, table_name: &str) -> Result<bool> {
        let sql = "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1";
        let count: i64 = self
            .conn
            .query_row(sql, [table_name], |row| row.get(0))
            .map_err(|e| crate::error::classify_execution(sql, e))?;
        Ok(count > 0)
    }

    /// Names of user tables, excluding engine-internal ones
    pub fn table_names(&self) -> Result<Vec<String>> {
        let sql = "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name";
        self.query_records(sql, &[])?
            .into_iter()
            .map(|record| match record.value_at(0) {
                Some(crate::database::mapper::Value::Text(name)) => Ok(name.clone()),
                _ => Err(DataAccessError::type_mapping("name", "expected text")),
            })
            .collect()
    }

    /// Close the underlying connection, rolling back any open transaction
    fn shutdown(self) -> Result<()> {
        let depth = self.tx.borrow().depth;
        if depth > 0 {
            warn!(
                "closing {} with an open transaction (depth {}), rolling back",
                self.location, depth
            );
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!("rollback on close failed for {}: {}", self.location, e);
            }
            // releases the file lock held by the transaction
            self.finish_transaction(&mut self.tx.borrow_mut());
        }
        self.conn.flush_prepared_statement_cache();
        let location = self.location.clone();
        self.conn
            .close()
            .map_err(|(_, e)| DataAccessError::connection(&location, e))
    }
}

/// Apply connection pragmas and verify the file is a readable database
fn configure(
    conn: &Connection,
    location: &DatabaseLocation,
    options: &OpenOptions,
    read_only: bool,
) -> Result<()> {
    let fail = |what: &str, e: rusqlite::Error| {
        DataAccessError::connection(location, format!("{}: {}", what, e))
    };

    conn.busy_timeout(options.busy_timeout)
        .map_err(|e| fail("set busy timeout", e))?;
    conn.set_prepared_statement_cache_capacity(options.statement_cache_capacity);

    // Forces the header to be read so corrupt files fail here
    let _: i64 = conn
        .query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get(0))
        .map_err(|e| fail("read database header", e))?;

    if !read_only && !location.is_memory() {
        let _: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| fail("set journal mode", e))?;
    }

    conn.execute_batch(
        "PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;
         PRAGMA temp_store=MEMORY;",
    )
    .map_err(|e| fail("apply pragmas", e))?;

    Ok(())
}

/// Opaque handle to one open embedded-database session
///
/// Handles opened with [`ThreadMode::Affine`] fail fast with
/// [`DataAccessError::ThreadAffinity`] when used from any thread other than
/// the one that opened them. [`ThreadMode::Shared`] handles serialize access
/// through a re-entrant mutex instead.
pub struct ConnectionHandle {
    id: u64,
    location: DatabaseLocation,
    owner: Option<ThreadId>,
    tx_owner: Arc<TransactionOwner>,
    tx_wait: Duration,
    inner: ReentrantMutex<RefCell<Option<Session>>>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("owner", &self.owner)
            .finish()
    }
}

impl ConnectionHandle {
    /// Open a standalone handle
    ///
    /// File handles join the writer lock of every other handle on the same
    /// file in this process; in-memory handles get a private one.
    pub fn open(location: DatabaseLocation, options: &OpenOptions) -> Result<Self> {
        let lock = match &location {
            DatabaseLocation::File(path) => FileLock::for_path(path),
            DatabaseLocation::Memory(_) => FileLock::new(location.to_string()),
        };
        let session = Session::open(&location, options, lock)?;
        let owner = match options.thread_mode {
            ThreadMode::Affine => Some(thread::current().id()),
            ThreadMode::Shared => None,
        };
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        info!("opened database {} (handle {})", location, id);

        Ok(Self {
            id,
            location,
            owner,
            tx_owner: Arc::clone(&session.tx_owner),
            tx_wait: options.lock_policy.total_wait(),
            inner: ReentrantMutex::new(RefCell::new(Some(session))),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn location(&self) -> &DatabaseLocation {
        &self.location
    }

    /// Whether the handle may be used from any thread
    pub fn is_thread_safe(&self) -> bool {
        self.owner.is_none()
    }

    pub fn is_open(&self) -> bool {
        let guard = self.inner.lock();
        let open = guard.try_borrow().map(|slot| slot.is_some()).unwrap_or(true);
        open
    }

    /// Fail fast if the calling thread may not use this handle
    pub fn check_affinity(&self) -> Result<()> {
        match self.owner {
            Some(owner) => {
                let current = thread::current().id();
                if owner == current {
                    Ok(())
                } else {
                    Err(DataAccessError::ThreadAffinity {
                        owner: format!("{:?}", owner),
                        current: format!("{:?}", current),
                    })
                }
            }
            None => Ok(()),
        }
    }

    /// Run `f` with the open session
    ///
    /// Re-entrant on the same thread, so `f` may itself call back into the
    /// handle. Fails with a connection error once the handle is closed.
    pub fn with_session<R>(&self, f: impl FnOnce(&Session) -> Result<R>) -> Result<R> {
        self.check_affinity()?;
        let guard = self.enter()?;
        let slot = guard.try_borrow().map_err(|_| {
            DataAccessError::connection(&self.location, "handle is being closed")
        })?;
        let session = slot
            .as_ref()
            .ok_or_else(|| DataAccessError::connection(&self.location, "handle is closed"))?;
        f(session)
    }

    /// Lock the session, first waiting out a transaction held by another thread
    ///
    /// Gives up with [`ExecutionFailure::Busy`] once the lock policy's total
    /// wait has passed.
    fn enter(&self) -> Result<ReentrantMutexGuard<'_, RefCell<Option<Session>>>> {
        if self.owner.is_some() {
            return Ok(self.inner.lock());
        }
        let deadline = Instant::now() + self.tx_wait;
        loop {
            let guard = self.inner.lock();
            if self.tx_owner.admits_current() {
                return Ok(guard);
            }
            drop(guard);
            if !self.tx_owner.wait_until_free(deadline) {
                return Err(DataAccessError::execution(
                    "<session>",
                    ExecutionFailure::Busy,
                    format!(
                        "timed out waiting for a transaction on {} held by another thread",
                        self.location
                    ),
                ));
            }
        }
    }

    /// Close the handle; calling it again is a no-op
    ///
    /// Invalidates every cached statement and releases the file lock if a
    /// transaction was still open.
    pub fn close(&self) -> Result<()> {
        self.check_affinity()?;
        let guard = self.enter()?;
        let session = {
            let mut slot = guard.try_borrow_mut().map_err(|_| {
                DataAccessError::connection(&self.location, "handle is in use and cannot be closed")
            })?;
            slot.take()
        };
        match session {
            Some(session) => {
                session.shutdown()?;
                info!("closed database {} (handle {})", self.location, self.id);
                Ok(())
            }
            None => Ok(()),
        }
    }
}
