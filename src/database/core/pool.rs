//! Connection manager
//!
//! Owns the lifecycle of connection handles: standalone opens and pooled
//! reuse with lease counting. Writer locks are shared per physical file by
//! the process-wide registry in [`FileLock::for_path`](super::FileLock::for_path).

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::database::core::connection::{
    ConnectionHandle, DatabaseLocation, OpenOptions, ThreadMode,
};
use crate::error::{DataAccessError, Result};

/// Bounded retry policy for transient failures of autocommit operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Base delay, doubled after each attempt
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(25),
        }
    }
}

/// Runtime configuration of a [`ConnectionManager`]
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Whether the embedded SQL engine is available in this build/runtime
    pub with_sqlite: bool,
    /// Options used for pooled handles and [`ConnectionManager::open_default`]
    pub options: OpenOptions,
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            with_sqlite: true,
            options: OpenOptions::default(),
            retry: RetryPolicy::default(),
        }
    }
}

struct PoolEntry {
    handle: Arc<ConnectionHandle>,
    leases: usize,
}

/// Manages connection handles for one or more logical databases
pub struct ConnectionManager {
    config: ManagerConfig,
    pool: Mutex<HashMap<DatabaseLocation, PoolEntry>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            pool: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Whether the embedded engine capability is enabled
    pub fn with_sqlite(&self) -> bool {
        self.config.with_sqlite
    }

    /// Open a new handle
    ///
    /// Either returns a fully configured handle or an error; a failed open
    /// leaves no file descriptor behind.
    pub fn open(
        &self,
        location: DatabaseLocation,
        options: &OpenOptions,
    ) -> Result<Arc<ConnectionHandle>> {
        if !self.config.with_sqlite {
            return Err(DataAccessError::connection(
                &location,
                "embedded SQL engine support is disabled",
            ));
        }
        ConnectionHandle::open(location, options).map(Arc::new)
    }

    /// Open a new handle with the manager's default options
    pub fn open_default(&self, location: DatabaseLocation) -> Result<Arc<ConnectionHandle>> {
        let options = self.config.options.clone();
        self.open(location, &options)
    }

    /// Close a handle; idempotent
    pub fn close(&self, handle: &ConnectionHandle) -> Result<()> {
        let result = handle.close();
        let mut pool = self.pool.lock();
        let pooled = pool
            .get(handle.location())
            .map(|entry| entry.handle.id() == handle.id())
            .unwrap_or(false);
        if pooled {
            pool.remove(handle.location());
        }
        result
    }

    /// Acquire a pooled handle, opening one on first use
    ///
    /// Pooled handles are internally synchronized so any thread may lease
    /// them. The lease is returned when the guard drops.
    pub fn acquire(&self, location: &DatabaseLocation) -> Result<PooledConnection<'_>> {
        let mut pool = self.pool.lock();

        let reusable = pool
            .get(location)
            .map(|entry| entry.handle.is_open())
            .unwrap_or(false);

        if !reusable {
            let options = self.config.options.clone().thread_mode(ThreadMode::Shared);
            let handle = self.open(location.clone(), &options)?;
            debug!("pooled new handle {} for {}", handle.id(), location);
            pool.insert(location.clone(), PoolEntry { handle, leases: 0 });
        }

        let entry = pool.get_mut(location).ok_or_else(|| {
            DataAccessError::connection(location, "pool entry vanished during acquire")
        })?;
        entry.leases += 1;

        Ok(PooledConnection {
            manager: self,
            handle: Arc::clone(&entry.handle),
        })
    }

    /// Scoped acquisition: run `f` with a pooled handle
    ///
    /// The lease is released on every exit path, including errors.
    pub fn with_connection<R>(
        &self,
        location: &DatabaseLocation,
        f: impl FnOnce(&ConnectionHandle) -> Result<R>,
    ) -> Result<R> {
        let lease = self.acquire(location)?;
        f(&lease)
    }

    /// Outstanding leases on the pooled handle for `location`
    pub fn leases(&self, location: &DatabaseLocation) -> usize {
        self.pool
            .lock()
            .get(location)
            .map(|entry| entry.leases)
            .unwrap_or(0)
    }

    /// Close pooled handles nobody is leasing; returns how many were closed
    pub fn close_idle(&self) -> usize {
        let idle: Vec<Arc<ConnectionHandle>> = {
            let mut pool = self.pool.lock();
            let keys: Vec<DatabaseLocation> = pool
                .iter()
                .filter(|(_, entry)| entry.leases == 0)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter()
                .filter_map(|k| pool.remove(k))
                .map(|entry| entry.handle)
                .collect()
        };

        for handle in &idle {
            if let Err(e) = handle.close() {
                warn!("failed to close idle handle for {}: {}", handle.location(), e);
            }
        }
        idle.len()
    }

    /// Close every pooled handle
    pub fn shutdown(&self) -> Result<()> {
        let handles: Vec<Arc<ConnectionHandle>> = self
            .pool
            .lock()
            .drain()
            .map(|(_, entry)| entry.handle)
            .collect();

        let mut first_error = None;
        for handle in handles {
            if let Err(e) = handle.close() {
                warn!("failed to close {}: {}", handle.location(), e);
                first_error.get_or_insert(e);
            }
        }
        info!("connection manager shut down");
        first_error.map_or(Ok(()), Err)
    }

    fn release(&self, handle: &ConnectionHandle) {
        let mut pool = self.pool.lock();
        if let Some(entry) = pool.get_mut(handle.location()) {
            if entry.handle.id() == handle.id() {
                entry.leases = entry.leases.saturating_sub(1);
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("error while dropping connection manager: {}", e);
        }
    }
}

/// Lease on a pooled handle; returned to the pool on drop
pub struct PooledConnection<'m> {
    manager: &'m ConnectionManager,
    handle: Arc<ConnectionHandle>,
}

impl PooledConnection<'_> {
    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }
}

impl Deref for PooledConnection<'_> {
    type Target = ConnectionHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::mapper::Value;
    use crate::error::ExecutionFailure;

    #[test]
    fn test_disabled_engine_refuses_open() {
        let manager = ConnectionManager::new(ManagerConfig {
            with_sqlite: false,
            ..Default::default()
        });
        let err = manager
            .open_default(DatabaseLocation::memory("off"))
            .unwrap_err();
        assert!(matches!(err, DataAccessError::Connection { .. }));
    }

    #[test]
    fn test_with_connection_reuses_pooled_handle() {
        let manager = ConnectionManager::default();
        let location = DatabaseLocation::memory("pooled");

        let first = manager
            .with_connection(&location, |handle| {
                handle.with_session(|s| s.execute_batch("CREATE TABLE t (x INTEGER)"))?;
                Ok(handle.id())
            })
            .unwrap();
        let second = manager
            .with_connection(&location, |handle| {
                // same in-memory database, so the table is still there
                assert!(handle.with_session(|s| s.table_exists("t"))?);
                Ok(handle.id())
            })
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(manager.leases(&location), 0);
    }

    #[test]
    fn test_lease_released_on_error() {
        let manager = ConnectionManager::default();
        let location = DatabaseLocation::memory("errors");

        let result: Result<()> = manager.with_connection(&location, |handle| {
            assert_eq!(manager.leases(handle.location()), 1);
            handle.with_session(|s| s.execute_batch("NOT VALID SQL"))
        });
        assert!(result.is_err());
        assert_eq!(manager.leases(&location), 0);
    }

    #[test]
    fn test_close_idle_and_shutdown() {
        let manager = ConnectionManager::default();
        let a = DatabaseLocation::memory("a");
        let b = DatabaseLocation::memory("b");

        let lease = manager.acquire(&a).unwrap();
        manager.with_connection(&b, |_| Ok(())).unwrap();

        assert_eq!(manager.close_idle(), 1);
        assert!(lease.is_open());
        let handle = Arc::clone(lease.handle());
        drop(lease);

        manager.shutdown().unwrap();
        assert!(!handle.is_open());
    }

    fn quick_policy() -> crate::database::LockPolicy {
        crate::database::LockPolicy {
            timeout: Duration::from_millis(20),
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn test_handles_on_same_file_share_writer_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let quick = OpenOptions::default().lock_policy(quick_policy());

        // separate managers still coordinate on the same file
        let first = ConnectionManager::default();
        let second = ConnectionManager::default();
        let writer = first.open(DatabaseLocation::file(&path), &quick).unwrap();
        let other = second.open(DatabaseLocation::file(&path), &quick).unwrap();

        writer
            .with_session(|s| {
                s.execute_batch("CREATE TABLE t (x INTEGER)")?;
                s.begin()
            })
            .unwrap();
        assert!(other.with_session(|s| Ok(s.lock.is_write_locked())).unwrap());

        let err = other
            .with_session(|s| s.execute_non_query("INSERT INTO t (x) VALUES (1)", &[]))
            .unwrap_err();
        assert!(matches!(
            err,
            DataAccessError::Execution {
                kind: ExecutionFailure::Busy,
                ..
            }
        ));

        writer.with_session(|s| s.commit()).unwrap();
        let inserted = other
            .with_session(|s| s.execute_non_query("INSERT INTO t (x) VALUES (?1)", &[Value::Integer(2)]))
            .unwrap();
        assert_eq!(inserted, 1);
    }

    #[test]
    fn test_pooled_transaction_is_private_to_its_thread() {
        let manager = ConnectionManager::default();
        let location = DatabaseLocation::memory("tx-owner");

        let lease = manager.acquire(&location).unwrap();
        lease
            .with_session(|s| s.execute_batch("CREATE TABLE t (x INTEGER)"))
            .unwrap();
        lease.with_session(|s| s.begin()).unwrap();
        lease
            .with_session(|s| s.execute_non_query("INSERT INTO t VALUES (1)", &[]))
            .unwrap();

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let manager = &manager;
        let location = &location;
        std::thread::scope(|scope| {
            let reader = scope.spawn(move || {
                started_tx.send(()).unwrap();
                manager.with_connection(location, |handle| {
                    handle.with_session(|s| s.execute_scalar("SELECT COUNT(*) FROM t", &[]))
                })
            });

            started_rx.recv().unwrap();
            std::thread::sleep(Duration::from_millis(50));
            lease.with_session(|s| s.rollback()).unwrap();

            // the reader waited for the rollback instead of seeing the row
            assert_eq!(reader.join().unwrap().unwrap(), Value::Integer(0));
        });
    }

    #[test]
    fn test_pooled_transaction_times_out_other_threads() {
        let manager = ConnectionManager::new(ManagerConfig {
            options: OpenOptions::default().lock_policy(quick_policy()),
            ..Default::default()
        });
        let location = DatabaseLocation::memory("tx-timeout");

        let lease = manager.acquire(&location).unwrap();
        lease
            .with_session(|s| {
                s.execute_batch("CREATE TABLE t (x INTEGER)")?;
                s.begin()
            })
            .unwrap();

        let manager = &manager;
        let location = &location;
        let result = std::thread::scope(|scope| {
            scope
                .spawn(move || {
                    manager.with_connection(location, |handle| {
                        handle.with_session(|s| s.execute_non_query("INSERT INTO t VALUES (2)", &[]))
                    })
                })
                .join()
                .unwrap()
        });
        assert!(result.unwrap_err().is_transient());

        // the owning thread is unaffected
        lease
            .with_session(|s| s.execute_non_query("INSERT INTO t VALUES (1)", &[]))
            .unwrap();
        lease.with_session(|s| s.commit()).unwrap();
        let count = manager
            .with_connection(location, |handle| {
                handle.with_session(|s| s.execute_scalar("SELECT COUNT(*) FROM t", &[]))
            })
            .unwrap();
        assert_eq!(count, Value::Integer(1));
    }
}
