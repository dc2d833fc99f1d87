//! Nested transactions
//!
//! `begin`/`commit`/`rollback` nest through a depth counter on the session.
//! Only the outermost scope talks to the engine. A rollback at any depth
//! marks the whole transaction, so the outermost commit rolls back instead.
//!
//! A transaction belongs to the thread that began it. On a shared handle
//! other threads wait in [`ConnectionHandle::with_session`] until it ends
//! rather than running inside it.
//!
//! [`ConnectionHandle::with_session`]: crate::database::ConnectionHandle::with_session

use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::database::core::connection::Session;
use crate::database::core::lock::FileLockGuard;
use crate::error::{DataAccessError, ExecutionFailure, Result};

/// Locking mode of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// `BEGIN DEFERRED` under the shared read lock
    Read,
    /// `BEGIN IMMEDIATE` under the exclusive write lock
    #[default]
    Write,
}

/// Per-session transaction bookkeeping
#[derive(Debug, Default)]
pub struct TransactionState {
    pub(crate) depth: u32,
    rollback_only: bool,
    mode: TransactionMode,
    guard: Option<FileLockGuard>,
}

impl TransactionState {
    /// Forget the transaction and release its lock
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn mode(&self) -> TransactionMode {
        self.mode
    }
}

/// Thread owning the open transaction of a session, if any
#[derive(Debug, Default)]
pub(crate) struct TransactionOwner {
    owner: Mutex<Option<ThreadId>>,
    released: Condvar,
}

impl TransactionOwner {
    fn claim(&self) {
        *self.owner.lock() = Some(thread::current().id());
    }

    pub(crate) fn release(&self) {
        *self.owner.lock() = None;
        self.released.notify_all();
    }

    /// Whether the calling thread may use the session right now
    pub(crate) fn admits_current(&self) -> bool {
        let owner = *self.owner.lock();
        owner.map_or(true, |id| id == thread::current().id())
    }

    /// Wait until no other thread owns a transaction; `false` on timeout
    pub(crate) fn wait_until_free(&self, deadline: Instant) -> bool {
        let current = thread::current().id();
        let mut owner = self.owner.lock();
        loop {
            let held = *owner;
            match held {
                Some(id) if id != current => {
                    if self.released.wait_until(&mut owner, deadline).timed_out() {
                        let held = *owner;
                        return held.map_or(true, |id| id == current);
                    }
                }
                _ => return true,
            }
        }
    }
}

fn no_transaction(sql: &str) -> DataAccessError {
    DataAccessError::execution(sql, ExecutionFailure::Engine, "no transaction is active")
}

impl Session {
    /// Begin a write transaction, or enter a nested scope
    pub fn begin(&self) -> Result<()> {
        self.begin_with(TransactionMode::Write)
    }

    pub fn begin_with(&self, mode: TransactionMode) -> Result<()> {
        let mut tx = self.tx.borrow_mut();

        if tx.depth > 0 {
            if mode == TransactionMode::Write && tx.mode == TransactionMode::Read {
                return Err(DataAccessError::execution(
                    "BEGIN",
                    ExecutionFailure::ReadOnly,
                    "cannot open a write scope inside a read transaction",
                ));
            }
            tx.depth += 1;
            debug!("entered nested transaction scope (depth {})", tx.depth);
            return Ok(());
        }

        let sql = match mode {
            TransactionMode::Read => "BEGIN DEFERRED",
            TransactionMode::Write => "BEGIN IMMEDIATE",
        };
        if mode == TransactionMode::Write && self.is_read_only() {
            return Err(DataAccessError::execution(
                sql,
                ExecutionFailure::ReadOnly,
                "connection was opened read-only",
            ));
        }

        let guard = match mode {
            TransactionMode::Read => self.lock.read(&self.lock_policy),
            TransactionMode::Write => self.lock.write(&self.lock_policy),
        }
        .ok_or_else(|| self.lock_timeout(sql))?;

        self.conn
            .execute_batch(sql)
            .map_err(|e| crate::error::classify_execution(sql, e))?;

        tx.depth = 1;
        tx.mode = mode;
        tx.rollback_only = false;
        tx.guard = Some(guard);
        self.tx_owner.claim();
        Ok(())
    }

    /// Leave the current scope; the outermost scope commits
    ///
    /// If any nested scope rolled back, the outermost commit rolls back and
    /// reports [`ExecutionFailure::RolledBack`].
    pub fn commit(&self) -> Result<()> {
        let mut tx = self.tx.borrow_mut();
        match tx.depth {
            0 => Err(no_transaction("COMMIT")),
            1 => {
                let rollback_only = tx.rollback_only;
                let sql = if rollback_only { "ROLLBACK" } else { "COMMIT" };
                let result = self
                    .conn
                    .execute_batch(sql)
                    .map_err(|e| crate::error::classify_execution(sql, e));
                if result.is_err() && !self.conn.is_autocommit() {
                    if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                        warn!("rollback after failed {} on {}: {}", sql, self.location, e);
                    }
                }
                self.finish_transaction(&mut tx);
                result?;

                if rollback_only {
                    Err(DataAccessError::execution(
                        "COMMIT",
                        ExecutionFailure::RolledBack,
                        "a nested scope rolled back the transaction",
                    ))
                } else {
                    Ok(())
                }
            }
            _ => {
                tx.depth -= 1;
                Ok(())
            }
        }
    }

    /// Leave the current scope and mark the whole transaction for rollback
    pub fn rollback(&self) -> Result<()> {
        let mut tx = self.tx.borrow_mut();
        match tx.depth {
            0 => Err(no_transaction("ROLLBACK")),
            1 => {
                let result = self
                    .conn
                    .execute_batch("ROLLBACK")
                    .map_err(|e| crate::error::classify_execution("ROLLBACK", e));
                self.finish_transaction(&mut tx);
                result
            }
            _ => {
                tx.depth -= 1;
                tx.rollback_only = true;
                debug!("nested scope rolled back (depth {})", tx.depth);
                Ok(())
            }
        }
    }

    /// Forget the transaction, release its lock and its owning thread
    pub(crate) fn finish_transaction(&self, tx: &mut TransactionState) {
        tx.reset();
        self.tx_owner.release();
    }

    pub fn transaction_depth(&self) -> u32 {
        self.tx.borrow().depth
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_depth() > 0
    }

    /// Run `f` inside a write transaction scope
    ///
    /// Commits when `f` succeeds, rolls back when it fails or panics.
    pub fn transaction<R>(&self, f: impl FnOnce(&Session) -> Result<R>) -> Result<R> {
        self.transaction_with(TransactionMode::Write, f)
    }

    pub fn transaction_with<R>(
        &self,
        mode: TransactionMode,
        f: impl FnOnce(&Session) -> Result<R>,
    ) -> Result<R> {
        self.begin_with(mode)?;
        let mut scope = TxScope {
            session: self,
            armed: true,
        };
        let result = f(self);
        scope.armed = false;

        match result {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback() {
                    warn!("rollback after failed transaction: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Lock guard for a statement run outside any transaction
    ///
    /// Inside a transaction the transaction's own lock already covers the
    /// statement and `None` is returned.
    pub(crate) fn statement_guard(&self, sql: &str, readonly: bool) -> Result<Option<FileLockGuard>> {
        {
            let tx = self.tx.borrow();
            if tx.depth > 0 {
                if !readonly && tx.mode() == TransactionMode::Read {
                    return Err(DataAccessError::execution(
                        sql,
                        ExecutionFailure::ReadOnly,
                        "write statement inside a read transaction",
                    ));
                }
                return Ok(None);
            }
        }

        if !readonly && self.is_read_only() {
            return Err(DataAccessError::execution(
                sql,
                ExecutionFailure::ReadOnly,
                "connection was opened read-only",
            ));
        }

        let guard = if readonly {
            self.lock.read(&self.lock_policy)
        } else {
            self.lock.write(&self.lock_policy)
        };
        guard.map(Some).ok_or_else(|| self.lock_timeout(sql))
    }

    fn lock_timeout(&self, sql: &str) -> DataAccessError {
        DataAccessError::execution(
            sql,
            ExecutionFailure::Busy,
            format!("timed out waiting for the lock on {}", self.lock.key()),
        )
    }
}

/// Rolls the scope back if it is dropped during unwinding
struct TxScope<'s> {
    session: &'s Session,
    armed: bool,
}

impl Drop for TxScope<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.session.rollback() {
                warn!("rollback during unwind failed: {}", e);
            }
        }
    }
}
