//! Data access facade
//!
//! [`DataStore`] composes the connection, executor, mapper and migrator into
//! CRUD-style operations over [`Entity`] types. The schema is migrated when
//! the store is constructed, before any caller query runs.
//!
//! A store wraps one connection handle and inherits its thread rules: a store
//! on an affine handle fails with [`DataAccessError::ThreadAffinity`] when
//! used from another thread. Use [`StoreWorker`] to run work on a dedicated
//! thread and receive the results asynchronously.

mod entity;
mod filter;
mod worker;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

pub use entity::Entity;
pub use filter::{Comparison, Filter, Order, Query};
pub use worker::{Pending, StoreWorker};

use crate::config::DataAccessConfig;
use crate::database::core::{
    ConnectionHandle, ConnectionManager, DatabaseLocation, MigrationReport, MigrationStep,
    OpenOptions, RetryPolicy, SchemaManager, Session,
};
use crate::database::mapper::{
    entity_to_object, from_engine_value, object_to_entity, quote_ident, to_engine_value, Record,
    Shape, Value, CREATED_AT, UPDATED_AT,
};
use crate::error::{DataAccessError, Result};

/// CRUD and transactional access to one logical database
pub struct DataStore {
    handle: Arc<ConnectionHandle>,
    retry: RetryPolicy,
    schema_failure: Mutex<Option<DataAccessError>>,
    schema_version: AtomicU32,
}

impl DataStore {
    /// Open a store through a connection manager and migrate it
    pub fn open(
        manager: &ConnectionManager,
        location: DatabaseLocation,
        steps: &[MigrationStep],
    ) -> Result<Self> {
        let handle = manager.open_default(location)?;
        Self::with_handle(handle, manager.config().retry, steps)
    }

    /// Private in-memory store, mostly useful for tests
    pub fn open_in_memory(steps: &[MigrationStep]) -> Result<Self> {
        let handle = ConnectionHandle::open(DatabaseLocation::memory("store"), &OpenOptions::default())?;
        Self::with_handle(Arc::new(handle), RetryPolicy::default(), steps)
    }

    /// Open the store configured by `config`
    pub fn from_config(config: &DataAccessConfig, steps: &[MigrationStep]) -> Result<Self> {
        let manager = ConnectionManager::new(config.manager_config());
        Self::open(&manager, DatabaseLocation::file(config.sqlite_path()), steps)
    }

    /// Wrap an open handle and migrate it
    ///
    /// Fails with the migration error if the schema cannot be brought up to
    /// date.
    pub fn with_handle(
        handle: Arc<ConnectionHandle>,
        retry: RetryPolicy,
        steps: &[MigrationStep],
    ) -> Result<Self> {
        let store = Self {
            handle,
            retry,
            schema_failure: Mutex::new(None),
            schema_version: AtomicU32::new(0),
        };
        store.migrate(steps)?;
        Ok(store)
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    /// Schema version after the last successful migration
    pub fn schema_version(&self) -> u32 {
        self.schema_version.load(Ordering::Acquire)
    }

    /// Bring the schema up to date with `steps`
    ///
    /// A migration failure makes every other operation fail with the same
    /// error until a later call succeeds.
    pub fn migrate(&self, steps: &[MigrationStep]) -> Result<MigrationReport> {
        let result = self
            .handle
            .with_session(|s| SchemaManager::new(s).migrate(steps));

        match &result {
            Ok(report) => {
                self.schema_version.store(report.to, Ordering::Release);
                if self.schema_failure.lock().take().is_some() {
                    info!("schema of {} recovered at version {}", self.handle.location(), report.to);
                }
            }
            Err(e @ DataAccessError::Migration { .. }) => {
                warn!("store {} unusable until migrations succeed: {}", self.handle.location(), e);
                *self.schema_failure.lock() = Some(e.clone());
            }
            Err(_) => {}
        }
        result
    }

    fn check_schema(&self) -> Result<()> {
        match &*self.schema_failure.lock() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Run `f` on the session, retrying transient lock contention
    ///
    /// Retries only happen in autocommit mode; inside a transaction the
    /// error goes straight back to the caller.
    fn with_retry<R>(&self, f: impl Fn(&Session) -> Result<R>) -> Result<R> {
        self.check_schema()?;
        self.handle.with_session(|s| {
            if s.in_transaction() {
                return f(s);
            }
            let mut delay = self.retry.backoff;
            let mut attempt = 0;
            loop {
                match f(s) {
                    Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                        attempt += 1;
                        debug!(
                            "retrying after transient error (attempt {}/{}): {}",
                            attempt, self.retry.max_retries, e
                        );
                        thread::sleep(delay);
                        delay = delay.saturating_mul(2);
                    }
                    result => return result,
                }
            }
        })
    }

    /// Insert an entity and fill in its id
    ///
    /// An explicit id is kept; otherwise the engine assigns one.
    pub fn create<T: Entity>(&self, entity: &mut T) -> Result<i64> {
        let shape = T::shape();
        let object = entity_to_object(entity, &shape)?;

        let mut columns: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();
        if let Some(id) = entity.id() {
            columns.push(quote_ident(shape.id_column()));
            params.push(Value::Integer(id));
        }
        for (field, value) in shape.fields().iter().zip(from_engine_value(&object, &shape)?) {
            columns.push(quote_ident(&field.name));
            params.push(value);
        }
        let now = Utc::now().timestamp();
        if shape.has_timestamps() {
            columns.push(quote_ident(CREATED_AT));
            columns.push(quote_ident(UPDATED_AT));
            params.push(Value::Integer(now));
            params.push(Value::Integer(now));
        }

        let placeholders = (1..=params.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(shape.table()),
            columns.join(", "),
            placeholders
        );

        let explicit = entity.id();
        let id = self.with_retry(|s| {
            s.execute_non_query(&sql, &params)?;
            Ok(explicit.unwrap_or_else(|| s.last_insert_rowid()))
        })?;

        entity.set_id(id);
        if shape.has_timestamps() {
            entity.set_timestamps(Some(now), now);
        }
        Ok(id)
    }

    pub fn fetch_by_id<T: Entity>(&self, id: i64) -> Result<Option<T>> {
        let shape = T::shape();
        self.fetch_record_by_id(&shape, id)?
            .map(|record| record_to_entity(&record, &shape))
            .transpose()
    }

    /// Fetch the raw record for `id` with the shape's columns
    pub fn fetch_record_by_id(&self, shape: &Shape, id: i64) -> Result<Option<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            shape.select_columns(),
            quote_ident(shape.table()),
            quote_ident(shape.id_column())
        );
        let mut records = self.with_retry(|s| s.query_records(&sql, &[Value::Integer(id)]))?;
        Ok(if records.is_empty() {
            None
        } else {
            Some(records.swap_remove(0))
        })
    }

    pub fn query<T: Entity>(&self, query: &Query) -> Result<Vec<T>> {
        let shape = T::shape();
        self.query_records(&shape, query)?
            .iter()
            .map(|record| record_to_entity(record, &shape))
            .collect()
    }

    /// Records of `shape` matching `query`
    pub fn query_records(&self, shape: &Shape, query: &Query) -> Result<Vec<Record>> {
        let mut params = Vec::new();
        let clause = query.to_sql(shape, &mut params)?;
        let sql = format!(
            "SELECT {} FROM {}{}",
            shape.select_columns(),
            quote_ident(shape.table()),
            clause
        );
        self.with_retry(|s| s.query_records(&sql, &params))
    }

    /// First entity matching `query`, ignoring its limit
    pub fn first<T: Entity>(&self, query: &Query) -> Result<Option<T>> {
        let query = query.clone().limit(1);
        Ok(self.query::<T>(&query)?.into_iter().next())
    }

    pub fn count<T: Entity>(&self, filter: &Filter) -> Result<u64> {
        let shape = T::shape();
        let mut params = Vec::new();
        let condition = filter.to_sql(&shape, &mut params)?;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            quote_ident(shape.table()),
            condition
        );
        let value = self.with_retry(|s| s.execute_scalar(&sql, &params))?;
        value
            .as_i64()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| DataAccessError::type_mapping("COUNT(*)", "expected a row count"))
    }

    /// Write every field of an existing entity
    ///
    /// Returns `false` if no row has the entity's id.
    pub fn update<T: Entity>(&self, entity: &mut T) -> Result<bool> {
        let shape = T::shape();
        let id = entity.id().ok_or_else(|| DataAccessError::MissingField {
            field: shape.id_column().to_string(),
        })?;

        let now = Utc::now().timestamp();
        let mut params = Vec::new();
        let assignments = set_clause(&*entity, &shape, now, &mut params)?;
        if assignments.is_empty() {
            // nothing to write; report whether the row exists
            return Ok(self.fetch_record_by_id(&shape, id)?.is_some());
        }
        params.push(Value::Integer(id));
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote_ident(shape.table()),
            assignments,
            quote_ident(shape.id_column()),
            params.len()
        );

        let updated = self.with_retry(|s| s.execute_non_query(&sql, &params))? > 0;
        if updated && shape.has_timestamps() {
            entity.set_timestamps(None, now);
        }
        Ok(updated)
    }

    /// Write the fields of `entity` to every row matching `filter`
    ///
    /// The entity's id is ignored. Returns the number of rows changed.
    pub fn update_where<T: Entity>(&self, entity: &T, filter: &Filter) -> Result<usize> {
        let shape = T::shape();
        let mut params = Vec::new();
        let assignments = set_clause(entity, &shape, Utc::now().timestamp(), &mut params)?;
        if assignments.is_empty() {
            return Ok(0);
        }
        let condition = filter.to_sql(&shape, &mut params)?;
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(shape.table()),
            assignments,
            condition
        );
        self.with_retry(|s| s.execute_non_query(&sql, &params))
    }

    /// Delete by id; returns whether a row was removed
    pub fn delete<T: Entity>(&self, id: i64) -> Result<bool> {
        let shape = T::shape();
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(shape.table()),
            quote_ident(shape.id_column())
        );
        Ok(self.with_retry(|s| s.execute_non_query(&sql, &[Value::Integer(id)]))? > 0)
    }

    /// Delete every row matching `filter`; returns the number removed
    pub fn delete_where<T: Entity>(&self, filter: &Filter) -> Result<usize> {
        let shape = T::shape();
        let mut params = Vec::new();
        let condition = filter.to_sql(&shape, &mut params)?;
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            quote_ident(shape.table()),
            condition
        );
        self.with_retry(|s| s.execute_non_query(&sql, &params))
    }

    /// Run an arbitrary query
    pub fn records(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        self.with_retry(|s| s.query_records(sql, params))
    }

    /// Run an arbitrary non-query; returns the affected-row count
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.with_retry(|s| s.execute_non_query(sql, params))
    }

    pub fn scalar(&self, sql: &str, params: &[Value]) -> Result<Value> {
        self.with_retry(|s| s.execute_scalar(sql, params))
    }

    /// Run `f` inside one write transaction
    ///
    /// Every store operation `f` performs joins the transaction. It commits
    /// when `f` succeeds and rolls back when `f` fails. Nested calls join the
    /// outer transaction; a failing nested call dooms it.
    pub fn run_in_transaction<R>(&self, f: impl FnOnce(&DataStore) -> Result<R>) -> Result<R> {
        self.check_schema()?;
        self.handle.with_session(|s| s.transaction(|_| f(self)))
    }

    /// Close the underlying handle
    pub fn close(&self) -> Result<()> {
        self.handle.close()
    }
}

/// `SET` assignments for every field of `entity`, plus `updated_at`
///
/// Placeholders are numbered after the parameters already in `params`.
fn set_clause<T: Entity>(
    entity: &T,
    shape: &Shape,
    now: i64,
    params: &mut Vec<Value>,
) -> Result<String> {
    let object = entity_to_object(entity, shape)?;
    let mut assignments = Vec::new();
    for (field, value) in shape.fields().iter().zip(from_engine_value(&object, shape)?) {
        params.push(value);
        assignments.push(format!("{} = ?{}", quote_ident(&field.name), params.len()));
    }
    if shape.has_timestamps() {
        params.push(Value::Integer(now));
        assignments.push(format!("{} = ?{}", quote_ident(UPDATED_AT), params.len()));
    }
    Ok(assignments.join(", "))
}

fn record_to_entity<T: Entity>(record: &Record, shape: &Shape) -> Result<T> {
    let object = to_engine_value(record, shape)?;
    object_to_entity(&object, shape)
}
