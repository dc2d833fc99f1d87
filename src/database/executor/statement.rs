//! Prepared statements and lazy result sequences

use std::sync::Arc;

use rusqlite::{CachedStatement, Rows};
use tracing::debug;

use crate::database::core::connection::Session;
use crate::database::core::lock::FileLockGuard;
use crate::database::mapper::{to_record, ColumnType, Record, Value};
use crate::error::{classify_batch, classify_execution, classify_prepare, DataAccessError, Result};

/// A compiled SQL template bound to one session
///
/// Compiled forms are cached per session by SQL text, so preparing the same
/// template twice reuses the engine statement. Dropping the statement
/// returns it to the cache with its bindings cleared.
pub struct PreparedStatement<'s> {
    session: &'s Session,
    stmt: CachedStatement<'s>,
    sql: String,
    columns: Arc<[String]>,
    param_types: Vec<Option<ColumnType>>,
    readonly: bool,
}

impl<'s> PreparedStatement<'s> {
    /// Declare the expected type of every parameter
    ///
    /// NULL is accepted for any declared type, and integers where a real is
    /// declared.
    pub fn declare_types(mut self, types: &[ColumnType]) -> Result<Self> {
        if types.len() != self.param_types.len() {
            return Err(DataAccessError::bind(
                &self.sql,
                format!(
                    "declared {} parameter types for {} parameters",
                    types.len(),
                    self.param_types.len()
                ),
            ));
        }
        self.param_types = types.iter().copied().map(Some).collect();
        Ok(self)
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn parameter_count(&self) -> usize {
        self.param_types.len()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Whether the statement leaves the database unchanged
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Validate every parameter first, then bind them all
    fn bind(&mut self, params: &[Value]) -> Result<()> {
        if params.len() != self.param_types.len() {
            return Err(DataAccessError::bind(
                &self.sql,
                format!(
                    "expected {} parameters, got {}",
                    self.param_types.len(),
                    params.len()
                ),
            ));
        }
        for (idx, (param, declared)) in params.iter().zip(&self.param_types).enumerate() {
            if let Some(declared) = declared {
                if !declared.accepts(param.column_type()) {
                    return Err(DataAccessError::bind(
                        &self.sql,
                        format!(
                            "parameter {} expects {}, got {}",
                            idx + 1,
                            declared,
                            param.column_type()
                        ),
                    ));
                }
            }
        }

        self.stmt.clear_bindings();
        for (idx, param) in params.iter().enumerate() {
            if let Err(e) = self.stmt.raw_bind_parameter(idx + 1, param) {
                self.stmt.clear_bindings();
                return Err(DataAccessError::bind(&self.sql, e));
            }
        }
        Ok(())
    }

    /// Run the statement and return its rows as a lazy, single-pass sequence
    ///
    /// Outside a transaction the sequence holds the file lock until it is
    /// exhausted or dropped.
    pub fn execute(&mut self, params: &[Value]) -> Result<RecordStream<'_>> {
        self.bind(params)?;
        let guard = self.session.statement_guard(&self.sql, self.readonly)?;
        Ok(RecordStream {
            rows: self.stmt.raw_query(),
            columns: Arc::clone(&self.columns),
            sql: self.sql.clone(),
            guard,
            finished: false,
        })
    }

    /// Run a statement that returns no rows; returns the affected-row count
    pub fn execute_non_query(&mut self, params: &[Value]) -> Result<usize> {
        self.bind(params)?;
        let _guard = self.session.statement_guard(&self.sql, self.readonly)?;
        self.stmt
            .raw_execute()
            .map_err(|e| classify_execution(&self.sql, e))
    }

    /// First column of the first row
    pub fn execute_scalar(&mut self, params: &[Value]) -> Result<Value> {
        let sql = self.sql.clone();
        let mut rows = self.execute(params)?;
        match rows.next() {
            Some(record) => record?
                .into_values()
                .into_iter()
                .next()
                .ok_or(DataAccessError::EmptyResult { sql }),
            None => Err(DataAccessError::EmptyResult { sql }),
        }
    }
}

/// Lazy, single-pass sequence of records
///
/// Rows come back in engine iteration order. The sequence cannot be
/// restarted; the first error ends it.
pub struct RecordStream<'a> {
    rows: Rows<'a>,
    columns: Arc<[String]>,
    sql: String,
    // declared after `rows` so the statement is reset before the lock drops
    guard: Option<FileLockGuard>,
    finished: bool,
}

impl RecordStream<'_> {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

impl Iterator for RecordStream<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let item = match self.rows.next() {
            Ok(Some(row)) => Some(to_record(&self.columns, row)),
            Ok(None) => None,
            Err(e) => Some(Err(classify_execution(&self.sql, e))),
        };
        if !matches!(item, Some(Ok(_))) {
            self.finished = true;
            // nothing more will be read
            self.guard = None;
        }
        item
    }
}

impl Session {
    /// Compile (or fetch from cache) a SQL template
    pub fn prepare(&self, sql: &str) -> Result<PreparedStatement<'_>> {
        if sql.trim().is_empty() {
            return Err(DataAccessError::Syntax {
                sql: sql.to_string(),
                message: "empty statement".to_string(),
            });
        }
        debug!("preparing statement: {}", sql);
        let stmt = self
            .conn
            .prepare_cached(sql)
            .map_err(|e| classify_prepare(sql, e))?;
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let readonly = stmt.readonly();
        let param_types = vec![None; stmt.parameter_count()];

        Ok(PreparedStatement {
            session: self,
            stmt,
            sql: sql.to_string(),
            columns,
            param_types,
            readonly,
        })
    }

    /// Run one or more statements without parameters
    ///
    /// Always treated as a write, so it takes the write lock when no
    /// transaction is open.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let _guard = self.statement_guard(sql, false)?;
        self.conn
            .execute_batch(sql)
            .map_err(|e| classify_batch(sql, e))
    }

    pub fn execute_non_query(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.prepare(sql)?.execute_non_query(params)
    }

    pub fn execute_scalar(&self, sql: &str, params: &[Value]) -> Result<Value> {
        self.prepare(sql)?.execute_scalar(params)
    }

    /// Run a query and collect every record
    pub fn query_records(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        let mut stmt = self.prepare(sql)?;
        let records = stmt.execute(params)?.collect::<Result<Vec<_>>>();
        records
    }

    /// Row id of the most recent successful insert on this session
    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::connection::{ConnectionHandle, DatabaseLocation, OpenOptions};
    use crate::error::ExecutionFailure;

    fn session_test(f: impl FnOnce(&Session) -> Result<()>) {
        let handle =
            ConnectionHandle::open(DatabaseLocation::memory("exec"), &OpenOptions::default()).unwrap();
        handle
            .with_session(|s| {
                s.execute_batch(
                    "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE, weight REAL)",
                )?;
                f(s)
            })
            .unwrap();
    }

    #[test]
    fn test_syntax_error_on_prepare() {
        session_test(|s| {
            let err = s.prepare("SELEKT * FROM items").err().unwrap();
            assert!(matches!(err, DataAccessError::Syntax { ref sql, .. } if sql == "SELEKT * FROM items"));
            assert!(matches!(s.prepare("   "), Err(DataAccessError::Syntax { .. })));
            Ok(())
        });
    }

    #[test]
    fn test_execute_returns_lazy_records() {
        session_test(|s| {
            let mut insert = s.prepare("INSERT INTO items (name, weight) VALUES (?1, ?2)")?;
            assert!(!insert.is_readonly());
            assert_eq!(insert.parameter_count(), 2);
            for (name, weight) in [("sword", 2.5), ("shield", 4.0), ("bow", 1.0)] {
                assert_eq!(insert.execute_non_query(&[name.into(), weight.into()])?, 1);
            }
            drop(insert);
            assert_eq!(s.last_insert_rowid(), 3);

            let mut select = s.prepare("SELECT id, name FROM items ORDER BY id")?;
            assert_eq!(select.columns(), &["id".to_string(), "name".to_string()]);
            let mut rows = select.execute(&[])?;
            let first = rows.next().unwrap()?;
            assert_eq!(
                first,
                Record::from_pairs([("id", Value::from(1)), ("name", Value::from("sword"))])
            );
            assert_eq!(rows.count(), 2);
            Ok(())
        });
    }

    #[test]
    fn test_bind_count_mismatch() {
        session_test(|s| {
            let err = s
                .execute_non_query("INSERT INTO items (name) VALUES (?1)", &[])
                .unwrap_err();
            assert!(matches!(err, DataAccessError::Bind { .. }));

            let err = s
                .execute_non_query(
                    "INSERT INTO items (name) VALUES (?1)",
                    &["a".into(), "b".into()],
                )
                .unwrap_err();
            assert!(matches!(err, DataAccessError::Bind { .. }));
            assert_eq!(s.execute_scalar("SELECT COUNT(*) FROM items", &[])?, Value::Integer(0));
            Ok(())
        });
    }

    #[test]
    fn test_declared_types_reject_before_binding() {
        session_test(|s| {
            let sql = "INSERT INTO items (name, weight) VALUES (?1, ?2)";
            let mut stmt = s
                .prepare(sql)?
                .declare_types(&[ColumnType::Text, ColumnType::Real])?;

            let err = stmt
                .execute_non_query(&["sword".into(), "heavy".into()])
                .unwrap_err();
            assert!(matches!(err, DataAccessError::Bind { .. }));

            // integers widen to real, NULL fits anything
            assert_eq!(stmt.execute_non_query(&["sword".into(), 3.into()])?, 1);
            assert_eq!(stmt.execute_non_query(&["axe".into(), Value::Null])?, 1);

            assert!(s.prepare(sql)?.declare_types(&[ColumnType::Text]).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_constraint_violation() {
        session_test(|s| {
            let sql = "INSERT INTO items (name) VALUES (?1)";
            s.execute_non_query(sql, &["sword".into()])?;
            let err = s.execute_non_query(sql, &["sword".into()]).unwrap_err();
            assert!(matches!(
                err,
                DataAccessError::Execution {
                    kind: ExecutionFailure::Constraint,
                    ..
                }
            ));
            // bound values stay out of the message
            assert!(!err.to_string().contains("sword"));
            Ok(())
        });
    }

    #[test]
    fn test_scalar_on_empty_result() {
        session_test(|s| {
            let err = s
                .execute_scalar("SELECT name FROM items WHERE id = ?1", &[42.into()])
                .unwrap_err();
            assert!(matches!(err, DataAccessError::EmptyResult { .. }));
            Ok(())
        });
    }

    #[test]
    fn test_stream_holds_read_lock_until_exhausted() {
        session_test(|s| {
            s.execute_non_query("INSERT INTO items (name) VALUES ('a')", &[])?;
            let mut stmt = s.prepare("SELECT name FROM items")?;
            let mut rows = stmt.execute(&[])?;
            assert_eq!(s.lock.reader_count(), 1);
            assert!(rows.next().is_some());
            assert!(rows.next().is_none());
            assert_eq!(s.lock.reader_count(), 0);
            Ok(())
        });
    }

    #[test]
    fn test_statement_cache_reuse() {
        session_test(|s| {
            let sql = "SELECT COUNT(*) FROM items";
            for _ in 0..3 {
                assert_eq!(s.execute_scalar(sql, &[])?, Value::Integer(0));
            }
            Ok(())
        });
    }
}
