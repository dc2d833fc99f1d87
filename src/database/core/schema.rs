//! Database schema management
//!
//! Schemas evolve through an ordered list of [`MigrationStep`]s. The version
//! of the last applied step is kept in the single-row `schema_version` table,
//! and every applied step is recorded in `schema_migrations`. The table names
//! and columns are stable across releases since upgrading installations rely
//! on them.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::database::core::connection::Session;
use crate::database::mapper::Value;
use crate::error::{DataAccessError, Result};

/// Schema definitions for the migration bookkeeping tables
pub struct SchemaDefinitions;

impl SchemaDefinitions {
    /// Name of the table holding the schema version marker
    pub const VERSION_TABLE_NAME: &'static str = "schema_version";

    /// Name of the table recording applied migration steps
    pub const HISTORY_TABLE_NAME: &'static str = "schema_migrations";

    /// SQL for creating the version marker table (always exactly one row)
    pub const VERSION_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
    "#;

    /// SQL for creating the migration history table
    pub const HISTORY_TABLE: &'static str = r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );
    "#;
}

/// One versioned schema transform
///
/// Steps are defined at build time and never change once released. The SQL
/// may contain several statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStep {
    pub version: u32,
    pub description: Cow<'static, str>,
    pub sql: Cow<'static, str>,
}

impl MigrationStep {
    pub const fn new(version: u32, description: &'static str, sql: &'static str) -> Self {
        Self {
            version,
            description: Cow::Borrowed(description),
            sql: Cow::Borrowed(sql),
        }
    }

    /// Step with generated SQL, e.g. from [`Shape::create_table_sql`](crate::database::Shape::create_table_sql)
    pub fn generated(version: u32, description: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            description: Cow::Owned(description.into()),
            sql: Cow::Owned(sql.into()),
        }
    }

    fn failure(&self, message: impl std::fmt::Display) -> DataAccessError {
        DataAccessError::Migration {
            version: self.version,
            description: self.description.to_string(),
            message: message.to_string(),
        }
    }
}

/// Outcome of a [`SchemaManager::migrate`] call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    /// Versions applied by this call, in order
    pub applied: Vec<u32>,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// A step recorded in the history table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: u32,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}

/// Schema manager for one session
///
/// Handles version checking and migrations.
pub struct SchemaManager<'a> {
    session: &'a Session,
}

impl<'a> SchemaManager<'a> {
    /// Create a new schema manager for the given session
    pub fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Read the schema version marker; 0 for a brand-new database
    pub fn current_version(&self) -> Result<u32> {
        if !self
            .session
            .table_exists(SchemaDefinitions::VERSION_TABLE_NAME)?
        {
            return Ok(0);
        }

        let sql = "SELECT version FROM schema_version WHERE id = 1";
        match self.session.execute_scalar(sql, &[]) {
            Ok(Value::Integer(v)) => u32::try_from(v)
                .map_err(|e| DataAccessError::type_mapping("version", e)),
            Ok(other) => Err(DataAccessError::type_mapping(
                "version",
                format!("expected INTEGER, found {}", other.column_type()),
            )),
            Err(DataAccessError::EmptyResult { .. }) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Check the current schema status against a step list
    pub fn check_status(&self, steps: &[MigrationStep]) -> Result<SchemaStatus> {
        validate_steps(steps)?;
        if !self
            .session
            .table_exists(SchemaDefinitions::VERSION_TABLE_NAME)?
        {
            return Ok(SchemaStatus::NotInitialized);
        }

        let current = self.current_version()?;
        let target = target_version(steps);

        if current == target {
            Ok(SchemaStatus::Current)
        } else if current < target {
            Ok(SchemaStatus::NeedsMigration {
                from: current,
                to: target,
            })
        } else {
            // Database is from a newer version
            Ok(SchemaStatus::Incompatible {
                database_version: current,
                required_version: target,
            })
        }
    }

    /// Apply every step newer than the current version, in order
    ///
    /// Each step runs in its own transaction. On failure only that step is
    /// rolled back; the marker stays at the last applied version. Running it
    /// on an up-to-date database executes no SQL beyond the version check.
    pub fn migrate(&self, steps: &[MigrationStep]) -> Result<MigrationReport> {
        validate_steps(steps)?;
        let from = self.current_version()?;
        let target = target_version(steps);

        if from == target {
            debug!("schema of {} is current (version {})", self.session.location(), from);
            return Ok(MigrationReport {
                from,
                to: from,
                applied: Vec::new(),
            });
        }

        if from > target {
            let newest = steps.last().map(|s| s.description.to_string()).unwrap_or_default();
            return Err(DataAccessError::Migration {
                version: target,
                description: newest,
                message: format!(
                    "database schema version {} is newer than the highest known step",
                    from
                ),
            });
        }

        self.session.execute_batch(SchemaDefinitions::VERSION_TABLE)?;
        self.session.execute_batch(SchemaDefinitions::HISTORY_TABLE)?;

        let mut applied = Vec::new();
        for step in steps.iter().filter(|s| s.version > from) {
            self.apply(step).map_err(|e| step.failure(e))?;
            info!(
                "applied migration {} ({}) to {}",
                step.version,
                step.description,
                self.session.location()
            );
            applied.push(step.version);
        }

        Ok(MigrationReport {
            from,
            to: target,
            applied,
        })
    }

    fn apply(&self, step: &MigrationStep) -> Result<()> {
        self.session.transaction(|s| {
            s.execute_batch(&step.sql)?;
            let now = Utc::now().timestamp();
            s.execute_non_query(
                "INSERT OR REPLACE INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                &[step.version.into(), now.into()],
            )?;
            s.execute_non_query(
                "INSERT OR REPLACE INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                &[
                    step.version.into(),
                    Value::Text(step.description.to_string()),
                    now.into(),
                ],
            )?;
            Ok(())
        })
    }

    /// Applied steps, oldest first
    pub fn history(&self) -> Result<Vec<AppliedMigration>> {
        if !self
            .session
            .table_exists(SchemaDefinitions::HISTORY_TABLE_NAME)?
        {
            return Ok(Vec::new());
        }

        let sql = "SELECT version, description, applied_at FROM schema_migrations ORDER BY version";
        self.session
            .query_records(sql, &[])?
            .into_iter()
            .map(|record| {
                let version = record
                    .get("version")
                    .and_then(Value::as_i64)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| DataAccessError::type_mapping("version", "expected a version number"))?;
                let description = record
                    .get("description")
                    .and_then(Value::as_str)
                    .ok_or_else(|| DataAccessError::type_mapping("description", "expected text"))?
                    .to_string();
                let applied_at = record
                    .get("applied_at")
                    .and_then(Value::as_i64)
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
                    .ok_or_else(|| DataAccessError::type_mapping("applied_at", "expected a unix timestamp"))?;
                Ok(AppliedMigration {
                    version,
                    description,
                    applied_at,
                })
            })
            .collect()
    }
}

fn target_version(steps: &[MigrationStep]) -> u32 {
    steps.last().map(|s| s.version).unwrap_or(0)
}

/// Steps must be strictly increasing and start at version 1
pub fn validate_steps(steps: &[MigrationStep]) -> Result<()> {
    let mut previous = 0;
    for (idx, step) in steps.iter().enumerate() {
        if idx == 0 && step.version != 1 {
            return Err(step.failure("the first migration step must have version 1"));
        }
        if step.version <= previous {
            return Err(step.failure(format!(
                "versions must be strictly increasing (follows version {})",
                previous
            )));
        }
        previous = step.version;
    }
    Ok(())
}

/// Status of the database schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaStatus {
    /// Database is not initialized (fresh database)
    NotInitialized,

    /// Schema is at the highest known version
    Current,

    /// Schema needs migration from an older version
    NeedsMigration { from: u32, to: u32 },

    /// Database is from a newer version (incompatible)
    Incompatible {
        database_version: u32,
        required_version: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::connection::{ConnectionHandle, DatabaseLocation, OpenOptions};

    const STEPS: &[MigrationStep] = &[
        MigrationStep::new(
            1,
            "create items",
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);",
        ),
        MigrationStep::new(
            2,
            "add item weight",
            "ALTER TABLE items ADD COLUMN weight REAL NOT NULL DEFAULT 0;",
        ),
        MigrationStep::new(
            3,
            "create owners",
            "CREATE TABLE owners (id INTEGER PRIMARY KEY, item_id INTEGER REFERENCES items(id));
             CREATE INDEX idx_owners_item ON owners(item_id);",
        ),
    ];

    fn create_test_db() -> ConnectionHandle {
        ConnectionHandle::open(DatabaseLocation::memory("schema"), &OpenOptions::default()).unwrap()
    }

    fn schema_dump(s: &Session) -> Vec<String> {
        s.query_records(
            "SELECT sql FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' AND sql IS NOT NULL ORDER BY name",
            &[],
        )
        .unwrap()
        .into_iter()
        .filter_map(|r| r.get("sql").and_then(Value::as_str).map(String::from))
        .collect()
    }

    #[test]
    fn test_schema_not_initialized() {
        let handle = create_test_db();
        handle
            .with_session(|s| {
                let manager = SchemaManager::new(s);
                assert_eq!(manager.current_version()?, 0);
                assert_eq!(manager.check_status(STEPS)?, SchemaStatus::NotInitialized);
                assert!(manager.history()?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_migrate_fresh_database() {
        let handle = create_test_db();
        handle
            .with_session(|s| {
                let manager = SchemaManager::new(s);
                let report = manager.migrate(STEPS)?;
                assert_eq!(
                    report,
                    MigrationReport {
                        from: 0,
                        to: 3,
                        applied: vec![1, 2, 3]
                    }
                );
                assert_eq!(manager.current_version()?, 3);
                assert_eq!(manager.check_status(STEPS)?, SchemaStatus::Current);

                let history = manager.history()?;
                assert_eq!(history.len(), 3);
                assert_eq!(history[1].description, "add item weight");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_migrate_twice_is_noop() {
        let handle = create_test_db();
        handle
            .with_session(|s| {
                let manager = SchemaManager::new(s);
                manager.migrate(STEPS)?;
                let history_before = manager.history()?;
                let updated_before = s.execute_scalar("SELECT updated_at FROM schema_version", &[])?;

                // the steps are not re-runnable, so success means nothing executed
                let report = manager.migrate(STEPS)?;
                assert!(report.is_noop());
                assert_eq!(report.from, 3);
                assert_eq!(manager.history()?, history_before);
                assert_eq!(
                    s.execute_scalar("SELECT updated_at FROM schema_version", &[])?,
                    updated_before
                );
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_migration_converges_from_intermediate_version() {
        let fresh = create_test_db();
        let staged = create_test_db();

        let fresh_schema = fresh
            .with_session(|s| {
                SchemaManager::new(s).migrate(STEPS)?;
                Ok(schema_dump(s))
            })
            .unwrap();

        let staged_schema = staged
            .with_session(|s| {
                let manager = SchemaManager::new(s);
                manager.migrate(&STEPS[..1])?;
                assert_eq!(
                    manager.check_status(STEPS)?,
                    SchemaStatus::NeedsMigration { from: 1, to: 3 }
                );
                let report = manager.migrate(STEPS)?;
                assert_eq!(report.applied, vec![2, 3]);
                assert_eq!(manager.current_version()?, 3);
                Ok(schema_dump(s))
            })
            .unwrap();

        assert_eq!(fresh_schema, staged_schema);
    }

    #[test]
    fn test_failed_step_keeps_last_good_version() {
        let handle = create_test_db();
        let broken = [
            STEPS[0].clone(),
            MigrationStep::new(
                2,
                "broken step",
                "CREATE TABLE extra (id INTEGER PRIMARY KEY); INSERT INTO nowhere VALUES (1);",
            ),
        ];

        handle
            .with_session(|s| {
                let manager = SchemaManager::new(s);
                let err = manager.migrate(&broken).unwrap_err();
                match err {
                    DataAccessError::Migration {
                        version,
                        description,
                        ..
                    } => {
                        assert_eq!(version, 2);
                        assert_eq!(description, "broken step");
                    }
                    other => panic!("unexpected error: {other:?}"),
                }
                assert_eq!(manager.current_version()?, 1);
                // the failed step's DDL was rolled back with it
                assert!(!s.table_exists("extra")?);
                assert!(!s.in_transaction());

                // a fixed step list picks up from version 1
                let report = manager.migrate(STEPS)?;
                assert_eq!(report.applied, vec![2, 3]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_invalid_step_lists() {
        let starts_at_two = [MigrationStep::new(2, "two", "SELECT 1;")];
        assert!(validate_steps(&starts_at_two).is_err());

        let repeated = [
            MigrationStep::new(1, "one", "SELECT 1;"),
            MigrationStep::new(1, "again", "SELECT 1;"),
        ];
        assert!(validate_steps(&repeated).is_err());

        let with_gap = [
            MigrationStep::new(1, "one", "SELECT 1;"),
            MigrationStep::new(5, "five", "SELECT 1;"),
        ];
        assert!(validate_steps(&with_gap).is_ok());
        assert!(validate_steps(&[]).is_ok());
    }

    #[test]
    fn test_newer_database_is_rejected() {
        let handle = create_test_db();
        handle
            .with_session(|s| {
                let manager = SchemaManager::new(s);
                manager.migrate(STEPS)?;
                assert_eq!(
                    manager.check_status(&STEPS[..2])?,
                    SchemaStatus::Incompatible {
                        database_version: 3,
                        required_version: 2
                    }
                );
                assert!(matches!(
                    manager.migrate(&STEPS[..2]),
                    Err(DataAccessError::Migration { .. })
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_corrupt_history_row_is_reported() {
        let handle = create_test_db();
        handle
            .with_session(|s| {
                let manager = SchemaManager::new(s);
                manager.migrate(STEPS)?;
                s.execute_non_query(
                    "UPDATE schema_migrations SET applied_at = 'yesterday' WHERE version = 2",
                    &[],
                )?;
                assert!(matches!(
                    manager.history(),
                    Err(DataAccessError::TypeMapping { ref column, .. }) if column == "applied_at"
                ));

                s.execute_non_query(
                    "UPDATE schema_migrations SET applied_at = 0, description = X'00ff' WHERE version = 2",
                    &[],
                )?;
                assert!(matches!(
                    manager.history(),
                    Err(DataAccessError::TypeMapping { ref column, .. }) if column == "description"
                ));
                Ok(())
            })
            .unwrap();
    }
}
