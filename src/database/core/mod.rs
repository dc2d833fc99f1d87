//! Core database infrastructure
//!
//! This module provides the foundational database components:
//! - `ConnectionHandle`/`Session`: one configured embedded-database session
//! - `FileLock`: single-writer/multi-reader lock shared per database file
//! - `ConnectionManager`: handle lifecycle and pooled reuse
//! - `SchemaManager`: versioned schema migrations

pub(crate) mod connection;
pub(crate) mod lock;
mod pool;
mod schema;

pub use connection::{ConnectionHandle, DatabaseLocation, OpenMode, OpenOptions, Session, ThreadMode};
pub use lock::{FileLock, FileLockGuard, LockKind, LockPolicy};
pub use pool::{ConnectionManager, ManagerConfig, PooledConnection, RetryPolicy};
pub use schema::{
    validate_steps, AppliedMigration, MigrationReport, MigrationStep, SchemaDefinitions,
    SchemaManager, SchemaStatus,
};
