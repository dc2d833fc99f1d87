//! Database module
//!
//! Everything needed to talk to an embedded SQLite database, organized into:
//!
//! - **core**: connections, the shared file lock, pooling and schema migration
//! - **executor**: prepared statements, lazy result streams and transactions
//! - **mapper**: conversion between rows, records and typed value objects
//! - **store**: the [`DataStore`] facade and its background worker
//!
//! # Architecture
//!
//! ```text
//! database/
//! ├── core/           # Foundation
//! │   ├── connection  # ConnectionHandle, Session, open options
//! │   ├── lock        # Per-file reader/writer lock
//! │   ├── pool        # ConnectionManager and pooled leases
//! │   └── schema      # Versioned migrations
//! │
//! ├── executor/       # Statements
//! │   ├── statement   # PreparedStatement, RecordStream
//! │   └── transaction # Nested transactions
//! │
//! ├── mapper/         # Row mapping
//! │   ├── value       # Value, Record
//! │   └── shape       # Shape, FieldSpec, engine value objects
//! │
//! └── store/          # Facade
//!     ├── filter      # Filter and Query builders
//!     ├── entity      # Entity trait
//!     └── worker      # StoreWorker, Pending
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use dataaccess::database::{DataStore, Filter, MigrationStep, Query};
//!
//! const STEPS: &[MigrationStep] = &[MigrationStep::new(
//!     1,
//!     "create items",
//!     "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, level INTEGER NOT NULL)",
//! )];
//!
//! let store = DataStore::open_in_memory(STEPS)?;
//! let mut sword = Item { id: None, name: "sword".into(), level: 3 };
//! store.create(&mut sword)?;
//!
//! let strong: Vec<Item> = store.query(&Query::new().filter(Filter::ge("level", 2)))?;
//! ```
//!
//! Lower layers can be used directly:
//!
//! ```rust,ignore
//! use dataaccess::database::{ConnectionHandle, DatabaseLocation, OpenOptions};
//!
//! let handle = ConnectionHandle::open(DatabaseLocation::file("/tmp/data.db"), &OpenOptions::default())?;
//! let count = handle.with_session(|s| s.execute_scalar("SELECT COUNT(*) FROM items", &[]))?;
//! ```

pub mod core;
pub mod executor;
pub mod mapper;
pub mod store;

pub use self::core::{
    validate_steps, AppliedMigration, ConnectionHandle, ConnectionManager, DatabaseLocation,
    FileLock, FileLockGuard, LockKind, LockPolicy, ManagerConfig, MigrationReport, MigrationStep,
    OpenMode, OpenOptions, PooledConnection, RetryPolicy, SchemaDefinitions, SchemaManager,
    SchemaStatus, Session, ThreadMode,
};
pub use executor::{PreparedStatement, RecordStream, TransactionMode};
pub use mapper::{
    ColumnType, EngineObject, EngineValue, FieldKind, FieldSpec, Record, Shape, Value,
};
pub use store::{
    Comparison, DataStore, Entity, Filter, Order, Pending, Query, StoreWorker,
};
