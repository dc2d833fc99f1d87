#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! DataAccess - embedded SQLite data access for host applications
//!
//! DataAccess lets application code read and write structured data through an
//! embedded SQLite database without stalling the threads that drive the
//! application. It can be used as a library or through the `dataaccess`
//! admin binary.
//!
//! # Feature Flags
//!
//! | Feature | Description | Key Dependencies |
//! |---------|-------------|------------------|
//! | (none) | Library: connections, statements, mapping, migrations, store | `rusqlite`, `parking_lot` |
//! | `cli` | Admin binary (default) | `clap`, `tabled`, `tracing-subscriber` |
//!
//! ```toml
//! # Library only
//! dataaccess = { version = "0.3", default-features = false }
//! ```
//!
//! # Architecture
//!
//! - **[`database`]**: all database functionality
//!   - `core`: connections, file locks, pooling, schema migration
//!   - `executor`: prepared statements, record streams, transactions
//!   - `mapper`: rows, records and typed value objects
//!   - `store`: the [`DataStore`] facade and [`StoreWorker`]
//! - **[`config`]**: configuration loading
//! - **[`error`]**: the error taxonomy shared by every layer
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use dataaccess::{DataAccessConfig, DataStore};
//! use dataaccess::database::MigrationStep;
//!
//! const STEPS: &[MigrationStep] = &[MigrationStep::new(
//!     1,
//!     "create scores",
//!     "CREATE TABLE scores (id INTEGER PRIMARY KEY, player TEXT NOT NULL, points INTEGER NOT NULL)",
//! )];
//!
//! let config = DataAccessConfig::new(&None)?;
//! let store = DataStore::from_config(&config, STEPS)?;
//! store.execute("INSERT INTO scores (player, points) VALUES (?1, ?2)", &["ada".into(), 42.into()])?;
//! ```
//!
//! ## Keeping work off the calling thread
//!
//! ```rust,ignore
//! use dataaccess::{DataStore, StoreWorker};
//!
//! let worker = StoreWorker::spawn(move || DataStore::from_config(&config, STEPS))?;
//! let pending = worker.submit(|store| store.scalar("SELECT COUNT(*) FROM scores", &[]));
//! // ... later, without blocking:
//! if let Some(result) = pending.try_take() {
//!     println!("{}", result?);
//! }
//! ```

pub mod config;
pub mod database;
pub mod error;

pub use config::DataAccessConfig;
pub use database::{
    ConnectionHandle, ConnectionManager, DataStore, DatabaseLocation, Entity, Filter,
    MigrationStep, Query, Record, Shape, StoreWorker, Value,
};
pub use error::{DataAccessError, ExecutionFailure, Result};
