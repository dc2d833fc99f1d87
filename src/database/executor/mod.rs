//! Statement executor
//!
//! Statement execution and transaction control are implemented directly on
//! [`Session`](crate::database::Session), so everything that runs SQL goes
//! through the session's file lock and transaction state.

mod statement;
mod transaction;

pub use statement::{PreparedStatement, RecordStream};
pub use transaction::TransactionMode;
pub(crate) use transaction::{TransactionOwner, TransactionState};
