pub mod config;
pub mod exec;
pub mod history;
pub mod query;
pub mod status;

use std::sync::Arc;

use anyhow::Result;
use dataaccess::database::{
    ConnectionHandle, ConnectionManager, DatabaseLocation, OpenMode, Record,
};
use dataaccess::DataAccessConfig;
use tabled::builder::Builder;
use tabled::settings::Style;

/// Open the configured database file for a single command
pub(crate) fn open_database(
    config: &DataAccessConfig,
    mode: OpenMode,
) -> Result<Arc<ConnectionHandle>> {
    let manager = ConnectionManager::new(config.manager_config());
    let options = config.open_options().mode(mode);
    Ok(manager.open(DatabaseLocation::file(config.sqlite_path()), &options)?)
}

pub(crate) fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Render records as a table, NULL cells shown as `NULL`
pub(crate) fn records_table(columns: &[String], records: &[Record]) -> String {
    let mut builder = Builder::default();
    builder.push_record(columns.iter().cloned());
    for record in records {
        builder.push_record(record.values().iter().map(|v| {
            if v.is_null() {
                "NULL".to_string()
            } else {
                v.to_string()
            }
        }));
    }
    builder.build().with(Style::rounded()).to_string()
}
