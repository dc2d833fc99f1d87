use anyhow::Result;
use dataaccess::database::mapper::quote_ident;
use dataaccess::database::{OpenMode, SchemaManager};
use dataaccess::DataAccessConfig;
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use super::{open_database, print_json};

#[derive(Debug, Serialize, Tabled)]
struct TableInfo {
    table: String,
    rows: i64,
}

#[derive(Debug, Serialize)]
struct DatabaseStatus {
    path: String,
    size_bytes: Option<u64>,
    schema_version: u32,
    tables: Vec<TableInfo>,
}

pub fn run(config: &DataAccessConfig, json: bool) -> Result<()> {
    let sqlite_path = config.sqlite_path();
    if !sqlite_path.exists() {
        if json {
            return print_json(&serde_json::json!({
                "path": sqlite_path,
                "exists": false,
            }));
        }
        println!("Database {} does not exist yet", sqlite_path.display());
        return Ok(());
    }

    let handle = open_database(config, OpenMode::ReadOnly)?;
    let (schema_version, tables) = handle.with_session(|s| {
        let version = SchemaManager::new(s).current_version()?;
        let mut tables = Vec::new();
        for table in s.table_names()? {
            let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&table));
            let rows = s.execute_scalar(&sql, &[])?.as_i64().unwrap_or(0);
            tables.push(TableInfo { table, rows });
        }
        Ok((version, tables))
    })?;
    handle.close()?;

    let status = DatabaseStatus {
        path: sqlite_path.display().to_string(),
        size_bytes: std::fs::metadata(&sqlite_path).ok().map(|m| m.len()),
        schema_version,
        tables,
    };

    if json {
        return print_json(&serde_json::to_value(&status)?);
    }

    println!("Database:           {}", status.path);
    if let Some(size) = status.size_bytes {
        println!("Size:               {} bytes", size);
    }
    println!("Schema Version:     {}", status.schema_version);
    if status.tables.is_empty() {
        println!("Tables:             (none)");
    } else {
        println!("{}", Table::new(status.tables).with(Style::rounded()));
    }
    Ok(())
}
