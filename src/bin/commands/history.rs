use anyhow::Result;
use dataaccess::database::{OpenMode, SchemaManager};
use dataaccess::DataAccessConfig;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use super::{open_database, print_json};

#[derive(Tabled)]
struct HistoryRow {
    version: u32,
    description: String,
    applied_at: String,
}

pub fn run(config: &DataAccessConfig, json: bool) -> Result<()> {
    let handle = open_database(config, OpenMode::ReadOnly)?;
    let history = handle.with_session(|s| SchemaManager::new(s).history())?;
    handle.close()?;

    if json {
        return print_json(&serde_json::to_value(&history)?);
    }

    if history.is_empty() {
        println!("no migrations applied");
        return Ok(());
    }
    let rows = history
        .into_iter()
        .map(|m| HistoryRow {
            version: m.version,
            description: m.description,
            applied_at: m.applied_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        })
        .collect::<Vec<_>>();
    println!("{}", Table::new(rows).with(Style::rounded()));
    Ok(())
}
