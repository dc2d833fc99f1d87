use anyhow::Result;
use clap::Args;
use dataaccess::database::OpenMode;
use dataaccess::DataAccessConfig;
use serde_json::Value as JsonValue;

use super::{open_database, print_json, records_table};

/// Arguments for the Query command
#[derive(Args)]
pub struct QueryArgs {
    /// SQL query; only read-only statements are accepted
    #[clap(value_name = "SQL")]
    pub sql: String,

    /// Stop after this many records
    #[clap(short, long)]
    pub limit: Option<usize>,
}

pub fn run(config: &DataAccessConfig, args: QueryArgs, json: bool) -> Result<()> {
    let QueryArgs { sql, limit } = args;
    let handle = open_database(config, OpenMode::ReadOnly)?;

    let (columns, records) = handle.with_session(|s| {
        let mut stmt = s.prepare(&sql)?;
        let columns = stmt.columns().to_vec();
        let records = stmt
            .execute(&[])?
            .take(limit.unwrap_or(usize::MAX))
            .collect::<dataaccess::Result<Vec<_>>>()?;
        Ok((columns, records))
    })?;
    handle.close()?;

    if json {
        let rows = records.iter().map(|r| r.to_json()).collect::<Vec<_>>();
        return print_json(&JsonValue::Array(rows));
    }

    if records.is_empty() {
        println!("(no records)");
    } else {
        println!("{}", records_table(&columns, &records));
        println!("{} record(s)", records.len());
    }
    Ok(())
}
