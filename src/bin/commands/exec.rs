use anyhow::Result;
use clap::Args;
use dataaccess::database::OpenMode;
use dataaccess::DataAccessConfig;
use serde_json::json;

use super::{open_database, print_json};

/// Arguments for the Exec command
#[derive(Args)]
pub struct ExecArgs {
    /// SQL statement to run
    #[clap(value_name = "SQL")]
    pub sql: String,

    /// Treat SQL as a script of several statements
    #[clap(long)]
    pub batch: bool,
}

pub fn run(config: &DataAccessConfig, args: ExecArgs, json: bool) -> Result<()> {
    let ExecArgs { sql, batch } = args;
    let handle = open_database(config, OpenMode::Create)?;

    let affected = handle.with_session(|s| {
        if batch {
            s.execute_batch(&sql).map(|_| None)
        } else {
            s.execute_non_query(&sql, &[]).map(Some)
        }
    })?;
    handle.close()?;

    if json {
        return print_json(&json!({ "affected_rows": affected }));
    }
    match affected {
        Some(n) => println!("{} row(s) affected", n),
        None => println!("script executed"),
    }
    Ok(())
}
