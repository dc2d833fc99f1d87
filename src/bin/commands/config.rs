use anyhow::Result;
use dataaccess::DataAccessConfig;
use serde_json::json;

use super::print_json;

pub fn run(config: &DataAccessConfig, json: bool) -> Result<()> {
    if json {
        return print_json(&json!({
            "config_file": DataAccessConfig::config_file_path(),
            "sqlite_path": config.sqlite_path(),
            "settings": config,
        }));
    }

    println!("Config File:        {}", DataAccessConfig::config_file_path());
    println!("{}", config.summary());
    Ok(())
}
