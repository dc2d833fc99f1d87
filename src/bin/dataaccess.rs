use clap::{Parser, Subcommand};
use dataaccess::DataAccessConfig;
use tracing::Level;

mod commands;

use commands::exec::ExecArgs;
use commands::query::QueryArgs;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// configuration file path, by default the platform config dir is used
    #[clap(short, long)]
    config: Option<String>,

    /// Print debug information
    #[clap(long)]
    debug: bool,

    /// Print results as JSON
    #[clap(long, global = true)]
    json: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the database location, schema version and tables
    Status,

    /// Run a query and print the resulting records
    Query(QueryArgs),

    /// Run a statement that does not return rows
    Exec(ExecArgs),

    /// List applied schema migrations
    History,

    /// Show the active configuration
    Config,
}

fn main() {
    let cli = Cli::parse();

    if cli.debug {
        tracing_subscriber::fmt()
            // filter spans/events with level DEBUG or higher.
            .with_max_level(Level::DEBUG)
            .init();
    }

    let config = match DataAccessConfig::new(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Status => commands::status::run(&config, cli.json),
        Commands::Query(args) => commands::query::run(&config, args, cli.json),
        Commands::Exec(args) => commands::exec::run(&config, args, cli.json),
        Commands::History => commands::history::run(&config, cli.json),
        Commands::Config => commands::config::run(&config, cli.json),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
