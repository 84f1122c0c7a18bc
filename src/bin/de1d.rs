use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use de1d::{config, daemon, paths};

/// Mediator daemon for a DE1 espresso machine and its BLE peripherals.
#[derive(Parser, Debug)]
#[command(name = "de1d", version, about)]
struct Cli {
    /// Configuration file (YAML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the history store location.
    #[arg(long)]
    database: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(paths::default_config_path);
    let mut cfg = config::load_or_default(&config_path);
    if let Some(db) = cli.database {
        cfg.database.filename = db;
    }

    match daemon::run(cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("de1d: {e}");
            ExitCode::FAILURE
        }
    }
}
