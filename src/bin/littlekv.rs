//! littlekv interactive shell.
//!
//! Loads the JSON configuration, installs the log file sink, opens the
//! database and runs the command shell on stdin/stdout.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use littlekv::{Db, DbConfig, config, logging, shell};
use tracing::{error, info, warn};

/// littlekv shell
#[derive(Parser, Debug)]
#[command(name = "littlekv")]
#[command(about = "Embedded LSM key-value store with an interactive shell")]
#[command(version)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_filter: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let (cfg, config_error) = match config::try_load(&args.config) {
        Ok(cfg) => (cfg, None),
        Err(e) => (DbConfig::default(), Some(e)),
    };

    if let Err(e) = logging::init(&cfg.log_dir, &args.log_filter) {
        eprintln!("failed to initialize logging: {e}");
    }
    if let Some(e) = config_error {
        warn!(path = %args.config.display(), "failed to load config, using defaults: {e}");
    }

    let db = match Db::open(cfg) {
        Ok(db) => db,
        Err(e) => {
            error!("failed to open database: {e}");
            eprintln!("failed to open database: {e}");
            logging::flush();
            return ExitCode::FAILURE;
        }
    };
    info!("littlekv started");

    println!("littlekv: welcome! type 'help' for commands");
    let stdin = io::stdin();
    let result = shell::run(&db, &mut stdin.lock(), &mut io::stdout().lock());

    if let Err(e) = db.close() {
        error!("failed to close database: {e}");
    }
    logging::flush();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("shell I/O error: {e}");
            ExitCode::FAILURE
        }
    }
}
