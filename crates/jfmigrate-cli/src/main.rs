//! jfmigrate - command-line front end for the Jellyfin migration engine.
//!
//! Loads a migration configuration, wires Ctrl-C to the engine's cancellation
//! token and writes every log record to the console and, optionally, to an
//! append-only audit log.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use jfmigrate_core::{
    derive_item_id, CancellationToken, DerivationContext, IdKind, MigrationConfig, Migrator,
};

#[derive(Parser, Debug)]
#[command(name = "jfmigrate")]
#[command(about = "Move a Jellyfin installation to a new filesystem layout")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run all migration phases
    Run {
        /// Migration configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Append an audit log of every change to this file
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Write the audit log as JSON lines
        #[arg(long, requires = "log_file")]
        json_log: bool,

        /// Where to keep the ledger and identifier map
        #[arg(long)]
        state_dir: Option<PathBuf>,

        /// Enable debug logging on the console
        #[arg(short, long)]
        debug: bool,
    },

    /// Load and validate a configuration without touching any file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the identifier the server derives for an item
    DeriveId {
        /// Full item type name, e.g. MediaBrowser.Controller.Entities.Movies.Movie
        #[arg(long = "type")]
        item_type: String,

        /// Item path as the server stores it
        #[arg(long)]
        path: String,

        /// Program-data directory as the server stores it
        #[arg(long)]
        program_data: Option<String>,

        #[arg(long)]
        case_sensitive: bool,
    },
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            config,
            log_file,
            json_log,
            state_dir,
            debug,
        } => {
            init_logging(debug, log_file.as_ref(), json_log)?;
            run(&config, state_dir)
        }
        Command::Validate { config } => {
            init_logging(false, None, false)?;
            let loaded = MigrationConfig::from_file(&config)?;
            println!(
                "{} is valid: {} path jobs, {} identifier path jobs, {} identifier jobs",
                config.display(),
                loaded.jobs.paths.len(),
                loaded.jobs.id_paths.len(),
                loaded.jobs.ids.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::DeriveId {
            item_type,
            path,
            program_data,
            case_sensitive,
        } => {
            let ctx = DerivationContext {
                program_data_path: program_data.as_deref(),
                case_sensitive,
            };
            let id = derive_item_id(&item_type, &path, ctx);
            for kind in IdKind::ALL {
                println!("{:<18} {}", kind.as_str(), id.encode_text(kind));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run(config_path: &PathBuf, state_dir: Option<PathBuf>) -> Result<ExitCode> {
    let config = MigrationConfig::from_file(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("Interrupt received, stopping after the current file");
        handler_token.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;

    let mut migrator = Migrator::new(&config, cancel);
    if let Some(dir) = state_dir {
        migrator = migrator.with_state_dir(dir);
    }
    info!("Run state kept in {}", migrator.state_dir().display());

    let summary = migrator.run()?;

    println!("{summary}");
    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Console layer at INFO (DEBUG with `--debug`); the audit file always gets
/// DEBUG and is appended to, never truncated.
fn init_logging(debug: bool, log_file: Option<&PathBuf>, json: bool) -> Result<()> {
    let console_level = if debug { Level::DEBUG } else { Level::INFO };
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(LevelFilter::from_level(console_level));

    let (text_file, json_file) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let writer = Mutex::new(file);
            if json {
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_filter(LevelFilter::DEBUG);
                (None, Some(layer))
            } else {
                let layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(writer)
                    .with_filter(LevelFilter::DEBUG);
                (Some(layer), None)
            }
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(text_file)
        .with(json_file)
        .init();
    Ok(())
}
