//! Stagewise CLI - run, plan and inspect multi-stage training schedules.
//!
//! The `stagewise` binary builds an engine from a TOML, YAML or JSON
//! configuration using the bundled toy regression components.

mod commands;
mod demo;
mod logging;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

/// Stagewise - multi-stage training orchestration
#[derive(Parser, Debug)]
#[command(name = "stagewise", author, version, about = "Stagewise - multi-stage training orchestration")]
struct Args {
    /// Log filter (trace, debug, info, warn, error or an EnvFilter directive).
    /// Overrides `log_level` from the configuration.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every stage of a configuration
    ///
    /// Environment variables prefixed with `STAGEWISE__` override
    /// configuration keys, e.g. `STAGEWISE__SEED=7`.
    Train {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Checkpoint file, checkpoint directory or URL to resume from
        #[arg(long)]
        resume: Option<String>,

        /// Directory for checkpoints and metric logs (overrides `work_dir`)
        #[arg(short, long)]
        work_dir: Option<PathBuf>,
    },

    /// Show a checkpoint's position, provenance and stage plan
    Inspect {
        /// Checkpoint file, directory (latest epoch) or URL
        checkpoint: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the stage boundaries a configuration describes
    Schedule {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let result = match args.command {
        Command::Train { config, resume, work_dir } => {
            commands::train::execute(&config, resume, work_dir, args.log_level.as_deref())
        }
        Command::Inspect { checkpoint, json } => commands::inspect::execute(&checkpoint, json),
        Command::Schedule { config } => commands::schedule::execute(&config),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
