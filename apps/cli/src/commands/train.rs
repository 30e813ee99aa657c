//! `stagewise train`: build an engine from a configuration file and run it.
//!
//! The CLI always runs one worker. Multi-worker runs embed the engine and
//! hand each worker its own communicator.

use crate::{demo, logging};
use anyhow::{Context, Result};
use colored::Colorize;
use stagewise_engine::{CheckpointSource, EngineBuilder, EngineConfig, SingleProcess};
use std::path::{Path, PathBuf};
use tracing::info;

/// Buffer keys shown in the closing summary when present.
const SUMMARY_KEYS: &[&str] = &["loss", "lr", "val_mse", "val_mae"];

pub fn execute(
    config_path: &Path,
    resume: Option<String>,
    work_dir: Option<PathBuf>,
    log_level: Option<&str>,
) -> Result<()> {
    let mut config = EngineConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if work_dir.is_some() {
        config.work_dir = work_dir;
    }

    let level = log_level.unwrap_or(&config.log_level);
    let _guard = logging::init_logging(level, config.log_file.as_deref())?;

    let components = demo::components()?;
    let mut engine = EngineBuilder::from_config(&config, components)?.communicator(SingleProcess).build()?;

    if let Some(source) = resume.or_else(|| config.resume_from.clone()) {
        let report = engine.resume(&CheckpointSource::parse(&source))?;
        info!(?report, "Restored run state");
        if report.checksum_mismatch {
            eprintln!("{} checkpoint checksum does not match its weights", "warning:".yellow().bold());
        }
    }

    engine.launch()?;

    let ctx = engine.context();
    println!();
    println!("{}", "Training complete".green().bold());
    println!("  Stages: {}", ctx.max_stages().to_string().cyan());
    println!("  Epochs: {}", ctx.epoch().to_string().cyan());
    println!("  Iterations: {}", ctx.iter().to_string().cyan());
    for key in SUMMARY_KEYS {
        if let Ok(value) = ctx.buffer().latest(key) {
            println!("  {key}: {}", format!("{:.6}", value.mean()).cyan());
        }
    }
    if let Some(dir) = ctx.work_dir() {
        println!("  Work dir: {}", dir.display().to_string().dimmed());
    }
    Ok(())
}
